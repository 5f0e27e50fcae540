//! relaycam demo launcher: synthetic capture device plus an in-process client

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use relaycam::pipeline::{BufferState, StreamState};
use relaycam::{CaptureDevice, Config, PipelineError};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("relaycam launching...");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    debug!(?config, "configuration loaded");

    let device = Arc::new(CaptureDevice::new(&config)?);
    let caps = device.capabilities();
    let format = device.negotiate_format();
    info!(
        card = caps.card,
        bus = %caps.bus_info,
        width = format.width,
        height = format.height,
        format = format.pixel_format.description(),
        "device opened"
    );

    let count = device.configure_buffers(config.client.buffer_count)?;
    for index in 0..count {
        device.enqueue(index)?;
    }
    device.stream_on()?;

    let client = {
        let device = Arc::clone(&device);
        tokio::task::spawn_blocking(move || client_loop(&device))
    };

    let run_for = config.client.run_for_secs;
    let deadline = async {
        if run_for == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(run_for)).await
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("interrupted");
        }
        _ = deadline => info!(run_for, "run time elapsed"),
    }

    device.stream_off()?;
    let received = client.await?;

    // Whatever the client did not pick up before the stop
    let mut leftover = 0;
    while let Ok(buf) = device.dequeue() {
        debug!(index = buf.index, state = ?buf.state, "buffer returned");
        leftover += 1;
    }
    device.release_buffers()?;

    let stats = device.stats();
    info!(received, leftover, ?stats, "relaycam shutting down");
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaycam=debug"));
    let fmt =
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());

    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

/// Dequeue, log and hand back buffers until the stream stops.
fn client_loop(device: &CaptureDevice) -> u64 {
    let mut received = 0u64;
    let mut last_frame: Option<u64> = None;

    loop {
        let buf = match device.dequeue() {
            Ok(buf) => buf,
            Err(PipelineError::Cancelled | PipelineError::NotStreaming) => break,
            Err(e) => {
                warn!(error = %e, "dequeue failed");
                break;
            }
        };

        if buf.state == BufferState::Error {
            debug!(index = buf.index, "buffer aborted");
            break;
        }
        received += 1;

        if let Some(prev) = last_frame {
            let gap = buf.frame_number.saturating_sub(prev + 1);
            if gap > 0 {
                debug!(gap, frame_number = buf.frame_number, "frames dropped upstream");
            }
        }
        last_frame = Some(buf.frame_number);
        debug!(
            index = buf.index,
            sequence = buf.sequence,
            frame_number = buf.frame_number,
            bytes = buf.length,
            "frame received"
        );

        if device.state() != StreamState::Streaming {
            break;
        }
        if let Err(e) = device.enqueue(buf.index) {
            warn!(index = buf.index, error = %e, "re-enqueue failed");
            break;
        }
    }
    info!(received, "client loop done");
    received
}
