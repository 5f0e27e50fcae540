//! Periodic frame trigger
//!
//! A timer thread ticks at the frame period and hands each tick to a worker
//! thread through a one-slot channel. The timer never runs the triggered work
//! itself and never waits on it: a tick that finds the worker busy is counted
//! as an overrun and skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self as cb, select};
use flume::TrySendError;
use tracing::{debug, error, info, trace};

use crate::error::{PipelineError, Result};

pub struct FrameSource {
    running: Option<Running>,
    stats: Arc<Stats>,
}

struct Running {
    stop_tx: cb::Sender<()>,
    timer: JoinHandle<()>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct Stats {
    fired: AtomicU64,
    overruns: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Ticks handed to the worker
    pub fired: u64,
    /// Ticks skipped because the worker was still busy
    pub overruns: u64,
}

impl FrameSource {
    pub fn new() -> Self {
        Self {
            running: None,
            stats: Arc::new(Stats::default()),
        }
    }

    /// Start firing `work` every `period` on a dedicated worker thread.
    pub fn start<F>(&mut self, period: Duration, mut work: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        if self.running.is_some() {
            return Err(PipelineError::AlreadyStreaming);
        }
        if period.is_zero() {
            return Err(PipelineError::InvalidArgument(
                "frame period must be non-zero".into(),
            ));
        }

        let (trigger_tx, trigger_rx) = flume::bounded::<Instant>(1);

        let worker = thread::Builder::new()
            .name("capture-worker".into())
            .spawn(move || {
                while let Ok(fired_at) = trigger_rx.recv() {
                    trace!(lag_us = fired_at.elapsed().as_micros() as u64, "trigger");
                    work();
                }
                debug!("capture worker exiting");
            })
            .map_err(|e| PipelineError::Spawn("capture", e.to_string()))?;

        let (stop_tx, stop_rx) = cb::bounded::<()>(0);
        let stats = Arc::clone(&self.stats);

        let timer = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || {
                let ticker = cb::tick(period);
                loop {
                    select! {
                        recv(ticker) -> tick => {
                            let Ok(at) = tick else { break };
                            match trigger_tx.try_send(at) {
                                Ok(()) => {
                                    stats.fired.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(TrySendError::Full(_)) => {
                                    stats.overruns.fetch_add(1, Ordering::Relaxed);
                                    metrics::counter!("source_trigger_overruns").increment(1);
                                }
                                Err(TrySendError::Disconnected(_)) => break,
                            }
                        }
                        // Sender dropped on stop
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!("frame source timer exiting");
            });

        let timer = match timer {
            Ok(handle) => handle,
            Err(e) => {
                // The trigger sender died with the closure, so the worker exits
                let _ = worker.join();
                return Err(PipelineError::Spawn("frame source", e.to_string()));
            }
        };

        info!(period_us = period.as_micros() as u64, "frame source started");
        self.running = Some(Running {
            stop_tx,
            timer,
            worker,
        });
        Ok(())
    }

    /// Cancel future ticks and wait for triggered work in flight to finish.
    /// No work runs once this returns.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        drop(running.stop_tx);
        if running.timer.join().is_err() {
            error!("frame source timer panicked");
        }
        // Timer gone means the trigger channel is closed; the worker drains it
        if running.worker.join().is_err() {
            error!("capture worker panicked");
        }
        info!("frame source stopped");
    }

    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            fired: self.stats.fired.load(Ordering::Relaxed),
            overruns: self.stats.overruns.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
