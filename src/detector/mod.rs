// SPDX-License-Identifier: MPL-2.0

//! Background pollers for ambient desktop state. Each detector owns one
//! thread that runs a blocking probe on an interval and publishes the result
//! through a single atomic flag.

mod audio;
mod fullscreen;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use eyre::{WrapErr, eyre};

pub use audio::AudioDetector;
pub use fullscreen::FullscreenDetector;

/// How long shutdown waits for a probe that is still in flight.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Worker {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// A boolean observed by a background thread.
pub struct PollingDetector {
    name: &'static str,
    enabled: bool,
    state: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl PollingDetector {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: true,
            state: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Spawns the polling thread. `setup` runs on that thread and builds the
    /// probe, so the probe may hold connections that cannot cross threads.
    /// Returns once setup has finished, with its error if it failed.
    pub fn start<S, P>(&mut self, interval: Duration, setup: S) -> eyre::Result<()>
    where
        S: FnOnce() -> eyre::Result<P> + Send + 'static,
        P: FnMut() -> eyre::Result<bool> + 'static,
    {
        if self.worker.is_some() {
            return Ok(());
        }

        let name = self.name;
        let state = Arc::clone(&self.state);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(format!("{name}-detector"))
            .spawn(move || {
                let mut probe = match setup() {
                    Ok(probe) => {
                        _ = ready_tx.send(Ok(()));
                        probe
                    }
                    Err(why) => {
                        _ = ready_tx.send(Err(why));
                        return;
                    }
                };

                loop {
                    match probe() {
                        Ok(observed) => {
                            let previous = state.swap(observed, Ordering::Relaxed);
                            if previous != observed {
                                tracing::debug!(detector = name, observed, "state changed");
                            }
                        }
                        Err(why) => tracing::debug!(detector = name, ?why, "probe failed"),
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .wrap_err("failed to spawn detector thread")?;

        let setup_result = ready_rx
            .recv()
            .map_err(|_| eyre!("{name} detector thread exited during setup"))
            .and_then(|result| result);

        if let Err(why) = setup_result {
            _ = handle.join();
            return Err(why);
        }

        tracing::info!(detector = name, ?interval, "detector started");
        self.worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling resets the reported state immediately.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.state.store(false, Ordering::Relaxed);
        }
    }

    /// Last observed value. Never blocks.
    #[must_use]
    pub fn state(&self) -> bool {
        self.enabled && self.state.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Asks the thread to stop and waits up to [`JOIN_TIMEOUT`] for it. A
    /// probe stuck in its service call is left behind.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        _ = worker.stop.send(());

        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !worker.handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(detector = self.name, "detector thread did not stop in time, detaching");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }

        if worker.handle.join().is_err() {
            tracing::error!(detector = self.name, "detector thread panicked");
        } else {
            tracing::debug!(detector = self.name, "detector stopped");
        }
    }

    #[cfg(test)]
    pub(crate) fn shared_state(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.state)
    }
}

impl Drop for PollingDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests;
