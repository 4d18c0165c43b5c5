//! A minimal background controller: trigger, run, retry with bounded
//! backoff.
//!
//! The trigger is edge-sensitive. Triggers that arrive while a run is
//! executing coalesce into a single follow-up run, and a failed run
//! schedules its own retry after an exponentially growing, capped and
//! jittered backoff.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::sync::CancelToken;
use crate::types::errors::IpCacheError;

/// The backoff applied after the first failed run.
const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

//------------ Controller ----------------------------------------------------

struct TriggerState {
    triggered: bool,
    shutdown: bool,
}

struct ControllerInner {
    name: String,
    max_interval: Duration,
    state: Mutex<TriggerState>,
    cv: Condvar,
    cancel: CancelToken,
}

/// A named, long-lived worker thread serializing runs of one closure.
pub struct Controller {
    inner: Arc<ControllerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Spawns the worker. The closure is handed a cancellation token that
    /// fires on shutdown, so blocking runs exit promptly.
    pub fn spawn<F>(name: &str, max_interval: Duration, mut run: F) -> Self
    where
        F: FnMut(&CancelToken) -> Result<(), IpCacheError>
            + Send
            + 'static,
    {
        let inner = Arc::new(ControllerInner {
            name: name.to_string(),
            max_interval,
            state: Mutex::new(TriggerState {
                triggered: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
            cancel: CancelToken::new(),
        });

        let worker = inner.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.work(&mut run))
            // Thread spawning only fails when the system is out of
            // resources, in which case the agent is done for anyway.
            .expect("failed to spawn controller thread");

        Controller {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Requests a run. Idempotent; pending triggers coalesce.
    pub fn trigger(&self) {
        let mut state = self.inner.state.lock();
        state.triggered = true;
        self.inner.cv.notify_all();
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.cv.notify_all();
        }
        self.inner.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ControllerInner {
    fn work<F>(&self, run: &mut F)
    where
        F: FnMut(&CancelToken) -> Result<(), IpCacheError>,
    {
        let mut backoff = INITIAL_RETRY_INTERVAL;
        loop {
            {
                let mut state = self.state.lock();
                while !state.triggered && !state.shutdown {
                    self.cv.wait(&mut state);
                }
                if state.shutdown {
                    return;
                }
                state.triggered = false;
            }

            match run(&self.cancel) {
                Ok(()) => {
                    backoff = INITIAL_RETRY_INTERVAL;
                }
                Err(err) => {
                    warn!(
                        "controller {}: run failed, retrying in \
                         {:?}: {}",
                        self.name, backoff, err
                    );
                    let pause = with_jitter(backoff);
                    let mut state = self.state.lock();
                    if !state.shutdown {
                        let _ = self.cv.wait_for(&mut state, pause);
                    }
                    if state.shutdown {
                        return;
                    }
                    state.triggered = true;
                    backoff =
                        (backoff * 2).min(self.max_interval);
                    debug!(
                        "controller {}: retrying after backoff",
                        self.name
                    );
                }
            }
        }
    }
}

/// Adds up to 10% random jitter so retries from many agents spread out.
fn with_jitter(interval: Duration) -> Duration {
    let max_jitter = (interval.as_millis() as u64) / 10;
    if max_jitter == 0 {
        return interval;
    }
    let jitter = rand::rng().random_range(0..=max_jitter);
    interval + Duration::from_millis(jitter)
}
