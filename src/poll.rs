// SPDX-License-Identifier: Apache-2.0

use log::{debug, info};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Delay between poll cycles.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Warm-up delay after spawning the polling task, giving the module time to
/// deliver its first valid frame.
pub const WARMUP: Duration = Duration::from_secs(1);

/// Shared latest-reading slot plus the background task that fills it.
///
/// The slot lock is held only for the copy of a freshly decoded reading,
/// never across a blocking transport read. Cancellation is cooperative: the
/// task checks the token once per cycle and the frame readers check it
/// inside their retry loops, so `stop()` has bounded latency even on a dead
/// link.
pub struct Poller<R> {
    reading: Arc<Mutex<Option<R>>>,
    cancel: Option<Arc<AtomicBool>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: Clone + Send + 'static> Poller<R> {
    /// Create an idle poller with an empty reading slot.
    pub fn new() -> Poller<R> {
        Poller {
            reading: Arc::new(Mutex::new(None)),
            cancel: None,
            handle: None,
        }
    }

    /// Most recent published reading, None until the first poll cycle has
    /// completed.
    pub fn latest(&self) -> Option<R> {
        self.reading.lock().unwrap().clone()
    }

    /// Spawn the polling task. `poll` produces one decoded reading per
    /// call, or None when no frame was available; the task keeps calling it
    /// until a reading arrives or the token fires. Blocks the caller for
    /// the warm-up delay before returning.
    pub fn start<F>(&mut self, cancel: Arc<AtomicBool>, mut poll: F)
    where
        F: FnMut() -> Option<R> + Send + 'static,
    {
        if self.handle.is_some() {
            debug!("polling already running");
            return;
        }

        info!("radar polling started");
        cancel.store(false, Ordering::Relaxed);
        let reading = self.reading.clone();
        let stop = cancel.clone();
        self.handle = Some(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Some(value) = poll() {
                    // lock held only for the assignment
                    *reading.lock().unwrap() = Some(value);
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }));
        self.cancel = Some(cancel);
        thread::sleep(WARMUP);
    }

    /// Signal the polling task to stop and join it. A no-op when polling is
    /// not running. The token is cleared once the task has exited: it is
    /// shared with the link's retry loops, and leaving it set would fail
    /// every later command with `Cancelled`.
    pub fn stop(&mut self) {
        match self.handle.take() {
            Some(handle) => {
                info!("radar polling stopped");
                let cancel = self.cancel.take();
                if let Some(cancel) = &cancel {
                    cancel.store(true, Ordering::Relaxed);
                }
                let _ = handle.join();
                if let Some(cancel) = &cancel {
                    cancel.store(false, Ordering::Relaxed);
                }
            }
            None => debug!("stop() called but polling is not running, this is normal"),
        }
    }
}

impl<R: Clone + Send + 'static> Default for Poller<R> {
    fn default() -> Poller<R> {
        Poller::new()
    }
}
