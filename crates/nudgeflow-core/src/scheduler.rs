//! Cooperative timer ownership
//!
//! Every periodic job in the engine (idle polling per surface, ambient
//! ticks) is registered here under a key, so teardown is a single
//! [`Scheduler::shutdown`] call instead of many scattered handles.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Owns all periodic timers, keyed by subscriber
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `period` until cancelled. The first run happens one
    /// period after registration. Registering an existing key replaces
    /// (and cancels) the previous timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn every<F>(&self, key: impl Into<String>, period: Duration, mut job: F)
    where
        F: FnMut() + Send + 'static,
    {
        let key = key.into();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() yields immediately on the first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                job();
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.insert(key.clone(), handle) {
            previous.abort();
            log::debug!("Replaced timer {key}");
        }
    }

    /// Cancel one timer. Returns whether a timer was registered under `key`.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match removed {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel every timer
    pub fn shutdown(&self) {
        let drained: Vec<_> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            log::debug!("Cancelling {} timers", drained.len());
        }
        for (_, handle) in drained {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
