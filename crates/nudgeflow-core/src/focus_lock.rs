//! Focus Lock
//!
//! Single-slot mutual exclusion over "the task the user may not leave".
//! The writer half ([`FocusLock`]) is owned by the flow runner and is not
//! `Clone`; everything else observes the lock through [`FocusLockView`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::LockError;

/// Observable lock state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusLockState {
    pub task_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl FocusLockState {
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.task_id.is_some()
    }

    /// Whether `task_id` currently holds the lock
    #[must_use]
    pub fn is_held_by(&self, task_id: &str) -> bool {
        self.task_id.as_deref() == Some(task_id)
    }
}

/// Result of a release attempt. Releasing never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// A different task holds the lock; nothing changed
    NotOwner,
    /// Nothing was locked
    NotLocked,
}

/// Writer handle, held only by the flow runner
#[derive(Debug, Default)]
pub struct FocusLock {
    state: Arc<RwLock<FocusLockState>>,
}

impl FocusLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A read-only view sharing this lock's state
    #[must_use]
    pub fn view(&self) -> FocusLockView {
        FocusLockView {
            state: Arc::clone(&self.state),
        }
    }

    /// Lock `task_id`. Re-acquiring the current holder is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyLocked`] if a different task holds the lock.
    /// The existing lock is left untouched.
    pub fn acquire(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<(), LockError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.task_id.as_deref() {
            Some(held) if held == task_id => Ok(()),
            Some(held) => Err(LockError::AlreadyLocked {
                held: held.to_string(),
                requested: task_id.to_string(),
            }),
            None => {
                state.task_id = Some(task_id.to_string());
                state.locked_at = Some(now);
                log::debug!("Focus lock acquired by {task_id}");
                Ok(())
            }
        }
    }

    /// Release the lock if `task_id` holds it
    pub fn release(&mut self, task_id: &str) -> ReleaseOutcome {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.task_id.as_deref() {
            None => ReleaseOutcome::NotLocked,
            Some(held) if held != task_id => ReleaseOutcome::NotOwner,
            Some(_) => {
                *state = FocusLockState::default();
                log::debug!("Focus lock released by {task_id}");
                ReleaseOutcome::Released
            }
        }
    }

    /// Clear the lock regardless of holder
    pub fn clear(&mut self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = FocusLockState::default();
    }

    #[must_use]
    pub fn snapshot(&self) -> FocusLockState {
        self.view().snapshot()
    }
}

/// Read-only, cloneable view of the focus lock
#[derive(Debug, Clone)]
pub struct FocusLockView {
    state: Arc<RwLock<FocusLockState>>,
}

impl FocusLockView {
    #[must_use]
    pub fn snapshot(&self) -> FocusLockState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.snapshot().is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let mut lock = FocusLock::new();
        let now = Utc::now();

        assert!(lock.acquire("task-1", now).is_ok());
        let state = lock.snapshot();
        assert!(state.is_held_by("task-1"));
        assert_eq!(state.locked_at, Some(now));

        assert_eq!(lock.release("task-1"), ReleaseOutcome::Released);
        assert!(!lock.snapshot().is_locked());
    }

    #[test]
    fn test_acquire_conflict_keeps_existing_holder() {
        let mut lock = FocusLock::new();
        lock.acquire("task-1", Utc::now()).unwrap();

        let err = lock.acquire("task-2", Utc::now()).unwrap_err();
        assert_eq!(
            err,
            LockError::AlreadyLocked {
                held: "task-1".to_string(),
                requested: "task-2".to_string(),
            }
        );
        assert!(lock.snapshot().is_held_by("task-1"));
    }

    #[test]
    fn test_reacquire_same_task_is_idempotent() {
        let mut lock = FocusLock::new();
        let first = Utc::now();
        lock.acquire("task-1", first).unwrap();
        lock.acquire("task-1", first + chrono::Duration::seconds(5))
            .unwrap();

        assert_eq!(lock.snapshot().locked_at, Some(first));
    }

    #[test]
    fn test_release_by_non_owner_is_noop() {
        let mut lock = FocusLock::new();
        assert_eq!(lock.release("task-1"), ReleaseOutcome::NotLocked);

        lock.acquire("task-1", Utc::now()).unwrap();
        assert_eq!(lock.release("task-2"), ReleaseOutcome::NotOwner);
        assert!(lock.snapshot().is_held_by("task-1"));
    }

    #[test]
    fn test_view_observes_writer() {
        let mut lock = FocusLock::new();
        let view = lock.view();
        assert!(!view.is_locked());

        lock.acquire("task-9", Utc::now()).unwrap();
        assert!(view.snapshot().is_held_by("task-9"));

        lock.clear();
        assert!(!view.is_locked());
    }
}
