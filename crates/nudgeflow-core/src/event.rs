//! Action events and the bounded recent-history buffer.
//!
//! Every signal the engine reacts to, whether it came from the activity
//! collector, a UI intent or the flow runner, is an immutable [`ActionEvent`].
//! The history keeps the recent ones around for rolling-window classification
//! and for the end-of-session debrief.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default number of events kept in memory
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Default retention window for archived events (2 hours)
pub const DEFAULT_RETENTION_SECS: u64 = 2 * 60 * 60;

pub const KIND_TASK_OPENED: &str = "task_opened";
pub const KIND_TASK_SWITCHED: &str = "task_switched";
pub const KIND_NOTE_IDLE: &str = "note_idle";
pub const KIND_EDIT_BURST: &str = "edit_burst";
pub const KIND_ACTIVITY_RESUMED: &str = "activity_resumed";
pub const KIND_SURFACE_FOCUS: &str = "surface_focus";
pub const KIND_SURFACE_BLUR: &str = "surface_blur";
pub const KIND_NUDGE_SHOWN: &str = "nudge_shown";
pub const KIND_SESSION_EVENT: &str = "session_event";
pub const KIND_TICK: &str = "tick";

/// A timestamped interaction signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl ActionEvent {
    #[must_use]
    pub fn new(kind: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            subject_id: None,
            timestamp,
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    #[must_use]
    pub fn with_subject_opt(mut self, subject_id: Option<String>) -> Self {
        self.subject_id = subject_id;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// The parsed kind of this event
    #[must_use]
    pub fn action_kind(&self) -> ActionKind {
        ActionKind::parse(&self.kind)
    }

    /// Read an unsigned integer field from the payload
    #[must_use]
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    /// Read a string field from the payload
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Closed set of event kinds the engine understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// User opened a task (payload may carry `estimateMinutes`)
    TaskOpened,
    /// User switched away from the active task to `subject_id`
    TaskSwitched,
    /// Surface went idle (`taskId`, `duration` in seconds)
    NoteIdle,
    /// A debounced run of keystrokes ended (`edits`, `deletions`)
    EditBurst,
    /// Input after a reported idle span (`idleSince`, `gapSecs`)
    ActivityResumed,
    SurfaceFocus,
    SurfaceBlur,
    /// A nudge was published (`type`)
    NudgeShown,
    /// Flow runner transition (`kind`, `sessionId`)
    SessionEvent,
    /// Periodic ambient classification
    Tick,
    /// Anything this engine does not recognise
    Other(String),
}

impl ActionKind {
    #[must_use]
    pub fn parse(kind: &str) -> Self {
        match kind {
            KIND_TASK_OPENED => Self::TaskOpened,
            KIND_TASK_SWITCHED => Self::TaskSwitched,
            KIND_NOTE_IDLE => Self::NoteIdle,
            KIND_EDIT_BURST => Self::EditBurst,
            KIND_ACTIVITY_RESUMED => Self::ActivityResumed,
            KIND_SURFACE_FOCUS => Self::SurfaceFocus,
            KIND_SURFACE_BLUR => Self::SurfaceBlur,
            KIND_NUDGE_SHOWN => Self::NudgeShown,
            KIND_SESSION_EVENT => Self::SessionEvent,
            KIND_TICK => Self::Tick,
            other => Self::Other(other.to_string()),
        }
    }
}

/// History shared between the engine and the flow runner
pub type SharedHistory = Arc<Mutex<EventHistory>>;

/// Bounded, time-limited buffer of recent events in arrival order
#[derive(Debug, Clone)]
pub struct EventHistory {
    events: VecDeque<ActionEvent>,
    capacity: usize,
    retention: Duration,
}

impl EventHistory {
    #[must_use]
    pub fn new(capacity: usize, retention: std::time::Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
            retention: Duration::from_std(retention).unwrap_or_else(|_| Duration::days(365)),
        }
    }

    /// Archive an event, dropping the oldest ones past capacity or retention
    pub fn push(&mut self, event: ActionEvent) {
        let now = event.timestamp;
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        self.prune(now);
    }

    /// Drop events older than the retention window relative to `now`
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return;
        };
        while self
            .events
            .front()
            .is_some_and(|event| event.timestamp < cutoff)
        {
            self.events.pop_front();
        }
    }

    /// Count events of `kind` in the window `(now - window, now]`
    #[must_use]
    pub fn count_within(&self, kind: &str, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.events
            .iter()
            .filter(|e| e.kind == kind && e.timestamp > cutoff && e.timestamp <= now)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionEvent> {
        self.events.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Copy of the buffered events
    #[must_use]
    pub fn to_vec(&self) -> Vec<ActionEvent> {
        self.events.iter().cloned().collect()
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new(
            DEFAULT_HISTORY_CAPACITY,
            std::time::Duration::from_secs(DEFAULT_RETENTION_SECS),
        )
    }
}
