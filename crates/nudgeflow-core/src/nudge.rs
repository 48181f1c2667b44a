//! Nudges, micro-flows and the live board presentation reads from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::config::capped_seconds;

/// Closed taxonomy of coaching interventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeType {
    StartSmall,
    AvoidSwitching,
    TakeMicroBreak,
    Hesitation,
    OverEdit,
    Stall,
    TaskSwitchingExcessive,
}

impl NudgeType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StartSmall => "start_small",
            Self::AvoidSwitching => "avoid_switching",
            Self::TakeMicroBreak => "take_micro_break",
            Self::Hesitation => "hesitation",
            Self::OverEdit => "over_edit",
            Self::Stall => "stall",
            Self::TaskSwitchingExcessive => "task_switching_excessive",
        }
    }
}

impl fmt::Display for NudgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A short-lived coaching prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nudge {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub nudge_type: NudgeType,
    pub message: String,
    /// Task the nudge is about, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Time to live in seconds
    pub ttl_secs: u64,
}

impl Nudge {
    #[must_use]
    pub fn new(
        nudge_type: NudgeType,
        message: String,
        created_at: DateTime<Utc>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            nudge_type,
            message,
            subject_id: None,
            created_at,
            ttl_secs,
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject_id: Option<String>) -> Self {
        self.subject_id = subject_id;
        self
    }

    /// Expiry instant; TTLs are capped at one day
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(capped_seconds(self.ttl_secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Live nudges: at most one per type, last write wins
#[derive(Debug, Default)]
pub struct NudgeBoard {
    live: HashMap<NudgeType, Nudge>,
}

impl NudgeBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a nudge, replacing any live nudge of the same type.
    /// Returns the replaced nudge, if any.
    pub fn publish(&mut self, nudge: Nudge) -> Option<Nudge> {
        let replaced = self.live.insert(nudge.nudge_type, nudge);
        if let Some(old) = &replaced {
            log::debug!("Replaced live {} nudge {}", old.nudge_type, old.id);
        }
        replaced
    }

    /// Dismiss by id. Returns whether a nudge was removed.
    pub fn dismiss(&mut self, id: Uuid) -> bool {
        let before = self.live.len();
        self.live.retain(|_, nudge| nudge.id != id);
        self.live.len() != before
    }

    /// Drop expired nudges, returning how many were removed
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.live.len();
        self.live.retain(|_, nudge| !nudge.is_expired(now));
        before - self.live.len()
    }

    /// Unexpired nudges, newest first
    #[must_use]
    pub fn live(&self, now: DateTime<Utc>) -> Vec<Nudge> {
        let mut nudges: Vec<Nudge> = self
            .live
            .values()
            .filter(|nudge| !nudge.is_expired(now))
            .cloned()
            .collect();
        nudges.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        nudges
    }

    /// The single nudge the toast surface shows: the most recently created
    /// unexpired one across all types
    #[must_use]
    pub fn visible(&self, now: DateTime<Utc>) -> Option<Nudge> {
        self.live
            .values()
            .filter(|nudge| !nudge.is_expired(now))
            .max_by_key(|nudge| nudge.created_at)
            .cloned()
    }
}

/// A transient, dismissible suggestion of small next steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroFlow {
    pub id: Uuid,
    pub title: String,
    pub steps: Vec<String>,
}

impl MicroFlow {
    #[must_use]
    pub fn new(title: String, steps: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            steps,
        }
    }
}

/// Holds at most one micro-flow; a new suggestion replaces the old one
#[derive(Debug, Default)]
pub struct MicroFlowSlot {
    current: Option<MicroFlow>,
}

impl MicroFlowSlot {
    pub fn offer(&mut self, micro_flow: MicroFlow) {
        self.current = Some(micro_flow);
    }

    /// Dismiss by id. Returns whether the held micro-flow was removed.
    pub fn dismiss(&mut self, id: Uuid) -> bool {
        if self.current.as_ref().is_some_and(|mf| mf.id == id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&MicroFlow> {
        self.current.as_ref()
    }
}
