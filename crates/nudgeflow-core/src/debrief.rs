//! Debrief Synthesizer
//!
//! Reduces a finished (or stopped) flow session and the recent event history
//! into a short summary. Categories without a signal contribute no lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::event::{ActionEvent, ActionKind};
use crate::flow::FlowSession;

/// End-of-session summary shown once, then discarded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDebrief {
    pub highlights: Vec<String>,
    pub insights: Vec<String>,
}

impl SessionDebrief {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.highlights.is_empty() && self.insights.is_empty()
    }
}

/// Format duration in human-readable form
fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;

    if hours > 0 {
        if minutes > 0 {
            format!("{hours}h {minutes}m")
        } else {
            format!("{hours}h")
        }
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{seconds}s")
    }
}

fn plural(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}

/// Surface and start of an idle episode, as reported by the collector
type EpisodeKey = (String, String);

fn episode_key(event: &ActionEvent) -> Option<EpisodeKey> {
    Some((
        event.payload_str("surface")?.to_string(),
        event.payload_str("idleSince")?.to_string(),
    ))
}

/// Signals gathered from the history since the session started
#[derive(Debug, Default)]
struct SessionSignals {
    longest_idle_secs: Option<u64>,
    task_switches: usize,
    nudges_shown: usize,
}

impl SessionSignals {
    fn collect<'a>(
        session: &FlowSession,
        history: impl IntoIterator<Item = &'a ActionEvent>,
    ) -> Self {
        let mut signals = Self::default();
        // episodes still open when the session ended run until its end
        let mut episodes: HashMap<EpisodeKey, u64> = HashMap::new();
        let mut unkeyed: Option<u64> = None;

        for event in history
            .into_iter()
            .filter(|e| e.timestamp >= session.started_at)
        {
            match event.action_kind() {
                ActionKind::NoteIdle => {
                    let Some(duration) = event.payload_u64("duration") else {
                        continue;
                    };
                    let gap = open_gap(event, session.ended_at)
                        .map_or(duration, |open| open.max(duration));
                    match episode_key(event) {
                        Some(key) => {
                            episodes.entry(key).or_insert(gap);
                        }
                        None => unkeyed = unkeyed.max(Some(gap)),
                    }
                }
                ActionKind::ActivityResumed => {
                    let gap = event.payload_u64("gapSecs");
                    if let (Some(key), Some(gap)) = (episode_key(event), gap) {
                        episodes.insert(key, gap);
                    }
                }
                ActionKind::TaskSwitched => signals.task_switches += 1,
                ActionKind::NudgeShown => signals.nudges_shown += 1,
                _ => {}
            }
        }

        signals.longest_idle_secs = episodes.into_values().max().max(unkeyed);
        signals
    }
}

/// Seconds from the start of an idle episode to the end of the session
fn open_gap(event: &ActionEvent, ended_at: Option<DateTime<Utc>>) -> Option<u64> {
    let since: DateTime<Utc> = event.payload_str("idleSince")?.parse().ok()?;
    u64::try_from((ended_at? - since).num_seconds()).ok()
}

/// Build the debrief for a terminal session
#[must_use]
pub fn synthesize<'a>(
    session: &FlowSession,
    history: impl IntoIterator<Item = &'a ActionEvent>,
) -> SessionDebrief {
    let highlights: Vec<String> = session
        .completed_task_ids
        .iter()
        .filter_map(|id| session.task(id))
        .map(|task| format!("Completed {} ({}m planned)", task.title, task.duration))
        .collect();

    let signals = SessionSignals::collect(session, history);
    let mut insights = Vec::new();

    let skipped = session.skipped_task_ids.len();
    if skipped > 0 {
        insights.push(format!("{} skipped", plural(skipped, "task", "tasks")));
    }

    let left = session.remaining_tasks();
    if left > 0 && left < session.sequence.len() {
        insights.push(format!(
            "Stopped early with {left} of {} tasks left",
            session.sequence.len()
        ));
    }

    if let Some(idle) = signals.longest_idle_secs {
        insights.push(format!("Longest idle gap: {}", format_duration(idle)));
    }

    if signals.task_switches > 0 {
        insights.push(format!(
            "{} during the session",
            plural(signals.task_switches, "task switch", "task switches")
        ));
    }

    if signals.nudges_shown > 0 {
        insights.push(format!(
            "{} shown",
            plural(signals.nudges_shown, "nudge", "nudges")
        ));
    }

    if !highlights.is_empty() {
        let covered: u32 = session
            .completed_task_ids
            .iter()
            .filter_map(|id| session.task(id))
            .map(|task| task.duration)
            .sum();
        insights.push(format!(
            "{covered} of {} planned minutes covered",
            session.total_duration
        ));
    }

    SessionDebrief {
        highlights,
        insights,
    }
}
