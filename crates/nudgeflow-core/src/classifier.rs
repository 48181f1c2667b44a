//! Nudge Classifier
//!
//! Maps one [`ActionEvent`] plus a snapshot of the engine state to at most
//! one [`Nudge`]. Classification is pure: the rolling counters it needs are
//! derived from the events in the snapshot.

use chrono::{DateTime, Utc};

use crate::config::{capped_seconds, ClassifierConfig};
use crate::event::{ActionEvent, ActionKind, EventHistory, KIND_NUDGE_SHOWN, KIND_TASK_SWITCHED};
use crate::flow::FlowSnapshot;
use crate::focus_lock::FocusLockState;
use crate::nudge::{MicroFlow, Nudge, NudgeType};

/// Everything the classifier may look at besides the event itself
#[derive(Debug, Clone, Default)]
pub struct ClassificationSnapshot {
    pub focus_lock: FocusLockState,
    pub flow: FlowSnapshot,
    /// Events archived before the one being classified
    pub recent: EventHistory,
}

impl ClassificationSnapshot {
    /// Title of the locked task if the flow session knows it
    fn locked_title(&self) -> Option<&str> {
        let held = self.focus_lock.task_id.as_deref()?;
        self.flow
            .session
            .as_ref()
            .and_then(|session| session.task(held))
            .map(|task| task.title.as_str())
            .or(Some(held))
    }
}

/// Rule-based nudge classifier
#[derive(Debug, Clone, Default)]
pub struct NudgeClassifier {
    config: ClassifierConfig,
}

impl NudgeClassifier {
    #[must_use]
    pub const fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify one event. Unknown kinds never produce a nudge.
    #[must_use]
    pub fn classify(
        &self,
        event: &ActionEvent,
        snapshot: &ClassificationSnapshot,
    ) -> Option<Nudge> {
        let now = event.timestamp;
        let nudge = match event.action_kind() {
            ActionKind::TaskSwitched => self.on_task_switched(event, snapshot),
            ActionKind::NoteIdle => self.on_idle(event),
            ActionKind::TaskOpened => self.on_task_opened(event, snapshot),
            ActionKind::EditBurst => self.on_edit_burst(event),
            ActionKind::Tick => self.on_tick(now, snapshot),
            ActionKind::SurfaceFocus
            | ActionKind::SurfaceBlur
            | ActionKind::ActivityResumed
            | ActionKind::NudgeShown
            | ActionKind::SessionEvent
            | ActionKind::Other(_) => None,
        }?;

        let (nudge_type, message) = nudge;
        let ttl = match nudge_type {
            NudgeType::Stall | NudgeType::TakeMicroBreak => self.config.long_ttl_secs,
            _ => self.config.default_ttl_secs,
        };
        let subject = event
            .subject_id
            .clone()
            .or_else(|| event.payload_str("taskId").map(str::to_string));

        log::debug!("Classified {} as {nudge_type}", event.kind);
        Some(Nudge::new(nudge_type, message, now, ttl).with_subject(subject))
    }

    fn on_task_switched(
        &self,
        event: &ActionEvent,
        snapshot: &ClassificationSnapshot,
    ) -> Option<(NudgeType, String)> {
        let window = capped_seconds(self.config.switch_window_secs);
        let switches = snapshot
            .recent
            .count_within(KIND_TASK_SWITCHED, event.timestamp, window)
            + 1;

        if switches > self.config.switch_threshold {
            return Some((
                NudgeType::TaskSwitchingExcessive,
                format!(
                    "{switches} task switches in {} minutes. Pick one and stay with it.",
                    window.num_minutes()
                ),
            ));
        }

        let held = snapshot.focus_lock.task_id.as_deref()?;
        if event.subject_id.as_deref() == Some(held) {
            return None;
        }
        let title = snapshot.locked_title().unwrap_or(held);
        Some((
            NudgeType::AvoidSwitching,
            format!("\"{title}\" is still in progress. Finish it before switching."),
        ))
    }

    fn on_idle(&self, event: &ActionEvent) -> Option<(NudgeType, String)> {
        let duration = event.payload_u64("duration")?;
        if duration >= self.config.stall_after_secs {
            Some((
                NudgeType::Stall,
                "Stuck? Write down the smallest next step.".to_string(),
            ))
        } else {
            Some((
                NudgeType::Hesitation,
                "Just start with one rough sentence.".to_string(),
            ))
        }
    }

    fn on_task_opened(
        &self,
        event: &ActionEvent,
        snapshot: &ClassificationSnapshot,
    ) -> Option<(NudgeType, String)> {
        let estimate = event.payload_u64("estimateMinutes")?;
        if estimate < self.config.large_task_minutes || snapshot.focus_lock.is_locked() {
            return None;
        }
        Some((
            NudgeType::StartSmall,
            format!("This looks like {estimate} minutes of work. Start with a 5-minute slice."),
        ))
    }

    #[allow(clippy::cast_precision_loss)]
    fn on_edit_burst(&self, event: &ActionEvent) -> Option<(NudgeType, String)> {
        let edits = event.payload_u64("edits")?;
        let deletions = event.payload_u64("deletions").unwrap_or(0);
        if edits == 0 || edits < self.config.over_edit_min_edits {
            return None;
        }
        let ratio = deletions as f64 / edits as f64;
        if ratio < self.config.over_edit_deletion_ratio {
            return None;
        }
        Some((
            NudgeType::OverEdit,
            "Lots of rewriting. Get it down first, polish later.".to_string(),
        ))
    }

    fn on_tick(
        &self,
        now: DateTime<Utc>,
        snapshot: &ClassificationSnapshot,
    ) -> Option<(NudgeType, String)> {
        let locked_at = snapshot.focus_lock.locked_at?;
        let held_for = now - locked_at;
        let break_after = capped_seconds(self.config.micro_break_after_mins.saturating_mul(60));
        if held_for < break_after {
            return None;
        }
        // once per lock hold
        let already_shown = snapshot.recent.iter().any(|e| {
            e.kind == KIND_NUDGE_SHOWN
                && e.timestamp >= locked_at
                && e.payload_str("type") == Some(NudgeType::TakeMicroBreak.as_str())
        });
        if already_shown {
            return None;
        }
        Some((
            NudgeType::TakeMicroBreak,
            format!(
                "{} minutes on \"{}\". Stand up and stretch for a minute.",
                held_for.num_minutes(),
                snapshot.locked_title().unwrap_or("this task")
            ),
        ))
    }

    /// A short step list to go with `start_small` and `stall` nudges
    #[must_use]
    pub fn micro_flow_for(&self, nudge: &Nudge) -> Option<MicroFlow> {
        let subject = nudge.subject_id.as_deref().unwrap_or("this task");
        let (title, steps) = match nudge.nudge_type {
            NudgeType::StartSmall => (
                format!("Start small on {subject}"),
                vec![
                    "Reread what done looks like",
                    "Write the first rough step",
                    "Work on only that step for 5 minutes",
                ],
            ),
            NudgeType::Stall => (
                format!("Get unstuck on {subject}"),
                vec![
                    "Write down what is blocking you",
                    "Pick the smallest next action",
                    "Do it for 2 minutes",
                ],
            ),
            _ => return None,
        };
        Some(MicroFlow::new(
            title,
            steps.into_iter().map(str::to_string).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        KIND_ACTIVITY_RESUMED, KIND_EDIT_BURST, KIND_NOTE_IDLE, KIND_SURFACE_BLUR,
        KIND_TASK_OPENED, KIND_TICK,
    };
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn classifier() -> NudgeClassifier {
        NudgeClassifier::new(ClassifierConfig::default())
    }

    fn locked(task_id: &str, since: DateTime<Utc>) -> ClassificationSnapshot {
        ClassificationSnapshot {
            focus_lock: FocusLockState {
                task_id: Some(task_id.to_string()),
                locked_at: Some(since),
            },
            ..Default::default()
        }
    }

    fn kind_of(nudge: Option<Nudge>) -> Option<NudgeType> {
        nudge.map(|n| n.nudge_type)
    }

    #[test]
    fn test_idle_splits_on_stall_threshold() {
        let c = classifier();
        let snapshot = ClassificationSnapshot::default();

        let short = ActionEvent::new(KIND_NOTE_IDLE, at(0))
            .with_payload(json!({ "taskId": "t1", "duration": 7 }));
        let nudge = c.classify(&short, &snapshot).unwrap();
        assert_eq!(nudge.nudge_type, NudgeType::Hesitation);
        assert_eq!(nudge.ttl_secs, 8);
        assert_eq!(nudge.subject_id.as_deref(), Some("t1"));

        let long =
            ActionEvent::new(KIND_NOTE_IDLE, at(0)).with_payload(json!({ "duration": 30 }));
        let nudge = c.classify(&long, &snapshot).unwrap();
        assert_eq!(nudge.nudge_type, NudgeType::Stall);
        assert_eq!(nudge.ttl_secs, 10);
    }

    #[test]
    fn test_switch_away_from_locked_task() {
        let c = classifier();
        let snapshot = locked("t1", at(0));

        let away = ActionEvent::new(KIND_TASK_SWITCHED, at(10)).with_subject("t2");
        assert_eq!(
            kind_of(c.classify(&away, &snapshot)),
            Some(NudgeType::AvoidSwitching)
        );

        let back = ActionEvent::new(KIND_TASK_SWITCHED, at(10)).with_subject("t1");
        assert_eq!(kind_of(c.classify(&back, &snapshot)), None);

        let unlocked = ClassificationSnapshot::default();
        assert_eq!(kind_of(c.classify(&away, &unlocked)), None);
    }

    #[test]
    fn test_excessive_switching_takes_precedence() {
        let c = classifier();
        let mut snapshot = locked("t1", at(0));
        for secs in [100, 200, 300] {
            snapshot.recent.push(ActionEvent::new(KIND_TASK_SWITCHED, at(secs)));
        }

        let event = ActionEvent::new(KIND_TASK_SWITCHED, at(400)).with_subject("t2");
        assert_eq!(
            kind_of(c.classify(&event, &snapshot)),
            Some(NudgeType::TaskSwitchingExcessive)
        );

        // older switches fall out of the 10 minute window
        let later = ActionEvent::new(KIND_TASK_SWITCHED, at(750)).with_subject("t2");
        assert_eq!(
            kind_of(c.classify(&later, &snapshot)),
            Some(NudgeType::AvoidSwitching)
        );
    }

    #[test]
    fn test_large_task_opened_without_lock() {
        let c = classifier();
        let big = ActionEvent::new(KIND_TASK_OPENED, at(0))
            .with_subject("t9")
            .with_payload(json!({ "estimateMinutes": 90 }));
        let small = ActionEvent::new(KIND_TASK_OPENED, at(0))
            .with_payload(json!({ "estimateMinutes": 15 }));

        assert_eq!(
            kind_of(c.classify(&big, &ClassificationSnapshot::default())),
            Some(NudgeType::StartSmall)
        );
        assert_eq!(kind_of(c.classify(&big, &locked("t1", at(0)))), None);
        assert_eq!(
            kind_of(c.classify(&small, &ClassificationSnapshot::default())),
            None
        );
    }

    #[test]
    fn test_over_edit_needs_volume_and_ratio() {
        let c = classifier();
        let snapshot = ClassificationSnapshot::default();
        let burst = |edits: u64, deletions: u64| {
            ActionEvent::new(KIND_EDIT_BURST, at(0))
                .with_payload(json!({ "edits": edits, "deletions": deletions }))
        };

        assert_eq!(
            kind_of(c.classify(&burst(50, 30), &snapshot)),
            Some(NudgeType::OverEdit)
        );
        assert_eq!(kind_of(c.classify(&burst(50, 10), &snapshot)), None);
        assert_eq!(kind_of(c.classify(&burst(10, 10), &snapshot)), None);
    }

    #[test]
    fn test_micro_break_once_per_lock() {
        let c = classifier();
        let mut snapshot = locked("t1", at(0));

        let early = ActionEvent::new(KIND_TICK, at(49 * 60));
        assert_eq!(kind_of(c.classify(&early, &snapshot)), None);

        let due = ActionEvent::new(KIND_TICK, at(50 * 60));
        let nudge = c.classify(&due, &snapshot).unwrap();
        assert_eq!(nudge.nudge_type, NudgeType::TakeMicroBreak);
        assert_eq!(nudge.ttl_secs, 10);

        snapshot.recent.push(
            ActionEvent::new(KIND_NUDGE_SHOWN, at(50 * 60))
                .with_payload(json!({ "type": "take_micro_break" })),
        );
        let again = ActionEvent::new(KIND_TICK, at(51 * 60));
        assert_eq!(kind_of(c.classify(&again, &snapshot)), None);

        assert_eq!(
            kind_of(c.classify(&due, &ClassificationSnapshot::default())),
            None
        );
    }

    #[test]
    fn test_oversized_windows_do_not_overflow() {
        let c = NudgeClassifier::new(ClassifierConfig {
            default_ttl_secs: u64::MAX,
            switch_window_secs: u64::MAX,
            micro_break_after_mins: u64::MAX,
            ..ClassifierConfig::default()
        });
        let mut snapshot = locked("t1", at(0));
        snapshot.recent.push(ActionEvent::new(KIND_TASK_SWITCHED, at(10)));

        let switch = ActionEvent::new(KIND_TASK_SWITCHED, at(20)).with_subject("t2");
        let nudge = c.classify(&switch, &snapshot).unwrap();
        assert_eq!(nudge.nudge_type, NudgeType::AvoidSwitching);
        assert!(!nudge.is_expired(at(60 * 60)));

        // the break interval is capped at one day
        let tick = ActionEvent::new(KIND_TICK, at(24 * 60 * 60));
        assert_eq!(
            kind_of(c.classify(&tick, &snapshot)),
            Some(NudgeType::TakeMicroBreak)
        );
    }

    #[test]
    fn test_unknown_and_passive_kinds_yield_nothing() {
        let c = classifier();
        let snapshot = locked("t1", at(0));
        for event in [
            ActionEvent::new("calendar_synced", at(0)),
            ActionEvent::new(KIND_SURFACE_BLUR, at(0)),
            ActionEvent::new(KIND_ACTIVITY_RESUMED, at(0)),
            ActionEvent::new(KIND_NOTE_IDLE, at(0)),
        ] {
            assert!(c.classify(&event, &snapshot).is_none());
        }
    }

    #[test]
    fn test_micro_flow_for_start_small_and_stall() {
        let c = classifier();
        let start_small = Nudge::new(NudgeType::StartSmall, String::new(), at(0), 8)
            .with_subject(Some("t9".into()));
        let micro_flow = c.micro_flow_for(&start_small).unwrap();
        assert_eq!(micro_flow.title, "Start small on t9");
        assert_eq!(micro_flow.steps.len(), 3);

        let stall = Nudge::new(NudgeType::Stall, String::new(), at(0), 10);
        assert!(c.micro_flow_for(&stall).is_some());

        let other = Nudge::new(NudgeType::OverEdit, String::new(), at(0), 8);
        assert!(c.micro_flow_for(&other).is_none());
    }
}
