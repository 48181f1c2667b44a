//! The action engine context.
//!
//! One explicitly constructed object owns the history, the classifier and
//! its nudge board, the collector with its scheduler, the flow runner and
//! the telemetry sink. Hosts feed it events and read [`EngineView`]s.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::classifier::{ClassificationSnapshot, NudgeClassifier};
use crate::collector::{ActivityCollector, Clock, IdleThresholds, Subscription};
use crate::config::EngineConfig;
use crate::debrief::SessionDebrief;
use crate::event::{
    ActionEvent, ActionKind, EventHistory, SharedHistory, KIND_NUDGE_SHOWN, KIND_TICK,
};
use crate::flow::{FlowRunner, FlowSnapshot};
use crate::focus_lock::FocusLockState;
use crate::nudge::{MicroFlow, MicroFlowSlot, Nudge, NudgeBoard};
use crate::scheduler::Scheduler;
use crate::traits::{SequenceProvider, SessionMirror, TelemetrySink};

/// Everything presentation renders, captured at one instant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineView {
    /// The single toast to show
    pub visible_nudge: Option<Nudge>,
    pub live_nudges: Vec<Nudge>,
    pub focus_lock: FocusLockState,
    pub flow: FlowSnapshot,
    pub micro_flow: Option<MicroFlow>,
    pub debrief: Option<SessionDebrief>,
}

pub struct ActionEngine {
    config: EngineConfig,
    history: SharedHistory,
    classifier: NudgeClassifier,
    board: Mutex<NudgeBoard>,
    micro_flow: Mutex<MicroFlowSlot>,
    scheduler: Arc<Scheduler>,
    collector: ActivityCollector,
    runner: Arc<FlowRunner>,
    telemetry: Arc<dyn TelemetrySink>,
    sender: UnboundedSender<ActionEvent>,
    clock: Clock,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ActionEngine {
    /// Build an engine on the wall clock. The returned receiver carries
    /// collector events and host intents; hand it to [`ActionEngine::run`].
    #[must_use]
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn SequenceProvider>,
        mirror: Arc<dyn SessionMirror>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> (Self, UnboundedReceiver<ActionEvent>) {
        Self::with_clock(config, provider, mirror, telemetry, Arc::new(Utc::now))
    }

    #[must_use]
    pub fn with_clock(
        config: EngineConfig,
        provider: Arc<dyn SequenceProvider>,
        mirror: Arc<dyn SessionMirror>,
        telemetry: Arc<dyn TelemetrySink>,
        clock: Clock,
    ) -> (Self, UnboundedReceiver<ActionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let history: SharedHistory = Arc::new(Mutex::new(EventHistory::new(
            config.history.capacity,
            config.history.retention(),
        )));
        let scheduler = Arc::new(Scheduler::new());
        let collector =
            ActivityCollector::new(&config.collector, Arc::clone(&scheduler), sender.clone())
                .with_clock(Arc::clone(&clock));
        let runner = Arc::new(
            FlowRunner::new(provider, mirror, Arc::clone(&history)).with_clock(Arc::clone(&clock)),
        );

        let engine = Self {
            classifier: NudgeClassifier::new(config.classifier.clone()),
            config,
            history,
            board: Mutex::new(NudgeBoard::new()),
            micro_flow: Mutex::new(MicroFlowSlot::default()),
            scheduler,
            collector,
            runner,
            telemetry,
            sender,
            clock,
        };
        (engine, receiver)
    }

    /// Sender for host intents such as "user switched task"
    #[must_use]
    pub fn sender(&self) -> UnboundedSender<ActionEvent> {
        self.sender.clone()
    }

    #[must_use]
    pub const fn collector(&self) -> &ActivityCollector {
        &self.collector
    }

    #[must_use]
    pub const fn runner(&self) -> &Arc<FlowRunner> {
        &self.runner
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Observe a surface with the configured idle windows
    pub fn observe(&self, surface: &str, subject_id: Option<String>) -> Subscription {
        let thresholds = IdleThresholds::from_config(&self.config.collector);
        self.collector.observe(surface, subject_id, thresholds)
    }

    fn snapshot(&self) -> ClassificationSnapshot {
        // runner state before history: the runner locks history itself
        let flow = self.runner.snapshot();
        let focus_lock = self.runner.focus_lock().snapshot();
        let recent = lock(&self.history).clone();
        ClassificationSnapshot {
            focus_lock,
            flow,
            recent,
        }
    }

    /// Archive, classify and publish one event. Returns the nudge it produced.
    pub fn ingest(&self, event: ActionEvent) -> Option<Nudge> {
        let snapshot = self.snapshot();
        let nudge = self.classifier.classify(&event, &snapshot);

        if event.action_kind() != ActionKind::Tick {
            self.forward(&event);
            lock(&self.history).push(event);
        }
        if let Some(nudge) = &nudge {
            self.publish(nudge.clone());
        }
        nudge
    }

    /// Ambient sweep: expire history and nudges, then classify a tick
    pub fn tick(&self, now: DateTime<Utc>) -> Option<Nudge> {
        lock(&self.history).prune(now);
        let expired = lock(&self.board).prune(now);
        if expired > 0 {
            log::debug!("Expired {expired} nudges");
        }
        self.ingest(ActionEvent::new(KIND_TICK, now))
    }

    fn publish(&self, nudge: Nudge) {
        let shown = ActionEvent::new(KIND_NUDGE_SHOWN, nudge.created_at)
            .with_subject_opt(nudge.subject_id.clone())
            .with_payload(json!({
                "type": nudge.nudge_type.as_str(),
                "nudgeId": nudge.id,
            }));

        if let Some(micro_flow) = self.classifier.micro_flow_for(&nudge) {
            lock(&self.micro_flow).offer(micro_flow);
        }
        log::info!("Nudge {}: {}", nudge.nudge_type, nudge.message);
        lock(&self.board).publish(nudge);

        self.forward(&shown);
        lock(&self.history).push(shown);
    }

    fn forward(&self, event: &ActionEvent) {
        if !self.config.engine.telemetry {
            return;
        }
        match serde_json::to_value(event) {
            Ok(payload) => self.telemetry.send_event(&event.kind, payload),
            Err(e) => log::warn!("Failed to encode {} for telemetry: {e}", event.kind),
        }
    }

    /// Process events in arrival order, ticking on the configured interval,
    /// until `shutdown` resolves or every sender is gone.
    pub async fn run(
        &self,
        mut events: UnboundedReceiver<ActionEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut ticker = interval(self.config.engine.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        log::info!("Action engine started");

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.ingest(event);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.tick((self.clock)());
                }
            }
        }

        self.shutdown();
        log::info!("Action engine stopped");
    }

    /// Cancel every collector poller
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    #[must_use]
    pub fn view(&self, now: DateTime<Utc>) -> EngineView {
        let flow = self.runner.snapshot();
        let focus_lock = self.runner.focus_lock().snapshot();
        let debrief = self.runner.last_debrief();
        let (visible_nudge, live_nudges) = {
            let board = lock(&self.board);
            (board.visible(now), board.live(now))
        };
        EngineView {
            visible_nudge,
            live_nudges,
            focus_lock,
            flow,
            micro_flow: lock(&self.micro_flow).current().cloned(),
            debrief,
        }
    }

    pub fn dismiss_nudge(&self, id: Uuid) -> bool {
        lock(&self.board).dismiss(id)
    }

    pub fn dismiss_micro_flow(&self, id: Uuid) -> bool {
        lock(&self.micro_flow).dismiss(id)
    }

    pub fn dismiss_debrief(&self) -> bool {
        self.runner.dismiss_debrief()
    }

    /// Recent events, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<ActionEvent> {
        lock(&self.history).to_vec()
    }
}

impl Drop for ActionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{KIND_NOTE_IDLE, KIND_SURFACE_FOCUS, KIND_TASK_SWITCHED};
    use crate::flow::FlowTask;
    use crate::nudge::NudgeType;
    use crate::traits::{NoopMirror, StaticSequenceProvider};
    use chrono::{Duration, TimeZone};
    use serde_json::Value;

    #[derive(Default)]
    struct RecordingTelemetry {
        kinds: Mutex<Vec<String>>,
    }

    impl TelemetrySink for RecordingTelemetry {
        fn send_event(&self, kind: &str, _payload: Value) {
            self.kinds.lock().unwrap().push(kind.to_string());
        }
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn engine_with(
        config: EngineConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> (ActionEngine, UnboundedReceiver<ActionEvent>) {
        let provider = StaticSequenceProvider::new(vec![
            FlowTask::new("a", "Write outline", 10),
            FlowTask::new("b", "Draft intro", 10),
            FlowTask::new("c", "Email Sam", 5),
        ]);
        ActionEngine::with_clock(
            config,
            Arc::new(provider),
            Arc::new(NoopMirror),
            telemetry,
            Arc::new(start_time),
        )
    }

    fn engine() -> ActionEngine {
        engine_with(EngineConfig::default(), Arc::new(RecordingTelemetry::default())).0
    }

    fn idle(secs: u64, at: DateTime<Utc>) -> ActionEvent {
        ActionEvent::new(KIND_NOTE_IDLE, at)
            .with_subject("note-1")
            .with_payload(json!({ "taskId": "note-1", "duration": secs }))
    }

    #[test]
    fn test_ingest_publishes_and_archives() {
        let engine = engine();
        let now = start_time();

        let nudge = engine.ingest(idle(7, now)).unwrap();
        assert_eq!(nudge.nudge_type, NudgeType::Hesitation);

        let view = engine.view(now);
        assert_eq!(view.visible_nudge.map(|n| n.id), Some(nudge.id));
        assert!(view.micro_flow.is_none());

        let kinds: Vec<_> = engine.history().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![KIND_NOTE_IDLE, KIND_NUDGE_SHOWN]);
    }

    #[test]
    fn test_same_type_keeps_latest_and_expires() {
        let engine = engine();
        let now = start_time();
        engine.ingest(idle(7, now));
        let later = engine.ingest(idle(8, now + Duration::seconds(3))).unwrap();

        let live = engine.view(now + Duration::seconds(4)).live_nudges;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, later.id);

        engine.tick(now + Duration::seconds(11));
        assert!(engine.view(now + Duration::seconds(11)).live_nudges.is_empty());
    }

    #[test]
    fn test_unvalidated_ttl_does_not_crash_view() {
        let mut config = EngineConfig::default();
        config.classifier.default_ttl_secs = 10_000_000_000_000;
        let (engine, _rx) = engine_with(config, Arc::new(RecordingTelemetry::default()));
        let now = start_time();

        let nudge = engine.ingest(idle(7, now)).unwrap();
        engine.tick(now + Duration::hours(1));
        let view = engine.view(now + Duration::hours(1));
        assert_eq!(view.visible_nudge.map(|n| n.id), Some(nudge.id));
        assert!(engine.view(now + Duration::days(2)).visible_nudge.is_none());
    }

    #[test]
    fn test_stall_offers_micro_flow() {
        let engine = engine();
        let now = start_time();
        engine.ingest(idle(45, now));

        let micro_flow = engine.view(now).micro_flow.unwrap();
        assert_eq!(micro_flow.title, "Get unstuck on note-1");
        assert!(engine.dismiss_micro_flow(micro_flow.id));
        assert!(engine.view(now).micro_flow.is_none());
    }

    #[test]
    fn test_switch_counter_uses_history() {
        let engine = engine();
        let now = start_time();
        let mut last = None;
        for i in 0..4 {
            last = engine.ingest(
                ActionEvent::new(KIND_TASK_SWITCHED, now + Duration::minutes(i))
                    .with_subject(format!("t{i}")),
            );
        }
        assert_eq!(
            last.map(|n| n.nudge_type),
            Some(NudgeType::TaskSwitchingExcessive)
        );
    }

    #[tokio::test]
    async fn test_flow_lock_drives_switch_and_break_nudges() {
        let engine = engine();
        let now = start_time();
        engine.runner().start(25, Some("high")).await.unwrap();

        let switched = engine
            .ingest(ActionEvent::new(KIND_TASK_SWITCHED, now).with_subject("elsewhere"))
            .unwrap();
        assert_eq!(switched.nudge_type, NudgeType::AvoidSwitching);
        assert!(switched.message.contains("Write outline"));

        assert!(engine.tick(now + Duration::minutes(10)).is_none());
        let brk = engine.tick(now + Duration::minutes(50)).unwrap();
        assert_eq!(brk.nudge_type, NudgeType::TakeMicroBreak);
        assert!(engine.tick(now + Duration::minutes(51)).is_none());

        let view = engine.view(now + Duration::minutes(50));
        assert_eq!(view.focus_lock.task_id.as_deref(), Some("a"));
        assert_eq!(view.flow.progress.map(|p| p.current), Some(1));
    }

    #[test]
    fn test_telemetry_forwarding() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (engine, _rx) = engine_with(EngineConfig::default(), telemetry.clone());
        engine.ingest(idle(7, start_time()));
        engine.tick(start_time());
        assert_eq!(
            *telemetry.kinds.lock().unwrap(),
            vec![KIND_NOTE_IDLE, KIND_NUDGE_SHOWN]
        );

        let quiet = Arc::new(RecordingTelemetry::default());
        let mut config = EngineConfig::default();
        config.engine.telemetry = false;
        let (engine, _rx) = engine_with(config, quiet.clone());
        engine.ingest(idle(7, start_time()));
        assert!(quiet.kinds.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_events_in_order_until_shutdown() {
        let (engine, rx) = engine_with(
            EngineConfig::default(),
            Arc::new(RecordingTelemetry::default()),
        );
        let sender = engine.sender();
        sender
            .send(ActionEvent::new(KIND_SURFACE_FOCUS, start_time()))
            .unwrap();
        sender.send(idle(7, start_time())).unwrap();

        engine
            .run(
                rx,
                tokio::time::sleep(std::time::Duration::from_millis(2500)),
            )
            .await;

        let kinds: Vec<_> = engine.history().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![KIND_SURFACE_FOCUS, KIND_NOTE_IDLE, KIND_NUDGE_SHOWN]
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_collector_pollers() {
        let engine = engine();
        let _subscription = engine.observe("editor", Some("note-1".to_string()));
        assert!(engine.collector().is_observing("editor"));
        assert_eq!(engine.scheduler.active_count(), 1);

        engine.shutdown();
        assert_eq!(engine.scheduler.active_count(), 0);
    }
}
