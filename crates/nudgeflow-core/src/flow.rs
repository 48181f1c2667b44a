//! Flow Runner
//!
//! Drives a strictly ordered multi-task work session. The runner owns the
//! session, the current index and the focus lock writer; everything else
//! reads its state through [`FlowRunner::snapshot`] and the lock view.
//!
//! ```text
//! Idle -> Starting -> TaskActive -> TaskCompleting | TaskSkipping
//!                         ^                 |
//!                         +-----------------+--> SessionComplete -> Idle
//! any active state -> Stopping -> Idle
//! ```

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::collector::Clock;
use crate::debrief::{synthesize, SessionDebrief};
use crate::error::{FlowError, FlowResult};
use crate::event::{ActionEvent, SharedHistory, KIND_SESSION_EVENT};
use crate::focus_lock::{FocusLock, FocusLockView, ReleaseOutcome};
use crate::traits::{FlowSequence, SequenceProvider, SessionEventKind, SessionMirror};

/// Diagnostics kept for inspection, oldest dropped first
const MAX_DIAGNOSTICS: usize = 32;

/// Flow runner lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Idle,
    Starting,
    TaskActive,
    TaskCompleting,
    TaskSkipping,
    SessionComplete,
    Stopping,
}

impl FlowState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::TaskActive => "task_active",
            Self::TaskCompleting => "task_completing",
            Self::TaskSkipping => "task_skipping",
            Self::SessionComplete => "session_complete",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a flow sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowTask {
    pub id: String,
    pub title: String,
    /// Planned minutes
    pub duration: u32,
    #[serde(default)]
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FlowTask {
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, duration: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            duration,
            order: 0,
            reason: None,
        }
    }
}

/// A running (or finished) flow session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSession {
    pub session_id: String,
    pub sequence_id: String,
    pub sequence: Vec<FlowTask>,
    /// Index of the active task; `sequence.len()` once every task is done
    pub current_index: usize,
    pub started_at: DateTime<Utc>,
    /// Planned minutes across the whole sequence
    pub total_duration: u32,
    pub completed_task_ids: IndexSet<String>,
    pub skipped_task_ids: IndexSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl FlowSession {
    #[must_use]
    pub fn new(
        sequence_id: String,
        sequence: Vec<FlowTask>,
        energy_hint: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let total_duration = sequence.iter().map(|task| task.duration).sum();
        Self {
            session_id: Uuid::new_v4().to_string(),
            sequence_id,
            sequence,
            current_index: 0,
            started_at,
            total_duration,
            completed_task_ids: IndexSet::new(),
            skipped_task_ids: IndexSet::new(),
            energy_hint,
            ended_at: None,
        }
    }

    #[must_use]
    pub fn current_task(&self) -> Option<&FlowTask> {
        self.sequence.get(self.current_index)
    }

    /// Look up a task of this session by id
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&FlowTask> {
        self.sequence.iter().find(|task| task.id == id)
    }

    /// Tasks neither completed nor skipped
    #[must_use]
    pub fn remaining_tasks(&self) -> usize {
        self.sequence.len().saturating_sub(self.current_index)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.current_index >= self.sequence.len()
    }

    /// Position of the active task, or `None` once the sequence is exhausted
    #[must_use]
    pub fn progress(&self) -> Option<FlowProgress> {
        if self.is_finished() {
            return None;
        }
        Some(FlowProgress::at(self.current_index, self.sequence.len()))
    }
}

/// 1-based position of the active task plus the share already behind it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowProgress {
    pub current: usize,
    pub total: usize,
    pub percentage: u8,
}

impl FlowProgress {
    fn at(index: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            // round(100 * index / total) in integers
            (200 * index + total) / (2 * total)
        };
        Self {
            current: index + 1,
            total,
            percentage: u8::try_from(percentage.min(100)).unwrap_or(100),
        }
    }
}

/// Result of completing or skipping the active task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The next task is active
    Advanced(FlowProgress),
    /// That was the last task; the session is over
    Finished(SessionDebrief),
}

/// Read-only picture of the runner for presentation and classification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub state: FlowState,
    pub session: Option<FlowSession>,
    pub progress: Option<FlowProgress>,
}

impl FlowSnapshot {
    #[must_use]
    pub fn current_task(&self) -> Option<&FlowTask> {
        if self.state == FlowState::TaskActive {
            self.session.as_ref().and_then(FlowSession::current_task)
        } else {
            None
        }
    }
}

/// A session event that still has to be mirrored
struct Mirrored {
    session_id: String,
    kind: SessionEventKind,
    payload: Value,
}

#[derive(Debug, Default)]
struct RunnerState {
    state: FlowState,
    session: Option<FlowSession>,
    /// Bumped by every start and by stop-while-starting
    attempt: u64,
    lock: FocusLock,
    last_debrief: Option<SessionDebrief>,
    last_session: Option<FlowSession>,
    diagnostics: Vec<FlowError>,
}

impl RunnerState {
    fn record(&mut self, error: FlowError) {
        if self.diagnostics.len() >= MAX_DIAGNOSTICS {
            self.diagnostics.remove(0);
        }
        self.diagnostics.push(error);
    }

    fn lock_conflict(&mut self, error: FlowError) -> FlowError {
        log::error!("{error}");
        self.record(error.clone());
        error
    }

    fn progress(&self) -> Option<FlowProgress> {
        if self.state != FlowState::TaskActive {
            return None;
        }
        self.session.as_ref().and_then(FlowSession::progress)
    }

    /// Archive a runner transition in the shared history
    fn archive(
        history: &SharedHistory,
        kind: SessionEventKind,
        session: &FlowSession,
        subject_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        let event = ActionEvent::new(KIND_SESSION_EVENT, now)
            .with_subject_opt(subject_id)
            .with_payload(json!({
                "kind": kind.as_str(),
                "sessionId": session.session_id,
                "index": session.current_index,
            }));
        history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Activate a freshly fetched sequence
    fn begin(
        &mut self,
        sequence: FlowSequence,
        energy_hint: Option<&str>,
        history: &SharedHistory,
        now: DateTime<Utc>,
    ) -> FlowResult<(FlowProgress, Mirrored)> {
        validate_sequence(&sequence)?;

        if let Some(held) = self.lock.snapshot().task_id {
            log::info!("Releasing explicit focus lock on {held} for flow session");
            self.lock.clear();
        }

        let task_ids: Vec<String> = sequence.tasks.iter().map(|t| t.id.clone()).collect();
        let session = FlowSession::new(
            sequence.sequence_id,
            sequence.tasks,
            energy_hint.map(str::to_string),
            now,
        );
        let first = task_ids[0].clone();
        if let Err(e) = self.lock.acquire(&first, now) {
            self.state = FlowState::Idle;
            return Err(self.lock_conflict(e.into()));
        }

        log::info!(
            "Flow session {} started with {} tasks ({}m)",
            session.session_id,
            session.sequence.len(),
            session.total_duration
        );
        Self::archive(history, SessionEventKind::Start, &session, Some(first), now);

        let mirrored = Mirrored {
            session_id: session.session_id.clone(),
            kind: SessionEventKind::Start,
            payload: json!({
                "sequenceId": session.sequence_id,
                "taskIds": task_ids,
                "totalDuration": session.total_duration,
                "energyHint": session.energy_hint,
            }),
        };
        let progress = FlowProgress::at(0, session.sequence.len());
        self.session = Some(session);
        self.state = FlowState::TaskActive;
        Ok((progress, mirrored))
    }

    /// Complete or skip the active task and move on
    fn step(
        &mut self,
        kind: SessionEventKind,
        history: &SharedHistory,
        now: DateTime<Utc>,
    ) -> FlowResult<(StepOutcome, Mirrored)> {
        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            return Err(FlowError::InvalidTransition {
                operation: operation_name(kind),
                state,
            });
        };
        let Some(task_id) = session.current_task().map(|task| task.id.clone()) else {
            return Err(FlowError::InvalidTransition {
                operation: operation_name(kind),
                state,
            });
        };

        self.state = if kind == SessionEventKind::Complete {
            FlowState::TaskCompleting
        } else {
            FlowState::TaskSkipping
        };
        self.lock.release(&task_id);

        if kind == SessionEventKind::Complete {
            session.completed_task_ids.insert(task_id.clone());
        } else {
            session.skipped_task_ids.insert(task_id.clone());
        }
        session.current_index += 1;
        log::info!(
            "Task {task_id} {} ({}/{})",
            if kind == SessionEventKind::Complete {
                "completed"
            } else {
                "skipped"
            },
            session.current_index,
            session.sequence.len()
        );
        Self::archive(history, kind, session, Some(task_id.clone()), now);

        let mirrored = Mirrored {
            session_id: session.session_id.clone(),
            kind,
            payload: json!({
                "taskId": task_id,
                "index": session.current_index - 1,
            }),
        };

        if session.is_finished() {
            self.state = FlowState::SessionComplete;
            let debrief = self.finish(history, now);
            return Ok((StepOutcome::Finished(debrief), mirrored));
        }

        let next = session.sequence[session.current_index].id.clone();
        let progress = session.progress();
        let acquired = self.lock.acquire(&next, now);
        self.state = FlowState::TaskActive;
        if let Err(e) = acquired {
            return Err(self.lock_conflict(e.into()));
        }
        progress
            .map(|p| (StepOutcome::Advanced(p), mirrored))
            .ok_or_else(|| FlowError::InvalidTransition {
                operation: operation_name(kind),
                state: FlowState::TaskActive,
            })
    }

    /// Freeze the session, write its debrief and return to idle
    fn finish(&mut self, history: &SharedHistory, now: DateTime<Utc>) -> SessionDebrief {
        self.lock.clear();
        let Some(mut session) = self.session.take() else {
            self.state = FlowState::Idle;
            return SessionDebrief::default();
        };
        session.ended_at = Some(now);

        let debrief = {
            let history = history.lock().unwrap_or_else(PoisonError::into_inner);
            synthesize(&session, history.iter())
        };
        log::info!(
            "Flow session {} ended: {} completed, {} skipped",
            session.session_id,
            session.completed_task_ids.len(),
            session.skipped_task_ids.len()
        );

        self.last_debrief = Some(debrief.clone());
        self.last_session = Some(session);
        self.state = FlowState::Idle;
        debrief
    }
}

const fn operation_name(kind: SessionEventKind) -> &'static str {
    match kind {
        SessionEventKind::Start => "start",
        SessionEventKind::Complete => "complete_task",
        SessionEventKind::Skip => "skip_task",
        SessionEventKind::Stop => "stop",
    }
}

fn validate_sequence(sequence: &FlowSequence) -> FlowResult<()> {
    if sequence.tasks.is_empty() {
        return Err(FlowError::SequenceUnavailable(
            "the sequence contains no tasks".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for task in &sequence.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(FlowError::SequenceUnavailable(format!(
                "task {} appears more than once",
                task.id
            )));
        }
    }
    Ok(())
}

/// Sequential task-execution state machine
pub struct FlowRunner {
    inner: Mutex<RunnerState>,
    /// Serializes transitions; overlapping calls are rejected, not queued
    gate: tokio::sync::Mutex<()>,
    provider: Arc<dyn SequenceProvider>,
    mirror: Arc<dyn SessionMirror>,
    history: SharedHistory,
    lock_view: FocusLockView,
    clock: Clock,
}

impl FlowRunner {
    #[must_use]
    pub fn new(
        provider: Arc<dyn SequenceProvider>,
        mirror: Arc<dyn SessionMirror>,
        history: SharedHistory,
    ) -> Self {
        let state = RunnerState::default();
        let lock_view = state.lock.view();
        Self {
            inner: Mutex::new(state),
            gate: tokio::sync::Mutex::new(()),
            provider,
            mirror,
            history,
            lock_view,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used for timestamps
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn lock_inner(&self) -> MutexGuard<'_, RunnerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Start a session of roughly `duration_minutes`
    ///
    /// # Errors
    ///
    /// - [`FlowError::InvalidTransition`] unless idle
    /// - [`FlowError::SequenceUnavailable`] for a zero duration, a provider
    ///   failure, an empty sequence or duplicate task ids
    /// - [`FlowError::StartSuperseded`] if [`FlowRunner::stop`] ran while the
    ///   sequence was being fetched
    pub async fn start(
        &self,
        duration_minutes: u32,
        energy_hint: Option<&str>,
    ) -> FlowResult<FlowProgress> {
        let gate = self
            .gate
            .try_lock()
            .map_err(|_| FlowError::OperationInFlight)?;
        let attempt = {
            let mut inner = self.lock_inner();
            if inner.state != FlowState::Idle {
                return Err(FlowError::InvalidTransition {
                    operation: "start",
                    state: inner.state,
                });
            }
            if duration_minutes == 0 {
                return Err(FlowError::SequenceUnavailable(
                    "duration must be at least one minute".to_string(),
                ));
            }
            inner.state = FlowState::Starting;
            inner.attempt += 1;
            inner.attempt
        };
        // stop() may run while the provider is working
        drop(gate);

        log::debug!("Requesting flow sequence for {duration_minutes}m");
        let fetched = self
            .provider
            .get_flow_sequence(duration_minutes, energy_hint)
            .await;

        let _gate = self.gate.lock().await;
        let now = self.now();
        let (progress, mirrored) = {
            let mut inner = self.lock_inner();
            if inner.attempt != attempt || inner.state != FlowState::Starting {
                log::info!("Discarding task sequence for a superseded start");
                return Err(FlowError::StartSuperseded);
            }
            let sequence = match fetched {
                Ok(sequence) => sequence,
                Err(e) => {
                    inner.state = FlowState::Idle;
                    log::warn!("Sequence provider failed: {e:#}");
                    return Err(FlowError::SequenceUnavailable(format!("{e:#}")));
                }
            };
            match inner.begin(sequence, energy_hint, &self.history, now) {
                Ok(started) => started,
                Err(e) => {
                    inner.state = FlowState::Idle;
                    return Err(e);
                }
            }
        };

        self.mirror_event(mirrored).await;
        Ok(progress)
    }

    /// Mark the active task completed and advance
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidTransition`] unless a task is active,
    /// [`FlowError::OperationInFlight`] while another transition runs.
    pub async fn complete_task(&self) -> FlowResult<StepOutcome> {
        self.advance(SessionEventKind::Complete).await
    }

    /// Skip the active task and advance
    ///
    /// # Errors
    ///
    /// Same as [`FlowRunner::complete_task`].
    pub async fn skip_task(&self) -> FlowResult<StepOutcome> {
        self.advance(SessionEventKind::Skip).await
    }

    async fn advance(&self, kind: SessionEventKind) -> FlowResult<StepOutcome> {
        let _gate = self
            .gate
            .try_lock()
            .map_err(|_| FlowError::OperationInFlight)?;
        let now = self.now();
        let (outcome, mirrored) = {
            let mut inner = self.lock_inner();
            match inner.state {
                FlowState::TaskActive => {}
                FlowState::Starting => return Err(FlowError::OperationInFlight),
                state => {
                    return Err(FlowError::InvalidTransition {
                        operation: operation_name(kind),
                        state,
                    })
                }
            }
            inner.step(kind, &self.history, now)?
        };

        self.mirror_event(mirrored).await;
        Ok(outcome)
    }

    /// Abandon the session. Returns its debrief when one was running, or
    /// `None` when a pending start was cancelled.
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidTransition`] when idle,
    /// [`FlowError::OperationInFlight`] while another transition runs.
    pub async fn stop(&self) -> FlowResult<Option<SessionDebrief>> {
        let _gate = self
            .gate
            .try_lock()
            .map_err(|_| FlowError::OperationInFlight)?;
        let now = self.now();
        let stopped = {
            let mut inner = self.lock_inner();
            match inner.state {
                FlowState::Idle => {
                    return Err(FlowError::InvalidTransition {
                        operation: "stop",
                        state: FlowState::Idle,
                    })
                }
                FlowState::Starting => {
                    inner.attempt += 1;
                    inner.state = FlowState::Idle;
                    log::info!("Cancelled pending flow start");
                    None
                }
                _ => {
                    inner.state = FlowState::Stopping;
                    let mirrored = inner.session.as_ref().map(|session| {
                        let subject = session.current_task().map(|t| t.id.clone());
                        RunnerState::archive(
                            &self.history,
                            SessionEventKind::Stop,
                            session,
                            subject,
                            now,
                        );
                        Mirrored {
                            session_id: session.session_id.clone(),
                            kind: SessionEventKind::Stop,
                            payload: json!({
                                "index": session.current_index,
                                "completed": session.completed_task_ids.len(),
                                "skipped": session.skipped_task_ids.len(),
                            }),
                        }
                    });
                    let debrief = inner.finish(&self.history, now);
                    mirrored.map(|m| (debrief, m))
                }
            }
        };

        match stopped {
            Some((debrief, mirrored)) => {
                self.mirror_event(mirrored).await;
                Ok(Some(debrief))
            }
            None => Ok(None),
        }
    }

    /// Explicitly lock a task outside Flow Mode
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidTransition`] unless idle, [`FlowError::LockConflict`]
    /// when a different task is already locked.
    pub fn lock_task(&self, task_id: &str) -> FlowResult<()> {
        let now = self.now();
        let mut inner = self.lock_inner();
        if inner.state != FlowState::Idle {
            return Err(FlowError::InvalidTransition {
                operation: "lock_task",
                state: inner.state,
            });
        }
        if let Err(e) = inner.lock.acquire(task_id, now) {
            return Err(inner.lock_conflict(e.into()));
        }
        Ok(())
    }

    /// Release an explicit task lock
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidTransition`] unless idle.
    pub fn unlock_task(&self, task_id: &str) -> FlowResult<ReleaseOutcome> {
        let mut inner = self.lock_inner();
        if inner.state != FlowState::Idle {
            return Err(FlowError::InvalidTransition {
                operation: "unlock_task",
                state: inner.state,
            });
        }
        Ok(inner.lock.release(task_id))
    }

    async fn mirror_event(&self, mirrored: Mirrored) {
        let Mirrored {
            session_id,
            kind,
            payload,
        } = mirrored;
        if let Err(e) = self
            .mirror
            .report_session_event(&session_id, kind, payload)
            .await
        {
            let failure = FlowError::PersistenceMirrorFailure {
                kind: kind.to_string(),
                message: format!("{e:#}"),
            };
            log::warn!("{failure}");
            self.lock_inner().record(failure);
        }
    }

    #[must_use]
    pub fn state(&self) -> FlowState {
        self.lock_inner().state
    }

    /// Progress of the active task, `None` unless a task is active
    #[must_use]
    pub fn progress(&self) -> Option<FlowProgress> {
        self.lock_inner().progress()
    }

    #[must_use]
    pub fn snapshot(&self) -> FlowSnapshot {
        let inner = self.lock_inner();
        FlowSnapshot {
            state: inner.state,
            session: inner.session.clone(),
            progress: inner.progress(),
        }
    }

    #[must_use]
    pub fn focus_lock(&self) -> FocusLockView {
        self.lock_view.clone()
    }

    /// Debrief of the last finished session, until dismissed
    #[must_use]
    pub fn last_debrief(&self) -> Option<SessionDebrief> {
        self.lock_inner().last_debrief.clone()
    }

    /// Returns whether there was a debrief to dismiss
    pub fn dismiss_debrief(&self) -> bool {
        self.lock_inner().last_debrief.take().is_some()
    }

    /// The frozen copy of the last finished or stopped session
    #[must_use]
    pub fn last_session(&self) -> Option<FlowSession> {
        self.lock_inner().last_session.clone()
    }

    /// Lock conflicts and mirror failures, oldest first
    #[must_use]
    pub fn diagnostics(&self) -> Vec<FlowError> {
        self.lock_inner().diagnostics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventHistory;
    use crate::traits::{NoopMirror, StaticSequenceProvider};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn pool() -> Vec<FlowTask> {
        vec![
            FlowTask::new("a", "Write outline", 10),
            FlowTask::new("b", "Draft intro", 10),
            FlowTask::new("c", "Email Sam", 5),
        ]
    }

    fn history() -> SharedHistory {
        Arc::new(Mutex::new(EventHistory::default()))
    }

    fn runner_with(
        provider: Arc<dyn SequenceProvider>,
        mirror: Arc<dyn SessionMirror>,
    ) -> FlowRunner {
        FlowRunner::new(provider, mirror, history())
    }

    fn runner() -> FlowRunner {
        runner_with(
            Arc::new(StaticSequenceProvider::new(pool())),
            Arc::new(NoopMirror),
        )
    }

    fn holder(runner: &FlowRunner) -> Option<String> {
        runner.focus_lock().snapshot().task_id
    }

    fn expected_holder(runner: &FlowRunner) -> Option<String> {
        runner.snapshot().current_task().map(|t| t.id.clone())
    }

    struct FixedProvider(Vec<FlowTask>);

    #[async_trait]
    impl SequenceProvider for FixedProvider {
        async fn get_flow_sequence(&self, _: u32, _: Option<&str>) -> Result<FlowSequence> {
            Ok(FlowSequence {
                sequence_id: "fixed".to_string(),
                total_duration: self.0.iter().map(|t| t.duration).sum(),
                tasks: self.0.clone(),
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl SequenceProvider for FailingProvider {
        async fn get_flow_sequence(&self, _: u32, _: Option<&str>) -> Result<FlowSequence> {
            Err(anyhow!("service unavailable"))
        }
    }

    /// Holds the fetch until released
    struct GatedProvider {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SequenceProvider for GatedProvider {
        async fn get_flow_sequence(&self, _: u32, _: Option<&str>) -> Result<FlowSequence> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(FlowSequence {
                sequence_id: "late".to_string(),
                total_duration: 25,
                tasks: pool(),
            })
        }
    }

    struct FailingMirror;

    #[async_trait]
    impl SessionMirror for FailingMirror {
        async fn report_session_event(
            &self,
            _: &str,
            _: SessionEventKind,
            _: Value,
        ) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    /// Blocks on `complete` reports until released
    struct SlowMirror {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SessionMirror for SlowMirror {
        async fn report_session_event(
            &self,
            _: &str,
            kind: SessionEventKind,
            _: Value,
        ) -> Result<()> {
            if kind == SessionEventKind::Complete {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(())
        }
    }

    #[test]
    fn test_progress_rounding() {
        assert_eq!(FlowProgress::at(0, 3).percentage, 0);
        assert_eq!(FlowProgress::at(1, 3).percentage, 33);
        assert_eq!(FlowProgress::at(2, 3).percentage, 67);
        assert_eq!(FlowProgress::at(1, 2).current, 2);
    }

    #[tokio::test]
    async fn test_start_activates_first_task() {
        let runner = runner();
        let progress = runner.start(25, Some("high")).await.unwrap();

        assert_eq!(
            progress,
            FlowProgress {
                current: 1,
                total: 3,
                percentage: 0
            }
        );
        assert_eq!(runner.state(), FlowState::TaskActive);
        assert_eq!(holder(&runner).as_deref(), Some("a"));

        let session = runner.snapshot().session.unwrap();
        assert_eq!(session.energy_hint.as_deref(), Some("high"));
        assert_eq!(session.total_duration, 25);
    }

    #[tokio::test]
    async fn test_start_while_active_is_rejected() {
        let runner = runner();
        runner.start(25, None).await.unwrap();
        runner.complete_task().await.unwrap();
        let before = runner.snapshot();

        let err = runner.start(25, None).await.unwrap_err();
        assert_eq!(
            err,
            FlowError::InvalidTransition {
                operation: "start",
                state: FlowState::TaskActive,
            }
        );
        assert_eq!(runner.snapshot(), before);
    }

    #[tokio::test]
    async fn test_step_while_idle_is_rejected() {
        let runner = runner();
        let err = runner.complete_task().await.unwrap_err();
        assert_eq!(
            err,
            FlowError::InvalidTransition {
                operation: "complete_task",
                state: FlowState::Idle,
            }
        );
        assert!(matches!(
            runner.skip_task().await,
            Err(FlowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            runner.stop().await,
            Err(FlowError::InvalidTransition { .. })
        ));
        assert_eq!(runner.state(), FlowState::Idle);
    }

    #[tokio::test]
    async fn test_index_advances_and_lock_follows_current_task() {
        let runner = runner();
        runner.start(25, None).await.unwrap();

        let mut last_index = 0;
        loop {
            assert_eq!(holder(&runner), expected_holder(&runner));
            match runner.complete_task().await.unwrap() {
                StepOutcome::Advanced(progress) => {
                    let index = runner.snapshot().session.unwrap().current_index;
                    assert_eq!(index, last_index + 1);
                    assert_eq!(progress.current, index + 1);
                    last_index = index;
                }
                StepOutcome::Finished(debrief) => {
                    assert_eq!(debrief.highlights.len(), 3);
                    break;
                }
            }
        }

        assert_eq!(runner.state(), FlowState::Idle);
        assert_eq!(holder(&runner), None);
        assert!(runner.progress().is_none());
        let session = runner.last_session().unwrap();
        assert_eq!(session.current_index, session.sequence.len());
        assert!(session.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_zero_duration_never_reaches_provider() {
        let runner = runner_with(Arc::new(FailingProvider), Arc::new(NoopMirror));
        let err = runner.start(0, None).await.unwrap_err();
        assert_eq!(
            err,
            FlowError::SequenceUnavailable("duration must be at least one minute".to_string())
        );
        assert_eq!(runner.state(), FlowState::Idle);
    }

    #[tokio::test]
    async fn test_provider_failure_returns_to_idle() {
        let runner = runner_with(Arc::new(FailingProvider), Arc::new(NoopMirror));
        let err = runner.start(25, None).await.unwrap_err();
        let FlowError::SequenceUnavailable(msg) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(msg.contains("service unavailable"));
        assert_eq!(runner.state(), FlowState::Idle);
        assert_eq!(holder(&runner), None);
    }

    #[tokio::test]
    async fn test_unusable_sequences_are_rejected() {
        let empty = runner_with(Arc::new(FixedProvider(vec![])), Arc::new(NoopMirror));
        assert!(matches!(
            empty.start(25, None).await,
            Err(FlowError::SequenceUnavailable(_))
        ));
        assert_eq!(empty.state(), FlowState::Idle);

        let duplicated = runner_with(
            Arc::new(FixedProvider(vec![
                FlowTask::new("a", "One", 5),
                FlowTask::new("a", "Again", 5),
            ])),
            Arc::new(NoopMirror),
        );
        assert!(matches!(
            duplicated.start(25, None).await,
            Err(FlowError::SequenceUnavailable(msg)) if msg.contains("more than once")
        ));
        assert_eq!(duplicated.state(), FlowState::Idle);
        assert_eq!(holder(&duplicated), None);
    }

    #[tokio::test]
    async fn test_stop_mid_session_clears_lock_and_freezes_sets() {
        let runner = runner();
        runner.start(25, None).await.unwrap();
        runner.complete_task().await.unwrap();

        let debrief = runner.stop().await.unwrap().unwrap();
        assert_eq!(debrief.highlights, vec!["Completed Write outline (10m planned)"]);
        assert_eq!(runner.state(), FlowState::Idle);
        assert_eq!(holder(&runner), None);
        assert_eq!(runner.last_debrief(), Some(debrief));

        let frozen = runner.last_session().unwrap();
        assert_eq!(frozen.completed_task_ids.len(), 1);
        assert!(frozen.skipped_task_ids.is_empty());
        assert_eq!(frozen.current_index, 1);

        // no further mutation once stopped
        assert!(runner.skip_task().await.is_err());
        assert_eq!(runner.last_session(), Some(frozen));
    }

    #[tokio::test]
    async fn test_stop_during_start_supersedes_it() {
        let provider = Arc::new(GatedProvider {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let runner = Arc::new(runner_with(provider.clone(), Arc::new(NoopMirror)));

        let pending = tokio::spawn({
            let runner = Arc::clone(&runner);
            async move { runner.start(25, None).await }
        });
        provider.entered.notified().await;
        assert_eq!(runner.state(), FlowState::Starting);
        assert_eq!(
            runner.complete_task().await,
            Err(FlowError::OperationInFlight)
        );

        assert_eq!(runner.stop().await, Ok(None));
        assert_eq!(runner.state(), FlowState::Idle);

        provider.release.notify_one();
        assert_eq!(pending.await.unwrap(), Err(FlowError::StartSuperseded));
        assert_eq!(runner.state(), FlowState::Idle);
        assert_eq!(holder(&runner), None);
        assert!(runner.snapshot().session.is_none());
    }

    #[tokio::test]
    async fn test_overlapping_transition_is_rejected() {
        let mirror = Arc::new(SlowMirror {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let runner = Arc::new(runner_with(
            Arc::new(StaticSequenceProvider::new(pool())),
            mirror.clone(),
        ));
        runner.start(25, None).await.unwrap();

        let pending = tokio::spawn({
            let runner = Arc::clone(&runner);
            async move { runner.complete_task().await }
        });
        mirror.entered.notified().await;

        assert_eq!(runner.skip_task().await, Err(FlowError::OperationInFlight));
        assert_eq!(runner.stop().await, Err(FlowError::OperationInFlight));

        mirror.release.notify_one();
        assert!(matches!(
            pending.await.unwrap(),
            Ok(StepOutcome::Advanced(_))
        ));
        assert_eq!(holder(&runner).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_mirror_failure_keeps_local_state() {
        let runner = runner_with(
            Arc::new(StaticSequenceProvider::new(pool())),
            Arc::new(FailingMirror),
        );
        runner.start(25, None).await.unwrap();
        runner.skip_task().await.unwrap();

        assert_eq!(runner.state(), FlowState::TaskActive);
        assert_eq!(holder(&runner).as_deref(), Some("b"));

        let diagnostics = runner.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert!(matches!(
            &diagnostics[0],
            FlowError::PersistenceMirrorFailure { kind, .. } if kind == "start"
        ));
    }

    #[tokio::test]
    async fn test_explicit_lock_outside_flow() {
        let runner = runner();
        runner.lock_task("x").unwrap();
        assert_eq!(holder(&runner).as_deref(), Some("x"));

        let err = runner.lock_task("y").unwrap_err();
        assert!(matches!(err, FlowError::LockConflict(_)));
        assert_eq!(holder(&runner).as_deref(), Some("x"));
        assert_eq!(runner.diagnostics(), vec![err]);

        // starting a session takes the lock over
        runner.start(25, None).await.unwrap();
        assert_eq!(holder(&runner).as_deref(), Some("a"));
        assert!(matches!(
            runner.lock_task("x"),
            Err(FlowError::InvalidTransition { .. })
        ));

        runner.stop().await.unwrap();
        runner.lock_task("x").unwrap();
        assert_eq!(runner.unlock_task("y"), Ok(ReleaseOutcome::NotOwner));
        assert_eq!(runner.unlock_task("x"), Ok(ReleaseOutcome::Released));
        assert_eq!(runner.unlock_task("x"), Ok(ReleaseOutcome::NotLocked));
    }

    #[tokio::test]
    async fn test_transitions_are_archived() {
        let history = history();
        let runner = FlowRunner::new(
            Arc::new(StaticSequenceProvider::new(pool())),
            Arc::new(NoopMirror),
            Arc::clone(&history),
        );
        runner.start(25, None).await.unwrap();
        runner.complete_task().await.unwrap();
        runner.stop().await.unwrap();

        let history = history.lock().unwrap();
        let kinds: Vec<_> = history
            .iter()
            .filter(|e| e.kind == KIND_SESSION_EVENT)
            .filter_map(|e| e.payload_str("kind"))
            .collect();
        assert_eq!(kinds, vec!["start", "complete", "stop"]);
    }

    #[tokio::test]
    async fn test_dismiss_debrief() {
        let runner = runner();
        runner.start(25, None).await.unwrap();
        runner.stop().await.unwrap();

        assert!(runner.last_debrief().is_some());
        assert!(runner.dismiss_debrief());
        assert!(!runner.dismiss_debrief());
        assert!(runner.last_debrief().is_none());
    }
}
