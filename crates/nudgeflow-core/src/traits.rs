//! Contracts for the remote collaborators the engine consumes, plus the
//! in-memory implementations used when no service is configured.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::flow::FlowTask;

/// Ordered task plan returned by the sequencing service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSequence {
    pub sequence_id: String,
    pub tasks: Vec<FlowTask>,
    /// Sum of task durations in minutes
    pub total_duration: u32,
}

/// Flow runner transitions mirrored to the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Start,
    Complete,
    Skip,
    Stop,
}

impl SessionEventKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Skip => "skip",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recommendation/sequencing service
#[async_trait]
pub trait SequenceProvider: Send + Sync {
    /// Fetch an ordered task sequence that fits `duration_minutes`
    ///
    /// # Errors
    ///
    /// Returns an error on network failure or when no suitable tasks exist
    async fn get_flow_sequence(
        &self,
        duration_minutes: u32,
        energy_hint: Option<&str>,
    ) -> Result<FlowSequence>;
}

/// Best-effort remote mirror of session transitions
#[async_trait]
pub trait SessionMirror: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the remote store rejects or cannot be reached
    async fn report_session_event(
        &self,
        session_id: &str,
        kind: SessionEventKind,
        payload: Value,
    ) -> Result<()>;
}

/// Fire-and-forget behavioral telemetry. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn send_event(&self, kind: &str, payload: Value);
}

/// Packs a fixed task pool, in order, into the requested duration
#[derive(Debug, Clone, Default)]
pub struct StaticSequenceProvider {
    pool: Vec<FlowTask>,
}

impl StaticSequenceProvider {
    #[must_use]
    pub fn new(pool: Vec<FlowTask>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SequenceProvider for StaticSequenceProvider {
    async fn get_flow_sequence(
        &self,
        duration_minutes: u32,
        energy_hint: Option<&str>,
    ) -> Result<FlowSequence> {
        let mut remaining = duration_minutes;
        let mut tasks = Vec::new();
        for task in &self.pool {
            if task.duration <= remaining {
                remaining -= task.duration;
                let mut task = task.clone();
                task.order = u32::try_from(tasks.len()).unwrap_or(u32::MAX);
                tasks.push(task);
            }
        }

        if tasks.is_empty() {
            bail!("no suitable tasks fit {duration_minutes} minutes");
        }

        let total_duration = tasks.iter().map(|t| t.duration).sum();
        log::debug!(
            "Planned {} tasks ({total_duration}m) for {duration_minutes}m, energy {:?}",
            tasks.len(),
            energy_hint
        );
        Ok(FlowSequence {
            sequence_id: uuid::Uuid::new_v4().to_string(),
            tasks,
            total_duration,
        })
    }
}

/// Mirror that accepts everything and stores nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMirror;

#[async_trait]
impl SessionMirror for NoopMirror {
    async fn report_session_event(
        &self,
        _session_id: &str,
        _kind: SessionEventKind,
        _payload: Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Telemetry sink that only writes to the debug log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn send_event(&self, kind: &str, payload: Value) {
        log::debug!("telemetry {kind}: {payload}");
    }
}
