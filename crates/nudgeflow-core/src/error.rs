//! Error types for the action engine.
//!
//! Flow Runner failures are typed so presentation can render an inline
//! message and keep the user in the prior state. Collaborator plumbing uses
//! `anyhow` and is folded into these variants at the runner boundary.

use std::path::PathBuf;
use thiserror::Error;

use crate::flow::FlowState;

/// Errors surfaced by the Flow Runner API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// The operation is not allowed from the current state
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: FlowState,
    },

    /// The sequencing service failed or returned nothing usable
    #[error("no task sequence available: {0}")]
    SequenceUnavailable(String),

    /// Another task already holds the focus lock
    #[error(transparent)]
    LockConflict(#[from] LockError),

    /// Best-effort remote mirroring failed; local state is unaffected
    #[error("session mirror failed for {kind}: {message}")]
    PersistenceMirrorFailure { kind: String, message: String },

    /// A transition for this runner is still in flight
    #[error("another flow operation is still in progress")]
    OperationInFlight,

    /// The session was stopped before the pending start resolved
    #[error("start was superseded before the task sequence arrived")]
    StartSuperseded,
}

/// Focus lock acquisition failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("focus lock is held by task {held}, cannot lock {requested}")]
    AlreadyLocked { held: String, requested: String },
}

/// Configuration file errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write configuration to {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;
