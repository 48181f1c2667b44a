pub mod classifier;
pub mod collector;
pub mod config;
pub mod debrief;
pub mod engine;
pub mod error;
pub mod event;
pub mod flow;
pub mod focus_lock;
pub mod nudge;
pub mod scheduler;
pub mod traits;

pub use classifier::{ClassificationSnapshot, NudgeClassifier};
pub use collector::{ActivityCollector, IdleThresholds, IdleWindow, RawInput, Subscription};
pub use config::EngineConfig;
pub use debrief::SessionDebrief;
pub use engine::{ActionEngine, EngineView};
pub use error::{ConfigError, FlowError, FlowResult, LockError};
pub use event::{ActionEvent, ActionKind, EventHistory};
pub use flow::{
    FlowProgress, FlowRunner, FlowSession, FlowSnapshot, FlowState, FlowTask, StepOutcome,
};
pub use focus_lock::{FocusLockState, FocusLockView, ReleaseOutcome};
pub use nudge::{MicroFlow, Nudge, NudgeType};
pub use scheduler::Scheduler;
pub use traits::{
    FlowSequence, LogTelemetry, NoopMirror, SequenceProvider, SessionEventKind, SessionMirror,
    StaticSequenceProvider, TelemetrySink,
};
