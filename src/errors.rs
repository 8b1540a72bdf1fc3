//! Typed error hierarchy for the lifecycle core.
//!
//! Three top-level enums cover the three error-propagation phases described
//! by the orchestrator contract:
//! - `ConfigError` — raised only during construction, before any I/O happens
//! - `PlanningError` — raised by `Sequencer::plan`, leaves state untouched
//! - `ExecutionError` — raised by the `Executor`, always carries the part and
//!   step that failed

use thiserror::Error;

use crate::step::Step;

/// Errors raised while constructing a `PartSpec`, `ProjectInfo`, or
/// `LifecycleManager`. These are always fatal and never leave partial state
/// on disk: construction either fully succeeds or fully fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid application name '{0}': must match ^[A-Za-z][0-9A-Za-z_]*$")]
    InvalidApplicationName(String),

    #[error("parts specification is missing the top-level 'parts' key")]
    MissingPartsKey,

    #[error("part '{part}' is malformed: {message}")]
    MalformedPart { part: String, message: String },

    #[error("part '{part}' does not declare a plugin and its name is not a known plugin")]
    UndefinedPlugin { part: String },

    #[error("part '{part}' references unknown plugin '{plugin}'")]
    InvalidPlugin { part: String, plugin: String },

    #[error("part '{part}' uses plugin '{plugin}' which does not support strict mode")]
    PluginNotStrict { part: String, plugin: String },

    #[error("part '{part}' specification is invalid: {errors:?}")]
    PartSpecificationError { part: String, errors: Vec<String> },

    #[error("part '{part}' depends on unknown part '{dependency}'")]
    InvalidPartName { part: String, dependency: String },

    #[error("circular dependency detected among parts: {cycle:?}")]
    CircularDependency { cycle: Vec<String> },

    #[error("source option '{option}' is not valid for source-type '{source_type}'")]
    InvalidSourceOption { source_type: String, option: String },

    #[error("feature error: {0}")]
    FeatureError(String),

    #[error("overlays are only supported on Linux")]
    OverlayPlatformError,

    #[error("overlays require elevated privileges")]
    OverlayPermissionError,

    #[error("base_layer_dir must be specified if using overlays")]
    OverlayBaseLayerDirMissing,

    #[error("base_layer_hash must be specified if using overlays")]
    OverlayBaseLayerHashMissing,

    #[error("invalid partition name '{0}'")]
    InvalidPartitionName(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by `Sequencer::plan`. Planning errors are fatal to the
/// `plan()` call but never mutate on-disk state.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("requested unknown part '{0}'")]
    UnknownPart(String),

    #[error("no viable topological order exists for the part graph: {cycle:?}")]
    NoViableOrder { cycle: Vec<String> },
}

/// Errors raised while executing an action. Always carries the part name and
/// step that failed so the host can report precisely what broke.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("part '{part}' step {step:?}: source fetch failed: {message}")]
    SourceFetchFailed {
        part: String,
        step: Step,
        message: String,
    },

    #[error("part '{part}' step {step:?}: checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        part: String,
        step: Step,
        expected: String,
        actual: String,
    },

    #[error("part '{part}' step {step:?}: subprocess exited with status {code}")]
    SubprocessFailed { part: String, step: Step, code: i32 },

    #[error("part '{part}' step {step:?}: file '{path}' conflicts with part '{other_part}'")]
    StageFilesConflict {
        part: String,
        step: Step,
        path: String,
        other_part: String,
    },

    #[error("part '{part}' step {step:?}: failed to persist state: {message}")]
    StateWriteFailed {
        part: String,
        step: Step,
        message: String,
    },

    #[error("execution was cancelled for part '{part}' step {step:?}")]
    Cancelled { part: String, step: Step },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutionError {
    /// The part name this error is attached to, if any.
    pub fn part(&self) -> Option<&str> {
        match self {
            Self::SourceFetchFailed { part, .. }
            | Self::ChecksumMismatch { part, .. }
            | Self::SubprocessFailed { part, .. }
            | Self::StageFilesConflict { part, .. }
            | Self::StateWriteFailed { part, .. }
            | Self::Cancelled { part, .. } => Some(part),
            Self::Other(_) => None,
        }
    }
}
