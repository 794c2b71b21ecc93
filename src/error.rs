//! Custom error types for the sequencer.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! classify what can go wrong while a sequence is planned and run.
//!
//! ## Error Hierarchy
//!
//! - **Override resolution** (`UnknownParameter`, `InvalidParameterValue`,
//!   `DuplicateOverride`, `SweepOverrideConflict`, `UnknownProcedure`): fail the
//!   affected step before it starts. Remaining steps are unaffected.
//! - **Acquisition** (`InstrumentUnavailable`, `ModeConflict`): treated as a
//!   startup failure of the step that asked for the instrument.
//! - **`StepExecution`**: raised from a procedure's `startup`, `execute` or
//!   `shutdown`. Carries the step id, the phase and the underlying cause.
//! - **`Aborted`**: returned by a step checkpoint once the abort signal is up.
//! - **`SequenceAbortTimeout`**: a step did not terminate within the abort
//!   deadline. Always resolved by forced teardown, never surfaced as a crash.
//! - **`Configuration`** / **`FeatureNotEnabled`** / **`Io`** / **`Engine`**: ambient failures.
//!
//! [`StepError`] is the cloneable record of any of these that ends up in a
//! step report.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Lifecycle phase in which a step error happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPhase {
    /// Override / sweep resolution during plan expansion.
    Resolve,
    /// Instrument acquisition before startup.
    Acquire,
    /// `Procedure::startup`.
    Startup,
    /// `Procedure::execute`.
    Execute,
    /// `Procedure::shutdown`.
    Shutdown,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepPhase::Resolve => "resolve",
            StepPhase::Acquire => "acquire",
            StepPhase::Startup => "startup",
            StepPhase::Execute => "execute",
            StepPhase::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameterValue { name: String, reason: String },

    #[error("Parameter '{0}' is overridden more than once")]
    DuplicateOverride(String),

    #[error("Parameter '{0}' is both overridden and swept")]
    SweepOverrideConflict(String),

    #[error("No procedure registered under '{0}'")]
    UnknownProcedure(String),

    #[error("Instrument '{key}' unavailable: {reason}")]
    InstrumentUnavailable { key: String, reason: String },

    #[error("Instrument '{key}' is held {held} by '{holder}', cannot grant {requested} to '{requested_by}'")]
    ModeConflict {
        key: String,
        held: String,
        holder: String,
        requested: String,
        requested_by: String,
    },

    #[error("Step {step} failed during {phase}: {source}")]
    StepExecution {
        step: String,
        phase: StepPhase,
        #[source]
        source: anyhow::Error,
    },

    #[error("Aborted by request")]
    Aborted,

    #[error("Step {step} did not terminate within {timeout:?} after abort")]
    SequenceAbortTimeout {
        step: String,
        timeout: std::time::Duration,
    },

    #[error("Row for step {step} has {got} values, expected {expected}")]
    RowArity {
        step: String,
        expected: usize,
        got: usize,
    },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine task failed: {0}")]
    Engine(String),
}

/// Coarse classification reported alongside a step's terminal status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownParameter,
    InvalidParameterValue,
    DuplicateOverride,
    SweepOverrideConflict,
    UnknownProcedure,
    InstrumentUnavailable,
    ModeConflict,
    StepExecution,
    Aborted,
    AbortTimeout,
    RowArity,
    Other,
}

/// Serializable, cloneable record of a step error for reports and events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub phase: StepPhase,
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(phase: StepPhase, error: &DaqError) -> Self {
        Self {
            phase,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.message)
    }
}

impl DaqError {
    /// Wraps a procedure failure with the step and phase it came from.
    pub fn step(step: impl Into<String>, phase: StepPhase, source: anyhow::Error) -> Self {
        DaqError::StepExecution {
            step: step.into(),
            phase,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::UnknownParameter(_) => ErrorKind::UnknownParameter,
            DaqError::InvalidParameterValue { .. } => ErrorKind::InvalidParameterValue,
            DaqError::DuplicateOverride(_) => ErrorKind::DuplicateOverride,
            DaqError::SweepOverrideConflict(_) => ErrorKind::SweepOverrideConflict,
            DaqError::UnknownProcedure(_) => ErrorKind::UnknownProcedure,
            DaqError::InstrumentUnavailable { .. } => ErrorKind::InstrumentUnavailable,
            DaqError::ModeConflict { .. } => ErrorKind::ModeConflict,
            DaqError::StepExecution { .. } => ErrorKind::StepExecution,
            DaqError::Aborted => ErrorKind::Aborted,
            DaqError::SequenceAbortTimeout { .. } => ErrorKind::AbortTimeout,
            DaqError::RowArity { .. } => ErrorKind::RowArity,
            DaqError::Configuration(_)
            | DaqError::FeatureNotEnabled(_)
            | DaqError::Io(_)
            | DaqError::Engine(_) => ErrorKind::Other,
        }
    }

    /// Whether this error is an override-resolution failure.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            DaqError::UnknownParameter(_)
                | DaqError::InvalidParameterValue { .. }
                | DaqError::DuplicateOverride(_)
                | DaqError::SweepOverrideConflict(_)
                | DaqError::UnknownProcedure(_)
        )
    }

    /// Whether this error is an instrument acquisition failure.
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            DaqError::InstrumentUnavailable { .. } | DaqError::ModeConflict { .. }
        )
    }
}
