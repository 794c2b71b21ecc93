//! Sequences: specification, expansion into a run plan, and execution.
//!
//! ```text
//! SequenceSpec ──RunPlan::expand──▶ RunPlan ──SequenceEngine::spawn──▶ SequenceHandle
//!                                                    │                     ├─ AbortHandle
//!                                                    └── SequenceEvent ───▶└─ events
//! ```
//!
//! The engine runs steps strictly one after another on its own task. The
//! caller keeps the [`SequenceHandle`] to raise the abort flag and to consume
//! the row stream concurrently.

use serde::Serialize;

use crate::parameter::ParameterSet;
use crate::procedure::{StepId, StepReport};

pub mod abort;
pub mod engine;
pub mod plan;
pub mod spec;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use engine::{FailurePolicy, SequenceEngine, SequenceHandle, SequenceReport};
pub use plan::{RejectedTemplate, RunPlan};
pub use spec::{SequenceSpec, StepTemplate, SweepDirective};

/// Outbound stream of a sequence run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum SequenceEvent {
    /// A step entered its lifecycle.
    StepStarted {
        step: StepId,
        procedure: String,
        parameters: ParameterSet,
        columns: Vec<String>,
    },
    /// One result row, in `columns` order.
    Row { step: StepId, values: Vec<f64> },
    /// A step reached a terminal status (including steps that never started).
    StepFinished(StepReport),
    /// The run is over and every instrument has been released.
    SequenceFinished(SequenceReport),
}
