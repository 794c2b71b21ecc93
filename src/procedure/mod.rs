//! Procedures: runnable measurement units with a `startup → execute → shutdown`
//! lifecycle.
//!
//! A procedure type is registered once as a [`ProcedureDefinition`] (parameter
//! template, output columns, instrument requirements, factory). Sequence
//! expansion turns definitions into concrete [`ProcedureInstance`]s, and the
//! [`lifecycle`] runner drives one instance through its states:
//!
//! ```text
//! Pending ──start──▶ Running ──ok──▶ Finished
//!    │                  ├──error──▶ Failed
//!    └──────abort───────┴──abort──▶ Aborted
//! ```

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::instrument::{InstrumentRequirement, OwnerId};
use crate::parameter::{ParameterSet, ParameterValue};

pub mod context;
pub mod lifecycle;
pub mod registry;

pub use context::StepContext;
pub use lifecycle::{run_step, StepReport};
pub use registry::{ProcedureDefinition, ProcedureFactory, ProcedureRegistry};

/// Name of the base parameter that chains a step into the next one.
pub const CHAINED_EXEC: &str = "chained_exec";

/// Lifecycle state of a procedure instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureStatus {
    Pending,
    Running,
    Finished,
    Aborted,
    Failed,
}

impl ProcedureStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcedureStatus::Finished | ProcedureStatus::Aborted | ProcedureStatus::Failed
        )
    }
}

impl fmt::Display for ProcedureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcedureStatus::Pending => "Pending",
            ProcedureStatus::Running => "Running",
            ProcedureStatus::Finished => "Finished",
            ProcedureStatus::Aborted => "Aborted",
            ProcedureStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Position of a step in a run plan: `template.instance`.
///
/// Derived from the sequence specification alone, so re-expanding the same
/// specification yields the same ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId {
    pub template: usize,
    pub instance: usize,
}

impl StepId {
    pub fn new(template: usize, instance: usize) -> Self {
        Self { template, instance }
    }

    /// Claim owner used by this step with the instrument manager.
    pub fn owner(&self) -> OwnerId {
        OwnerId::new(self.to_string())
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.template, self.instance)
    }
}

/// Capability interface every procedure implements.
///
/// Implementations should yield at their own checkpoints
/// ([`StepContext::checkpoint`], [`StepContext::emit`], [`StepContext::sleep`])
/// so that an abort is observed with bounded latency.
#[async_trait]
pub trait Procedure: Send {
    /// Prepare instruments. Failure fails the step; `execute` and `shutdown` are skipped.
    async fn startup(&mut self, _ctx: &mut StepContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Acquire data, emitting rows through the context.
    async fn execute(&mut self, ctx: &mut StepContext) -> anyhow::Result<()>;

    /// Power down / make safe. Runs after `execute` even when it failed or was aborted.
    async fn shutdown(&mut self, _ctx: &mut StepContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A concrete, planned run of one procedure type.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcedureInstance {
    pub id: StepId,
    pub procedure: String,
    pub parameters: ParameterSet,
    pub data_columns: Vec<String>,
    pub instruments: Vec<InstrumentRequirement>,
    pub skip_startup: bool,
    pub skip_shutdown: bool,
    /// Value of the swept parameter for sweep-expanded instances.
    pub sweep_value: Option<ParameterValue>,
}

impl ProcedureInstance {
    /// Whether this step hands its instrument state to the next step.
    pub fn chained(&self) -> bool {
        self.parameters
            .value(CHAINED_EXEC)
            .map(ParameterValue::is_truthy)
            .unwrap_or(false)
    }
}
