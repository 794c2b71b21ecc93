//! Drives one procedure instance through `startup → execute → shutdown`.
//!
//! Contract:
//! 1. Required instruments are acquired first. An acquisition failure is a
//!    startup failure: the step ends `Failed` and no procedure code runs.
//! 2. `startup` runs unless `skip_startup`. Failure ends the step `Failed`;
//!    `execute` and `shutdown` are never invoked.
//! 3. `execute` emits rows. An abort ends it `Aborted`, an error `Failed`.
//!    Rows already emitted are kept in both cases.
//! 4. `shutdown` runs exactly once unless `skip_shutdown` is set, or the step
//!    is chained and finished normally. A shutdown failure turns `Finished`
//!    into `Failed` but never overwrites `Aborted` or `Failed`.
//! 5. Every claim of the step is released on every exit path.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{ProcedureDefinition, ProcedureInstance, ProcedureStatus, StepContext, StepId};
use crate::error::{DaqError, StepError, StepPhase};
use crate::instrument::InstrumentManager;
use crate::sequence::{AbortSignal, SequenceEvent};

/// Terminal record of one step.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepReport {
    pub id: StepId,
    pub procedure: String,
    pub status: ProcedureStatus,
    /// Whether the lifecycle was entered at all.
    pub started: bool,
    pub rows_emitted: usize,
    /// Error that decided the status, if any.
    pub error: Option<StepError>,
    /// Shutdown failure recorded without changing an already terminal status.
    pub shutdown_error: Option<StepError>,
}

impl StepReport {
    /// Report for a step that never started.
    pub fn not_started(id: StepId, procedure: impl Into<String>, status: ProcedureStatus) -> Self {
        Self {
            id,
            procedure: procedure.into(),
            status,
            started: false,
            rows_emitted: 0,
            error: None,
            shutdown_error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ProcedureStatus::Finished
    }
}

fn is_abort(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<DaqError>(), Some(DaqError::Aborted))
}

/// Run `instance` to a terminal state and release its claims.
///
/// `rows` is shared with the supervisor so it can report progress for a step
/// it had to cut off.
pub async fn run_step(
    instance: ProcedureInstance,
    definition: ProcedureDefinition,
    manager: InstrumentManager,
    events: mpsc::Sender<SequenceEvent>,
    abort: AbortSignal,
    rows: Arc<AtomicUsize>,
) -> StepReport {
    let span = info_span!("step", step = %instance.id, procedure = %instance.procedure);
    async move {
        let owner = instance.id.owner();
        let report = run_lifecycle(&instance, &definition, &manager, events, abort, rows).await;
        manager.release_all(&owner).await;
        info!(status = %report.status, rows = report.rows_emitted, "Step finished");
        report
    }
    .instrument(span)
    .await
}

async fn run_lifecycle(
    instance: &ProcedureInstance,
    definition: &ProcedureDefinition,
    manager: &InstrumentManager,
    events: mpsc::Sender<SequenceEvent>,
    abort: AbortSignal,
    rows: Arc<AtomicUsize>,
) -> StepReport {
    let step = instance.id;
    let mut report = StepReport {
        id: step,
        procedure: instance.procedure.clone(),
        status: ProcedureStatus::Running,
        started: true,
        rows_emitted: 0,
        error: None,
        shutdown_error: None,
    };
    let fail = |report: &mut StepReport, phase: StepPhase, error: DaqError| {
        warn!(%phase, error = %error, "Step failed");
        report.status = ProcedureStatus::Failed;
        report.error = Some(StepError::new(phase, &error));
    };

    let mut ctx = StepContext::new(
        step,
        instance.parameters.clone(),
        instance.data_columns.clone(),
        events,
        abort,
    )
    .with_row_counter(rows);

    let owner = step.owner();
    for requirement in &instance.instruments {
        match manager
            .acquire(&requirement.key, &owner, requirement.mode)
            .await
        {
            Ok(handle) => ctx.attach(requirement.role.clone(), handle),
            Err(e) => {
                fail(&mut report, StepPhase::Acquire, e);
                return report;
            }
        }
    }

    let mut procedure = match definition.build(&instance.parameters) {
        Ok(procedure) => procedure,
        Err(e) => {
            fail(&mut report, StepPhase::Startup, DaqError::step(step.to_string(), StepPhase::Startup, e));
            return report;
        }
    };

    if instance.skip_startup {
        debug!("Skipping startup");
    } else if let Err(e) = procedure.startup(&mut ctx).await {
        if is_abort(&e) {
            report.status = ProcedureStatus::Aborted;
            report.error = Some(StepError::new(StepPhase::Startup, &DaqError::Aborted));
        } else {
            fail(&mut report, StepPhase::Startup, DaqError::step(step.to_string(), StepPhase::Startup, e));
            return report;
        }
    }

    if report.status == ProcedureStatus::Running {
        match procedure.execute(&mut ctx).await {
            Ok(()) => report.status = ProcedureStatus::Finished,
            Err(e) if is_abort(&e) || ctx.should_stop() => {
                info!("Step aborted");
                report.status = ProcedureStatus::Aborted;
                report.error = Some(StepError::new(StepPhase::Execute, &DaqError::Aborted));
            }
            Err(e) => fail(&mut report, StepPhase::Execute, DaqError::step(step.to_string(), StepPhase::Execute, e)),
        }
    }
    report.rows_emitted = ctx.rows_emitted();

    let chained = instance.chained() && report.status == ProcedureStatus::Finished;
    if instance.skip_shutdown {
        debug!("Skipping shutdown");
    } else if chained {
        debug!("Chained execution, leaving instruments as they are");
    } else if let Err(e) = procedure.shutdown(&mut ctx).await {
        let error = DaqError::step(step.to_string(), StepPhase::Shutdown, e);
        if report.status == ProcedureStatus::Finished {
            fail(&mut report, StepPhase::Shutdown, error);
        } else {
            warn!(error = %error, "Shutdown failed");
            report.shutdown_error = Some(StepError::new(StepPhase::Shutdown, &error));
        }
    }

    report
}
