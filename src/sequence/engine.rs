//! Sequence engine: runs a [`RunPlan`] step by step.
//!
//! Each step runs on its own tokio task while the engine supervises it:
//!
//! - between steps the abort flag is checked; once it is up no further step
//!   starts (those steps are reported `Aborted` with `started = false`);
//! - when the flag goes up during a step, the step keeps running until it
//!   observes the flag at a checkpoint. If it has not terminated within
//!   `abort_timeout`, the engine cancels the task, marks the step `Aborted`
//!   and releases the step's claims itself;
//! - with [`FailurePolicy::StopOnFailure`] the first failed step ends the run;
//! - when the run ends, the execution-wide hold on every instrument is
//!   released exactly once, which closes every connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::plan::PlanEntry;
use super::{abort_pair, AbortHandle, AbortSignal, RunPlan, SequenceEvent, SequenceSpec};
use crate::config::EngineConfig;
use crate::error::{AppResult, DaqError, StepError, StepPhase};
use crate::error_recovery::RetryPolicy;
use crate::instrument::{InstrumentDriver, InstrumentManager, OwnerId};
use crate::procedure::{run_step, ProcedureInstance, ProcedureRegistry, ProcedureStatus, StepReport};
use crate::storage::{drain_events, ResultSink};

/// What the engine does after a failed step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and carry on with the next step.
    #[default]
    Continue,
    /// Stop the sequence at the first failed step.
    #[serde(rename = "stop")]
    StopOnFailure,
}

/// Outcome of a whole sequence run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SequenceReport {
    pub sequence: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Whether the abort flag was raised during the run.
    pub aborted: bool,
    pub steps: Vec<StepReport>,
}

impl SequenceReport {
    /// Every step finished.
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(StepReport::succeeded)
    }

    pub fn count(&self, status: ProcedureStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn total_rows(&self) -> usize {
        self.steps.iter().map(|s| s.rows_emitted).sum()
    }
}

/// Caller's side of a running sequence.
pub struct SequenceHandle {
    abort: AbortHandle,
    events: mpsc::Receiver<SequenceEvent>,
    task: JoinHandle<SequenceReport>,
}

impl SequenceHandle {
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Raise the abort flag.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Outbound event stream. Must be drained for the run to make progress.
    pub fn events(&mut self) -> &mut mpsc::Receiver<SequenceEvent> {
        &mut self.events
    }

    /// Wait for the run to end, discarding any undelivered events.
    pub async fn join(self) -> AppResult<SequenceReport> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| DaqError::Engine(e.to_string()))
    }

    /// Pump every event into `sink`, then wait for the run to end.
    ///
    /// A sink failure raises the abort flag so the run winds down.
    pub async fn finish_into<S>(mut self, sink: &mut S) -> anyhow::Result<SequenceReport>
    where
        S: ResultSink + ?Sized,
    {
        let drained = drain_events(&mut self.events, sink).await;
        if drained.is_err() {
            self.abort.abort();
        }
        let report = self.join().await?;
        drained?;
        Ok(report)
    }
}

/// Runs sequences against a procedure registry and an instrument driver.
#[derive(Clone)]
pub struct SequenceEngine {
    registry: Arc<ProcedureRegistry>,
    driver: Arc<dyn InstrumentDriver>,
    config: EngineConfig,
    retry: RetryPolicy,
}

impl SequenceEngine {
    pub fn new(registry: Arc<ProcedureRegistry>, driver: Arc<dyn InstrumentDriver>) -> Self {
        Self {
            registry,
            driver,
            config: EngineConfig::default(),
            retry: RetryPolicy::no_retry(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Retry policy for physical instrument opens.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Expand `spec` against this engine's registry.
    pub fn plan(&self, spec: &SequenceSpec) -> RunPlan {
        RunPlan::expand(spec, &self.registry)
    }

    /// Start executing `plan` on a dedicated task.
    pub fn spawn(&self, plan: RunPlan) -> SequenceHandle {
        let (abort, signal) = abort_pair();
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let run = SequenceRun {
            engine: self.clone(),
            events: tx,
            signal,
        };
        let task = tokio::spawn(run.execute(plan));
        SequenceHandle {
            abort,
            events: rx,
            task,
        }
    }
}

struct SequenceRun {
    engine: SequenceEngine,
    events: mpsc::Sender<SequenceEvent>,
    signal: AbortSignal,
}

impl SequenceRun {
    async fn execute(self, plan: RunPlan) -> SequenceReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("sequence", name = %plan.sequence, run = %run_id);
        self.execute_inner(plan, run_id).instrument(span).await
    }

    async fn execute_inner(self, plan: RunPlan, run_id: Uuid) -> SequenceReport {
        let started_at = Utc::now();
        let manager = InstrumentManager::new(self.engine.driver.clone(), OwnerId::execution(run_id))
            .with_retry_policy(self.engine.retry.clone());
        info!(steps = plan.len(), rejected = plan.rejected.len(), "Sequence started");

        let mut steps = Vec::with_capacity(plan.len() + plan.rejected.len());
        let mut halted = false;

        for entry in plan.entries() {
            let report = match entry {
                PlanEntry::Rejected(rejected) => StepReport {
                    error: Some(rejected.error.clone()),
                    ..StepReport::not_started(
                        crate::procedure::StepId::new(rejected.template_index, 0),
                        rejected.procedure.clone(),
                        ProcedureStatus::Failed,
                    )
                },
                PlanEntry::Step(instance) if halted || self.signal.is_raised() => {
                    StepReport::not_started(instance.id, instance.procedure.clone(), ProcedureStatus::Aborted)
                }
                PlanEntry::Step(instance) => self.run_instance(instance, &manager).await,
            };

            if report.status == ProcedureStatus::Failed
                && self.engine.config.failure_policy == FailurePolicy::StopOnFailure
                && !halted
            {
                warn!(step = %report.id, "Stopping sequence after failed step");
                halted = true;
            }

            self.send(SequenceEvent::StepFinished(report.clone())).await;
            steps.push(report);
        }

        let released = manager.release_all(manager.execution_owner()).await;
        info!(
            released,
            opens = manager.opens(),
            closes = manager.closes(),
            "Instruments released"
        );

        let report = SequenceReport {
            sequence: plan.sequence.clone(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            aborted: self.signal.is_raised(),
            steps,
        };
        info!(
            finished = report.count(ProcedureStatus::Finished),
            failed = report.count(ProcedureStatus::Failed),
            aborted = report.count(ProcedureStatus::Aborted),
            "Sequence finished"
        );
        self.send(SequenceEvent::SequenceFinished(report.clone())).await;
        report
    }

    async fn run_instance(&self, instance: &ProcedureInstance, manager: &InstrumentManager) -> StepReport {
        let definition = match self.engine.registry.get(&instance.procedure) {
            Ok(definition) => definition.clone(),
            Err(e) => {
                return StepReport {
                    error: Some(StepError::new(StepPhase::Resolve, &e)),
                    ..StepReport::not_started(instance.id, instance.procedure.clone(), ProcedureStatus::Failed)
                }
            }
        };

        self.send(SequenceEvent::StepStarted {
            step: instance.id,
            procedure: instance.procedure.clone(),
            parameters: instance.parameters.clone(),
            columns: instance.data_columns.clone(),
        })
        .await;

        let rows = Arc::new(AtomicUsize::new(0));
        let mut task = tokio::spawn(run_step(
            instance.clone(),
            definition,
            manager.clone(),
            self.events.clone(),
            self.signal.clone(),
            rows.clone(),
        ));

        let mut abort = self.signal.clone();
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = abort.raised() => {
                let timeout = self.engine.config.abort_timeout;
                info!(step = %instance.id, ?timeout, "Abort requested, waiting for step");
                match tokio::time::timeout(timeout, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        let error = DaqError::SequenceAbortTimeout {
                            step: instance.id.to_string(),
                            timeout,
                        };
                        warn!(error = %error, "Forcing teardown");
                        task.abort();
                        // Wait for the cancellation so the step's futures are dropped.
                        let _ = task.await;
                        manager.release_all(&instance.id.owner()).await;
                        return StepReport {
                            id: instance.id,
                            procedure: instance.procedure.clone(),
                            status: ProcedureStatus::Aborted,
                            started: true,
                            rows_emitted: rows.load(Ordering::SeqCst),
                            error: Some(StepError::new(StepPhase::Execute, &error)),
                            shutdown_error: None,
                        };
                    }
                }
            }
        };

        match joined {
            Ok(report) => report,
            Err(e) => {
                let error = DaqError::Engine(e.to_string());
                warn!(step = %instance.id, error = %error, "Step task died");
                manager.release_all(&instance.id.owner()).await;
                StepReport {
                    id: instance.id,
                    procedure: instance.procedure.clone(),
                    status: ProcedureStatus::Failed,
                    started: true,
                    rows_emitted: rows.load(Ordering::SeqCst),
                    error: Some(StepError::new(StepPhase::Execute, &error)),
                    shutdown_error: None,
                }
            }
        }
    }

    async fn send(&self, event: SequenceEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.events.send(event).await;
    }
}
