//! End-to-end sequence runs against simulated instruments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lab_sequencer::config::{EngineConfig, InstrumentsConfig};
use lab_sequencer::error::{ErrorKind, StepPhase};
use lab_sequencer::instrument::{AccessMode, InstrumentRequirement, SimulatedDriver};
use lab_sequencer::parameter::{ParameterBuilder, ParameterSet, ParameterValue};
use lab_sequencer::procedure::{
    Procedure, ProcedureDefinition, ProcedureRegistry, ProcedureStatus, StepContext, StepId,
};
use lab_sequencer::procedures::builtin_registry;
use lab_sequencer::sequence::{RunPlan, SequenceEngine, SequenceEvent, SequenceSpec, StepTemplate};
use lab_sequencer::storage::{drain_events, MemorySink};

/// Emits `rows_before_fault` rows, then reports a hardware fault.
struct Flaky {
    rows_before_fault: usize,
}

#[async_trait]
impl Procedure for Flaky {
    async fn execute(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        let meter = ctx.instrument("meter")?.clone();
        for i in 0..self.rows_before_fault {
            let current = meter.read("current").await?;
            ctx.emit(vec![i as f64, current]).await?;
        }
        anyhow::bail!("compliance reached")
    }
}

fn registry() -> Arc<ProcedureRegistry> {
    let mut registry = builtin_registry(&InstrumentsConfig::default());
    registry.register(
        ProcedureDefinition::new("Flaky", |params: &ParameterSet| -> anyhow::Result<Box<dyn Procedure>> {
            let rows = params.value("rows").and_then(ParameterValue::as_i64).unwrap_or(0);
            Ok(Box::new(Flaky {
                rows_before_fault: rows as usize,
            }))
        })
        .parameters(ParameterSet::new().with(ParameterBuilder::new("rows", 2).min(0.0).build()))
        .columns(["n", "I (A)"])
        .instrument(InstrumentRequirement::new("meter", "meter", AccessMode::Exclusive)),
    );
    Arc::new(registry)
}

fn short_ivg() -> StepTemplate {
    StepTemplate::new("IVg")
        .with_override("vg_start", -1.0)
        .with_override("vg_end", 1.0)
        .with_override("vg_step", 0.5)
}

fn short_it() -> StepTemplate {
    StepTemplate::new("It")
        .with_override("laser_v", 2.0)
        .with_override("laser_T", 2.0)
        .with_override("sampling_t", 0.5)
}

#[test]
fn expansion_is_deterministic_across_registries() {
    let spec = SequenceSpec::new("twice")
        .common(ParameterSet::from_values([("vds", 0.05)]))
        .step(short_ivg())
        .step(short_it().sweep("target_T", [10, 20, 30]));

    let first = RunPlan::expand(&spec, &registry());
    let second = RunPlan::expand(&spec, &registry());
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

#[test]
fn scenario_override_and_sweep() {
    let spec = SequenceSpec::new("scenario")
        .common(ParameterSet::from_values([("vds", 0.075)]))
        .step(StepTemplate::new("It").with_override("vg", 1.0))
        .step(StepTemplate::new("It").sweep("target_T", [10.0, 20.0, 30.0]));
    let plan = RunPlan::expand(&spec, &registry());

    let ids: Vec<StepId> = plan.steps.iter().map(|s| s.id).collect();
    assert_eq!(
        ids,
        [StepId::new(0, 0), StepId::new(1, 0), StepId::new(1, 1), StepId::new(1, 2)]
    );
    assert_eq!(plan.steps[0].parameters.value("vg"), Some(&ParameterValue::Float(1.0)));
    for (step, target) in plan.steps[1..].iter().zip([10.0, 20.0, 30.0]) {
        assert_eq!(step.parameters.value("vds"), Some(&ParameterValue::Float(0.075)));
        assert_eq!(step.parameters.value("vg"), Some(&ParameterValue::Float(0.0)));
        assert_eq!(step.parameters.value("target_T"), Some(&ParameterValue::Float(target)));
    }
}

#[test]
fn sweep_of_n_values_yields_n_instances() {
    let values: Vec<f64> = (0..7).map(|i| i as f64 * 0.5).collect();
    let spec = SequenceSpec::new("sweep").step(StepTemplate::new("It").sweep("laser_v", values.clone()));
    let plan = RunPlan::expand(&spec, &registry());

    assert_eq!(plan.len(), 7);
    let swept: Vec<f64> = plan
        .steps
        .iter()
        .filter_map(|s| s.sweep_value.as_ref().and_then(ParameterValue::as_f64))
        .collect();
    assert_eq!(swept, values);
}

#[tokio::test(start_paused = true)]
async fn instruments_open_and_close_once_per_run() {
    let driver = SimulatedDriver::new();
    let engine = SequenceEngine::new(registry(), Arc::new(driver.clone()));
    let spec = SequenceSpec::new("shared")
        .step(short_ivg())
        .step(short_it())
        .step(short_ivg());

    let mut sink = MemorySink::new();
    let report = engine
        .spawn(engine.plan(&spec))
        .finish_into(&mut sink)
        .await
        .unwrap();

    assert!(report.succeeded(), "{:?}", report.steps);
    for key in ["meter", "gate"] {
        assert_eq!(driver.opens_of(key).await, 1, "{}", key);
        assert_eq!(driver.closes_of(key).await, 1, "{}", key);
    }
    assert_eq!(driver.opens_of("laser").await, 1);
    assert_eq!(driver.closes_of("laser").await, 1);

    // 13 gate points per IVg step
    assert_eq!(sink.rows_for(StepId::new(0, 0)).len(), 13);
    assert_eq!(sink.rows_for(StepId::new(2, 0)).len(), 13);
    assert_eq!(sink.report().map(|r| r.steps.len()), Some(3));
}

#[tokio::test]
async fn failing_step_keeps_its_rows_and_sequence_continues() {
    let driver = SimulatedDriver::new();
    let engine = SequenceEngine::new(registry(), Arc::new(driver.clone()));
    let spec = SequenceSpec::new("flaky")
        .step(StepTemplate::new("Flaky"))
        .step(StepTemplate::new("Wait").with_override("wait_time", 0.0));

    let mut sink = MemorySink::new();
    let report = engine
        .spawn(engine.plan(&spec))
        .finish_into(&mut sink)
        .await
        .unwrap();

    let failed = &report.steps[0];
    assert_eq!(failed.status, ProcedureStatus::Failed);
    assert_eq!(failed.rows_emitted, 2);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.phase, StepPhase::Execute);
    assert!(error.message.contains("compliance reached"));
    assert_eq!(sink.rows_for(StepId::new(0, 0)).len(), 2);

    assert_eq!(report.steps[1].status, ProcedureStatus::Finished);
    assert_eq!(driver.closes_of("meter").await, 1);
}

#[tokio::test(start_paused = true)]
async fn abort_during_second_of_three_steps() {
    let driver = SimulatedDriver::new();
    let engine = SequenceEngine::new(registry(), Arc::new(driver.clone())).with_config(EngineConfig {
        abort_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    });
    let spec = SequenceSpec::new("interrupted")
        .step(short_ivg())
        .step(StepTemplate::new("It").with_override("laser_T", 600.0))
        .step(short_ivg());

    let mut handle = engine.spawn(engine.plan(&spec));
    let abort = handle.abort_handle();
    let mut second_step_rows = 0;
    while let Some(event) = handle.events().recv().await {
        if let SequenceEvent::Row { step, .. } = event {
            if step == StepId::new(1, 0) {
                second_step_rows += 1;
                if second_step_rows == 3 {
                    abort.abort();
                }
            }
        }
    }
    let report = handle.join().await.unwrap();

    assert!(report.aborted);
    assert_eq!(report.steps[0].status, ProcedureStatus::Finished);
    assert_eq!(report.steps[1].status, ProcedureStatus::Aborted);
    assert!(report.steps[1].started);
    assert_eq!(report.steps[1].rows_emitted, 3);
    assert_eq!(report.steps[2].status, ProcedureStatus::Aborted);
    assert!(!report.steps[2].started);

    for key in ["meter", "gate", "laser"] {
        assert_eq!(driver.opens_of(key).await, 1, "{}", key);
        assert_eq!(driver.closes_of(key).await, 1, "{}", key);
    }
    // Aborted step still ran its shutdown
    let laser = driver.instrument("laser").await.unwrap();
    assert_eq!(laser.property("output").await, Some(0.0));
}

#[tokio::test]
async fn unknown_override_fails_only_its_template() {
    let driver = SimulatedDriver::new();
    let engine = SequenceEngine::new(registry(), Arc::new(driver.clone()));
    let spec = SequenceSpec::new("typo")
        .step(StepTemplate::new("Wait").with_override("wait_time", 0.0))
        .step(StepTemplate::new("It").with_override("vgs", 1.0))
        .step(StepTemplate::new("Wait").with_override("wait_time", 0.0));

    let plan = engine.plan(&spec);
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.rejected[0].error.kind, ErrorKind::UnknownParameter);

    let report = engine.spawn(plan).join().await.unwrap();
    let statuses: Vec<ProcedureStatus> = report.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        [ProcedureStatus::Finished, ProcedureStatus::Failed, ProcedureStatus::Finished]
    );
    assert!(!report.steps[1].started);
    assert_eq!(driver.opens_of("meter").await, 0);
}

#[tokio::test]
async fn unavailable_instrument_fails_step_before_procedure_code() {
    let driver = SimulatedDriver::new().with_unavailable("meter");
    let engine = SequenceEngine::new(registry(), Arc::new(driver.clone()));
    let spec = SequenceSpec::new("no meter").step(StepTemplate::new("Flaky"));

    let mut sink = MemorySink::new();
    let mut handle = engine.spawn(engine.plan(&spec));
    drain_events(handle.events(), &mut sink).await.unwrap();
    let report = handle.join().await.unwrap();

    let step = &report.steps[0];
    assert_eq!(step.status, ProcedureStatus::Failed);
    assert_eq!(step.rows_emitted, 0);
    let error = step.error.as_ref().unwrap();
    assert_eq!(error.phase, StepPhase::Acquire);
    assert_eq!(error.kind, ErrorKind::InstrumentUnavailable);
    assert!(sink.rows().is_empty());
}
