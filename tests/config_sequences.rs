//! Sequences defined in the configuration file, run into the CSV sink.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use lab_sequencer::config::SequencerConfig;
use lab_sequencer::instrument::SimulatedDriver;
use lab_sequencer::procedure::ProcedureStatus;
use lab_sequencer::procedures::builtin_registry;
use lab_sequencer::sequence::{RunPlan, SequenceEngine};

fn sample_config() -> SequencerConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/sequencer.toml");
    SequencerConfig::load_from(path).unwrap()
}

#[test]
fn sample_config_sequences_expand_cleanly() {
    let config = sample_config();
    let registry = builtin_registry(&config.instruments);

    for definition in &config.sequences {
        let plan = RunPlan::expand(&definition.to_spec(), &registry);
        assert!(plan.rejected.is_empty(), "{}: {:?}", definition.name, plan.rejected);
    }

    let plan = RunPlan::expand(&config.sequence("It_vs_temperature").unwrap().to_spec(), &registry);
    assert_eq!(plan.len(), 5);
    // Common values reach every step, including ones the procedure does not declare
    for step in &plan.steps {
        assert!(step.parameters.contains("chip_number"));
    }
    let it = plan.steps.iter().find(|s| s.procedure == "It").unwrap();
    assert_eq!(it.instruments[0].key, "GPIB0::26::INSTR");
    assert!(it.chained());
}

#[test]
fn common_value_violating_constraint_rejects_template() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(
        br#"
        [[sequences]]
        name = "bad"
        common = { vds = 5.0 }

        [[sequences.steps]]
        procedure = "Wait"

        [[sequences.steps]]
        procedure = "IVg"
        "#,
    )
    .unwrap();
    let config = SequencerConfig::load_from(file.path()).unwrap();
    let registry = builtin_registry(&config.instruments);

    let plan = RunPlan::expand(&config.sequence("bad").unwrap().to_spec(), &registry);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.rejected.len(), 1);
    assert_eq!(plan.rejected[0].template_index, 1);
}

#[cfg(feature = "storage_csv")]
#[tokio::test(start_paused = true)]
async fn smoke_sequence_writes_one_csv_per_step() {
    use lab_sequencer::storage::CsvSink;

    let config = sample_config();
    let registry = Arc::new(builtin_registry(&config.instruments));
    let engine = SequenceEngine::new(registry, Arc::new(SimulatedDriver::new()))
        .with_config(config.engine.clone());
    let plan = engine.plan(&config.sequence("smoke").unwrap().to_spec());
    assert_eq!(plan.len(), 5);

    let dir = tempfile::tempdir().unwrap();
    let mut sink = CsvSink::new(dir.path()).unwrap();
    let report = engine.spawn(plan).finish_into(&mut sink).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.count(ProcedureStatus::Finished), 5);
    assert_eq!(sink.written().len(), 5);

    let first = std::fs::read_to_string(&sink.written()[0]).unwrap();
    assert!(first.starts_with("# Procedure: Fake\n# Step: 0.0\n"));
    assert!(first.contains("#\ttotal_time: 2 s"));
    let data: Vec<&str> = first.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(data[0], "t (s),fake_data");
    assert_eq!(data.len() - 1, report.steps[0].rows_emitted);
    assert!(report.steps[0].rows_emitted > 0);

    let wait = std::fs::read_to_string(&sink.written()[1]).unwrap();
    assert!(wait.starts_with("# Procedure: Wait\n"));
    assert!(wait.lines().all(|l| l.starts_with('#')));
}
