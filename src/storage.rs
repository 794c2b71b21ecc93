//! Result sinks consuming the outbound event stream, with clean feature flag handling.
use crate::{
    parameter::ParameterSet,
    procedure::{StepId, StepReport},
    sequence::{SequenceEvent, SequenceReport},
};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Consumer of a sequence's results.
#[async_trait]
pub trait ResultSink: Send {
    /// A step entered its lifecycle; `parameters` are its effective values.
    async fn begin_step(
        &mut self,
        step: StepId,
        procedure: &str,
        parameters: &ParameterSet,
        columns: &[String],
    ) -> Result<()>;

    /// One row of `step`, in column order.
    async fn write_row(&mut self, step: StepId, values: &[f64]) -> Result<()>;

    /// A step reached its terminal status.
    async fn end_step(&mut self, report: &StepReport) -> Result<()>;

    /// The run is over.
    async fn finish(&mut self, report: &SequenceReport) -> Result<()>;
}

/// Pump every event from `events` into `sink` until the stream closes.
pub async fn drain_events<S>(events: &mut mpsc::Receiver<SequenceEvent>, sink: &mut S) -> Result<()>
where
    S: ResultSink + ?Sized,
{
    while let Some(event) = events.recv().await {
        match event {
            SequenceEvent::StepStarted {
                step,
                procedure,
                parameters,
                columns,
            } => sink.begin_step(step, &procedure, &parameters, &columns).await?,
            SequenceEvent::Row { step, values } => sink.write_row(step, &values).await?,
            SequenceEvent::StepFinished(report) => sink.end_step(&report).await?,
            SequenceEvent::SequenceFinished(report) => sink.finish(&report).await?,
        }
    }
    Ok(())
}

// ============================================================================
// Memory Sink
// ============================================================================

/// Keeps everything in memory. Used by tests and for small interactive runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    started: Vec<(StepId, String)>,
    rows: Vec<(StepId, Vec<f64>)>,
    finished: Vec<StepReport>,
    report: Option<SequenceReport>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Started steps with their procedure name, in start order.
    pub fn started(&self) -> &[(StepId, String)] {
        &self.started
    }

    /// Every row received, in arrival order.
    pub fn rows(&self) -> &[(StepId, Vec<f64>)] {
        &self.rows
    }

    pub fn rows_for(&self, step: StepId) -> Vec<&[f64]> {
        self.rows
            .iter()
            .filter(|(id, _)| *id == step)
            .map(|(_, values)| values.as_slice())
            .collect()
    }

    pub fn finished(&self) -> &[StepReport] {
        &self.finished
    }

    pub fn report(&self) -> Option<&SequenceReport> {
        self.report.as_ref()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn begin_step(
        &mut self,
        step: StepId,
        procedure: &str,
        _parameters: &ParameterSet,
        _columns: &[String],
    ) -> Result<()> {
        self.started.push((step, procedure.to_string()));
        Ok(())
    }

    async fn write_row(&mut self, step: StepId, values: &[f64]) -> Result<()> {
        self.rows.push((step, values.to_vec()));
        Ok(())
    }

    async fn end_step(&mut self, report: &StepReport) -> Result<()> {
        self.finished.push(report.clone());
        Ok(())
    }

    async fn finish(&mut self, report: &SequenceReport) -> Result<()> {
        self.report = Some(report.clone());
        Ok(())
    }
}

// ============================================================================
// CSV Sink
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use anyhow::{anyhow, Context};
    use std::collections::HashMap;
    use std::fs::File;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    /// Writes one CSV file per step into an output directory.
    ///
    /// Each file starts with `#` comment lines listing the procedure and its
    /// visible parameters, then a header of the data columns, then the rows.
    pub struct CsvSink {
        output_dir: PathBuf,
        open: HashMap<StepId, csv::Writer<File>>,
        written: Vec<PathBuf>,
    }

    impl CsvSink {
        pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
            let output_dir = output_dir.into();
            if !output_dir.exists() {
                std::fs::create_dir_all(&output_dir).with_context(|| {
                    format!("Failed to create storage directory at {:?}", output_dir)
                })?;
            }
            Ok(Self {
                output_dir,
                open: HashMap::new(),
                written: Vec::new(),
            })
        }

        pub fn output_dir(&self) -> &Path {
            &self.output_dir
        }

        /// Files created so far, in creation order.
        pub fn written(&self) -> &[PathBuf] {
            &self.written
        }

        fn file_name(step: StepId, procedure: &str) -> String {
            let procedure: String = procedure
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            format!(
                "{}_{}-{}_{}.csv",
                procedure,
                step.template,
                step.instance,
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            )
        }
    }

    #[async_trait]
    impl ResultSink for CsvSink {
        async fn begin_step(
            &mut self,
            step: StepId,
            procedure: &str,
            parameters: &ParameterSet,
            columns: &[String],
        ) -> Result<()> {
            let path = self.output_dir.join(Self::file_name(step, procedure));
            let mut file = File::create(&path)
                .with_context(|| format!("Failed to create CSV file at {:?}", path))?;

            let mut header = format!("# Procedure: {}\n# Step: {}\n# Parameters:\n", procedure, step);
            for param in parameters.visible() {
                match param.unit() {
                    Some(unit) => header.push_str(&format!("#\t{}: {} {}\n", param.name(), param.value(), unit)),
                    None => header.push_str(&format!("#\t{}: {}\n", param.name(), param.value())),
                }
            }
            file.write_all(header.as_bytes())
                .context("Failed to write parameters to CSV file")?;

            let mut writer = csv::Writer::from_writer(file);
            if !columns.is_empty() {
                writer
                    .write_record(columns)
                    .context("Failed to write CSV header")?;
            }

            tracing::debug!(step = %step, path = %path.display(), "CSV file opened");
            self.open.insert(step, writer);
            self.written.push(path);
            Ok(())
        }

        async fn write_row(&mut self, step: StepId, values: &[f64]) -> Result<()> {
            let writer = self
                .open
                .get_mut(&step)
                .ok_or_else(|| anyhow!("row for step {} which has no open file", step))?;
            writer
                .write_record(values.iter().map(|v| v.to_string()))
                .context("Failed to write row to CSV file")?;
            Ok(())
        }

        async fn end_step(&mut self, report: &StepReport) -> Result<()> {
            if let Some(mut writer) = self.open.remove(&report.id) {
                writer.flush().context("Failed to flush CSV writer")?;
            }
            Ok(())
        }

        async fn finish(&mut self, _report: &SequenceReport) -> Result<()> {
            for (_, mut writer) in self.open.drain() {
                writer.flush().context("Failed to flush CSV writer")?;
            }
            tracing::info!(files = self.written.len(), "CSV sink finished");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::DaqError;
    use std::path::PathBuf;

    pub struct CsvSink;

    impl CsvSink {
        pub fn new(_output_dir: impl Into<PathBuf>) -> Result<Self> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        pub fn written(&self) -> &[PathBuf] {
            &[]
        }
    }

    #[async_trait]
    impl ResultSink for CsvSink {
        async fn begin_step(
            &mut self,
            _step: StepId,
            _procedure: &str,
            _parameters: &ParameterSet,
            _columns: &[String],
        ) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn write_row(&mut self, _step: StepId, _values: &[f64]) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn end_step(&mut self, _report: &StepReport) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn finish(&mut self, _report: &SequenceReport) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvSink;
#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvSink;
