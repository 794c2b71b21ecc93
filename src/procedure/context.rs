//! Per-step execution context handed to procedure code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::StepId;
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentHandle;
use crate::parameter::{ParameterSet, ParameterValue};
use crate::sequence::{AbortSignal, SequenceEvent};

/// What a running step can see and do: its effective parameters, its leased
/// instruments, the outbound row stream and the abort flag.
pub struct StepContext {
    step: StepId,
    parameters: ParameterSet,
    columns: Vec<String>,
    instruments: HashMap<String, InstrumentHandle>,
    events: mpsc::Sender<SequenceEvent>,
    abort: AbortSignal,
    rows: Arc<AtomicUsize>,
}

impl StepContext {
    pub fn new(
        step: StepId,
        parameters: ParameterSet,
        columns: Vec<String>,
        events: mpsc::Sender<SequenceEvent>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            step,
            parameters,
            columns,
            instruments: HashMap::new(),
            events,
            abort,
            rows: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share the emitted-row counter with a supervisor.
    pub fn with_row_counter(mut self, rows: Arc<AtomicUsize>) -> Self {
        self.rows = rows;
        self
    }

    pub fn step(&self) -> StepId {
        self.step
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub(crate) fn attach(&mut self, role: impl Into<String>, handle: InstrumentHandle) {
        self.instruments.insert(role.into(), handle);
    }

    /// Leased instrument for `role`.
    pub fn instrument(&self, role: &str) -> anyhow::Result<&InstrumentHandle> {
        self.instruments
            .get(role)
            .ok_or_else(|| anyhow!("no instrument leased for role '{}'", role))
    }

    pub fn value(&self, name: &str) -> anyhow::Result<&ParameterValue> {
        self.parameters
            .value(name)
            .ok_or_else(|| anyhow!("missing parameter '{}'", name))
    }

    /// Numeric parameter value (integers widened).
    pub fn param_f64(&self, name: &str) -> anyhow::Result<f64> {
        self.value(name)?
            .as_f64()
            .ok_or_else(|| anyhow!("parameter '{}' is not numeric", name))
    }

    pub fn param_bool(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.value(name)?.is_truthy())
    }

    /// Whether the abort flag is up.
    pub fn should_stop(&self) -> bool {
        self.abort.is_raised()
    }

    /// Yield, then fail with [`DaqError::Aborted`] if the abort flag is up.
    pub async fn checkpoint(&self) -> AppResult<()> {
        tokio::task::yield_now().await;
        if self.should_stop() {
            debug!(step = %self.step, "Abort observed at checkpoint");
            return Err(DaqError::Aborted);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early with [`DaqError::Aborted`] on abort.
    pub async fn sleep(&self, duration: Duration) -> AppResult<()> {
        let mut abort = self.abort.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.checkpoint().await,
            _ = abort.raised() => {
                debug!(step = %self.step, "Abort observed during wait");
                Err(DaqError::Aborted)
            }
        }
    }

    /// Emit one result row and checkpoint.
    ///
    /// The row must have one value per data column. Rows already emitted are
    /// never retracted.
    pub async fn emit(&self, values: Vec<f64>) -> AppResult<()> {
        if values.len() != self.columns.len() {
            return Err(DaqError::RowArity {
                step: self.step.to_string(),
                expected: self.columns.len(),
                got: values.len(),
            });
        }
        self.rows.fetch_add(1, Ordering::SeqCst);
        let event = SequenceEvent::Row {
            step: self.step,
            values,
        };
        if self.events.send(event).await.is_err() {
            trace!(step = %self.step, "Event receiver dropped, row not delivered");
        }
        self.checkpoint().await
    }

    pub fn rows_emitted(&self) -> usize {
        self.rows.load(Ordering::SeqCst)
    }
}
