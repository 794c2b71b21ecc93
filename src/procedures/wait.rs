//! `Wait`: pause between measurements.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{number, with_base};
use crate::parameter::{ParameterBuilder, ParameterSet};
use crate::procedure::{Procedure, ProcedureDefinition, StepContext};

/// Longest uninterrupted sleep between two checkpoints.
const SLICE: Duration = Duration::from_secs(1);

pub struct Wait {
    wait_time: Duration,
}

impl Wait {
    pub fn from_parameters(params: &ParameterSet) -> anyhow::Result<Self> {
        let seconds = number(params, "wait_time")?;
        Ok(Self {
            wait_time: Duration::try_from_secs_f64(seconds)?,
        })
    }
}

#[async_trait]
impl Procedure for Wait {
    async fn execute(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        debug!(wait_time = ?self.wait_time, "Waiting");
        let mut remaining = self.wait_time;
        while !remaining.is_zero() {
            let slice = remaining.min(SLICE);
            ctx.sleep(slice).await?;
            remaining -= slice;
        }
        Ok(())
    }
}

pub(crate) fn definition() -> ProcedureDefinition {
    ProcedureDefinition::new("Wait", |params: &ParameterSet| -> anyhow::Result<Box<dyn Procedure>> {
        Ok(Box::new(Wait::from_parameters(params)?))
    })
    .description("Wait for a fixed time")
    .parameters(with_base(ParameterSet::new().with(
        ParameterBuilder::new("wait_time", 1.0)
            .unit("s")
            .min(0.0)
            .description("Wait time")
            .build(),
    )))
}
