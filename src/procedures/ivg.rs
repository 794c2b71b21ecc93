//! `IVg`: drain current against a gate voltage sweep.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{number, with_base};
use crate::config::InstrumentsConfig;
use crate::instrument::{AccessMode, InstrumentRequirement};
use crate::parameter::{ParameterBuilder, ParameterSet};
use crate::procedure::{Procedure, ProcedureDefinition, StepContext};

/// `start, start + step, ...` up to but excluding `stop`.
fn arange(start: f64, stop: f64, step: f64) -> impl Iterator<Item = f64> {
    let n = ((stop - start) / step).ceil();
    let n = if n.is_finite() && n > 0.0 { n as usize } else { 0 };
    (0..n).map(move |i| start + i as f64 * step)
}

/// Gate voltages for one sweep.
///
/// Ramps from 0 V to `start`, sweeps `start → end → start`, then ramps back
/// to 0 V, all in increments of `step` (magnitude; the sign is inferred).
pub fn gate_ramp(start: f64, end: f64, step: f64) -> Vec<f64> {
    let step = step.abs();
    let sweep = if end >= start { step } else { -step };
    let lead = if start > 0.0 { step } else { -step };

    let lead_in: Vec<f64> = arange(0.0, start, lead).collect();
    let mut ramp = lead_in.clone();
    ramp.extend(arange(start, end, sweep));
    ramp.extend(arange(end, start - sweep, -sweep));
    ramp.extend(lead_in.into_iter().rev());
    ramp
}

pub struct IVg {
    vds: f64,
    ramp: Vec<f64>,
    step_time: Duration,
}

impl IVg {
    pub fn from_parameters(params: &ParameterSet) -> anyhow::Result<Self> {
        let step = number(params, "vg_step")?;
        anyhow::ensure!(step > 0.0, "vg_step must be positive");
        Ok(Self {
            vds: number(params, "vds")?,
            ramp: gate_ramp(number(params, "vg_start")?, number(params, "vg_end")?, step),
            step_time: Duration::try_from_secs_f64(number(params, "step_time")?)?,
        })
    }
}

#[async_trait]
impl Procedure for IVg {
    async fn startup(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        let meter = ctx.instrument("meter")?;
        meter.write("source_voltage", 0.0).await?;
        meter.write("output", 1.0).await?;

        let gate = ctx.instrument("gate")?;
        gate.write("voltage", 0.0).await?;
        gate.write("output", 1.0).await?;
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        ctx.instrument("meter")?
            .write("source_voltage", self.vds)
            .await?;
        info!(vds = self.vds, points = self.ramp.len(), "Starting gate sweep");

        for &vg in &self.ramp {
            ctx.instrument("gate")?.write("voltage", vg).await?;
            ctx.sleep(self.step_time).await?;
            let current = ctx.instrument("meter")?.read("current").await?;
            ctx.emit(vec![vg, current]).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        let meter = ctx.instrument("meter")?;
        meter.write("source_voltage", 0.0).await?;
        meter.write("output", 0.0).await?;

        let gate = ctx.instrument("gate")?;
        gate.write("voltage", 0.0).await?;
        gate.write("output", 0.0).await?;
        Ok(())
    }
}

pub(crate) fn definition(instruments: &InstrumentsConfig) -> ProcedureDefinition {
    ProcedureDefinition::new("IVg", |params: &ParameterSet| -> anyhow::Result<Box<dyn Procedure>> {
        Ok(Box::new(IVg::from_parameters(params)?))
    })
    .description("Current vs gate voltage sweep")
    .parameters(with_base(
        ParameterSet::new()
            .with(
                ParameterBuilder::new("vds", 0.075)
                    .unit("V")
                    .range(-1.0, 1.0)
                    .description("Drain-source voltage")
                    .build(),
            )
            .with(
                ParameterBuilder::new("vg_start", -35.0)
                    .unit("V")
                    .range(-100.0, 100.0)
                    .description("Gate voltage start")
                    .build(),
            )
            .with(
                ParameterBuilder::new("vg_end", 35.0)
                    .unit("V")
                    .range(-100.0, 100.0)
                    .description("Gate voltage end")
                    .build(),
            )
            .with(
                ParameterBuilder::new("vg_step", 0.2)
                    .unit("V")
                    .min(0.0)
                    .description("Gate voltage step")
                    .build(),
            )
            .with(
                ParameterBuilder::new("step_time", 0.01)
                    .unit("s")
                    .min(0.0)
                    .description("Time per point")
                    .build(),
            ),
    ))
    .columns(["Vg (V)", "I (A)"])
    .instrument(InstrumentRequirement::new(
        "meter",
        instruments.resolve("meter"),
        AccessMode::Exclusive,
    ))
    .instrument(InstrumentRequirement::new(
        "gate",
        instruments.resolve("gate"),
        AccessMode::Shared,
    ))
}
