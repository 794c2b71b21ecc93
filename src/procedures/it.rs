//! `It`: drain current over time while the laser is toggled.
//!
//! The laser is off for the first half period, on for the second and off
//! again for the third. Gate and drain biases stay constant throughout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{number, with_base};
use crate::config::InstrumentsConfig;
use crate::instrument::{AccessMode, InstrumentRequirement};
use crate::parameter::{ParameterBuilder, ParameterSet};
use crate::procedure::{Procedure, ProcedureDefinition, StepContext};

pub struct It {
    vds: f64,
    vg: f64,
    laser_v: f64,
    laser_t: f64,
    sampling_t: Duration,
}

impl It {
    pub fn from_parameters(params: &ParameterSet) -> anyhow::Result<Self> {
        let sampling_t = number(params, "sampling_t")?;
        anyhow::ensure!(sampling_t > 0.0, "sampling_t must be positive");
        Ok(Self {
            vds: number(params, "vds")?,
            vg: number(params, "vg")?,
            laser_v: number(params, "laser_v")?,
            laser_t: number(params, "laser_T")?,
            sampling_t: Duration::try_from_secs_f64(sampling_t)?,
        })
    }

    /// Laser level and phase end (seconds from start) for each phase.
    fn phases(&self) -> [(f64, f64); 3] {
        [
            (0.0, self.laser_t * 0.5),
            (self.laser_v, self.laser_t),
            (0.0, self.laser_t * 1.5),
        ]
    }
}

#[async_trait]
impl Procedure for It {
    async fn startup(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        let meter = ctx.instrument("meter")?;
        meter.write("source_voltage", 0.0).await?;
        meter.write("output", 1.0).await?;

        for role in ["gate", "laser"] {
            let instrument = ctx.instrument(role)?;
            instrument.write("voltage", 0.0).await?;
            instrument.write("output", 1.0).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        ctx.instrument("meter")?
            .write("source_voltage", self.vds)
            .await?;
        ctx.instrument("gate")?.write("voltage", self.vg).await?;

        info!(vds = self.vds, vg = self.vg, laser_v = self.laser_v, "Starting measurement");
        let start = Instant::now();
        for (level, until) in self.phases() {
            ctx.instrument("laser")?.write("voltage", level).await?;
            debug!(level, until, "Laser phase");

            while start.elapsed().as_secs_f64() < until {
                let t = start.elapsed().as_secs_f64();
                let current = ctx.instrument("meter")?.read("current").await?;
                ctx.emit(vec![t, current, level]).await?;
                ctx.sleep(self.sampling_t).await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        let meter = ctx.instrument("meter")?;
        meter.write("source_voltage", 0.0).await?;
        meter.write("output", 0.0).await?;

        for role in ["laser", "gate"] {
            let instrument = ctx.instrument(role)?;
            instrument.write("voltage", 0.0).await?;
            instrument.write("output", 0.0).await?;
        }
        debug!("Outputs powered down");
        Ok(())
    }
}

pub(crate) fn definition(instruments: &InstrumentsConfig) -> ProcedureDefinition {
    ProcedureDefinition::new("It", |params: &ParameterSet| -> anyhow::Result<Box<dyn Procedure>> {
        Ok(Box::new(It::from_parameters(params)?))
    })
    .description("Current vs time with laser toggling")
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
                ParameterBuilder::new("vg", 0.0)
                    .unit("V")
                    .range(-35.0, 35.0)
                    .description("Gate voltage")
                    .build(),
            )
            .with(
                ParameterBuilder::new("laser_v", 0.0)
                    .unit("V")
                    .range(0.0, 5.0)
                    .description("Laser voltage")
                    .build(),
            )
            .with(
                ParameterBuilder::new("laser_T", 120.0)
                    .unit("s")
                    .min(0.0)
                    .description("Laser ON+OFF period")
                    .build(),
            )
            .with(
                ParameterBuilder::new("sampling_t", 0.5)
                    .unit("s")
                    .min(0.0)
                    .description("Sampling time")
                    .build(),
            )
            .with(
                ParameterBuilder::new("target_T", 25.0)
                    .unit("C")
                    .range(-50.0, 200.0)
                    .description("Target temperature")
                    .build(),
            ),
    ))
    .columns(["t (s)", "I (A)", "VL (V)"])
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
    .instrument(InstrumentRequirement::new(
        "laser",
        instruments.resolve("laser"),
        AccessMode::Shared,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_follow_laser_period() {
        let mut params = definition(&InstrumentsConfig::default()).parameter_set().clone();
        params.set_value("laser_T", 20.0).unwrap();
        params.set_value("laser_v", 3.0).unwrap();
        let it = It::from_parameters(&params).unwrap();
        assert_eq!(it.phases(), [(0.0, 10.0), (3.0, 20.0), (0.0, 30.0)]);
    }

    #[test]
    fn test_out_of_range_vds_rejected() {
        let mut params = definition(&InstrumentsConfig::default()).parameter_set().clone();
        assert!(params.set_value("vds", 2.0).is_err());
    }
}
