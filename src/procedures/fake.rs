//! `Fake`: emits synthetic data, no instruments involved.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use super::{number, with_base};
use crate::parameter::{ParameterBuilder, ParameterSet, VisibilityRule};
use crate::procedure::{Procedure, ProcedureDefinition, StepContext};

pub struct FakeProcedure {
    fake_parameter: f64,
    total_time: Duration,
    sampling_t: Duration,
}

impl FakeProcedure {
    pub fn from_parameters(params: &ParameterSet) -> anyhow::Result<Self> {
        let sampling_t = number(params, "sampling_t")?;
        anyhow::ensure!(sampling_t > 0.0, "sampling_t must be positive");
        Ok(Self {
            fake_parameter: number(params, "fake_parameter")?,
            total_time: Duration::try_from_secs_f64(number(params, "total_time")?)?,
            sampling_t: Duration::try_from_secs_f64(sampling_t)?,
        })
    }
}

#[async_trait]
impl Procedure for FakeProcedure {
    async fn execute(&mut self, ctx: &mut StepContext) -> anyhow::Result<()> {
        let start = Instant::now();
        loop {
            let t = start.elapsed();
            if t >= self.total_time {
                break;
            }
            let noise: f64 = rand::thread_rng().gen();
            ctx.emit(vec![t.as_secs_f64(), self.fake_parameter + noise])
                .await?;
            ctx.sleep(self.sampling_t).await?;
        }
        Ok(())
    }
}

pub(crate) fn definition() -> ProcedureDefinition {
    ProcedureDefinition::new("Fake", |params: &ParameterSet| -> anyhow::Result<Box<dyn Procedure>> {
        Ok(Box::new(FakeProcedure::from_parameters(params)?))
    })
    .description("Synthetic data for testing the pipeline")
    .parameters(with_base(
        ParameterSet::new()
            .with(
                ParameterBuilder::new("fake_parameter", 1.0)
                    .unit("V")
                    .description("Fake parameter")
                    .visible_when(VisibilityRule::when_true("show_more"))
                    .build(),
            )
            .with(
                ParameterBuilder::new("total_time", 10.0)
                    .unit("s")
                    .min(0.0)
                    .description("Total time")
                    .build(),
            )
            .with(
                ParameterBuilder::new("sampling_t", 0.2)
                    .unit("s")
                    .min(0.0)
                    .description("Sampling time")
                    .build(),
            ),
    ))
    .columns(["t (s)", "fake_data"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::is_visible;
    use crate::procedure::StepId;
    use crate::sequence::{abort_pair, SequenceEvent};
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_fake_emits_until_total_time() {
        let definition = definition();
        let mut params = definition.parameter_set().clone();
        params.set_value("total_time", 1.0).unwrap();
        params.set_value("fake_parameter", 5.0).unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let (_handle, signal) = abort_pair();
        let mut ctx = StepContext::new(
            StepId::new(0, 0),
            params.clone(),
            definition.data_columns().to_vec(),
            tx,
            signal,
        );
        let mut procedure = FakeProcedure::from_parameters(&params).unwrap();
        procedure.execute(&mut ctx).await.unwrap();
        drop(ctx);

        let mut rows = Vec::new();
        while let Some(event) = rx.recv().await {
            if let SequenceEvent::Row { values, .. } = event {
                rows.push(values);
            }
        }
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0][0], 0.0);
        assert!(rows.iter().all(|r| (5.0..6.0).contains(&r[1])));
    }

    #[test]
    fn test_fake_parameter_hidden_unless_show_more() {
        let mut params = definition().parameter_set().clone();
        let fake = params.get("fake_parameter").unwrap().clone();
        assert!(!is_visible(&fake, &params));

        params.set_value("show_more", true).unwrap();
        assert!(is_visible(&fake, &params));
    }
}
