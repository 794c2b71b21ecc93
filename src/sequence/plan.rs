//! Run plan expansion.
//!
//! For each template, in order:
//! 1. the procedure's parameter template is layered with the sequence's common
//!    parameters, then the template overrides are applied
//!    ([`ParameterSet::resolve_effective`]);
//! 2. a sweep directive yields one instance per value, in value order, with
//!    only the swept parameter changed; otherwise exactly one instance;
//! 3. instance lists are concatenated in template order.
//!
//! A template that fails to resolve contributes no instances and is recorded
//! in [`RunPlan::rejected`]. Other templates are unaffected.

use serde::Serialize;
use tracing::{debug, warn};

use super::{SequenceSpec, StepTemplate};
use crate::error::{AppResult, DaqError, StepError, StepPhase};
use crate::parameter::{ParameterSet, ParameterValue};
use crate::procedure::{ProcedureInstance, ProcedureRegistry, StepId};

/// A template that produced no instances.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RejectedTemplate {
    pub template_index: usize,
    pub procedure: String,
    pub error: StepError,
}

/// Flattened, ordered list of concrete procedure instances.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunPlan {
    pub sequence: String,
    pub steps: Vec<ProcedureInstance>,
    pub rejected: Vec<RejectedTemplate>,
}

/// A plan entry in template order.
#[derive(Clone, Copy, Debug)]
pub enum PlanEntry<'a> {
    Step(&'a ProcedureInstance),
    Rejected(&'a RejectedTemplate),
}

impl RunPlan {
    /// Expand `spec` against the procedures in `registry`.
    pub fn expand(spec: &SequenceSpec, registry: &ProcedureRegistry) -> RunPlan {
        let mut plan = RunPlan {
            sequence: spec.name.clone(),
            ..RunPlan::default()
        };

        for (index, template) in spec.steps.iter().enumerate() {
            match expand_template(index, template, spec, registry) {
                Ok(instances) => {
                    debug!(template = index, procedure = %template.procedure, instances = instances.len(), "Expanded template");
                    plan.steps.extend(instances);
                }
                Err(e) => {
                    warn!(template = index, procedure = %template.procedure, error = %e, "Template rejected");
                    plan.rejected.push(RejectedTemplate {
                        template_index: index,
                        procedure: template.procedure.clone(),
                        error: StepError::new(StepPhase::Resolve, &e),
                    });
                }
            }
        }
        plan
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps and rejections interleaved by template position.
    pub fn entries(&self) -> Vec<PlanEntry<'_>> {
        let mut entries: Vec<(usize, PlanEntry<'_>)> = self
            .steps
            .iter()
            .map(|s| (s.id.template, PlanEntry::Step(s)))
            .chain(
                self.rejected
                    .iter()
                    .map(|r| (r.template_index, PlanEntry::Rejected(r))),
            )
            .collect();
        // Stable: instances of one template keep their sweep order.
        entries.sort_by_key(|(template, _)| *template);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }
}

fn expand_template(
    index: usize,
    template: &StepTemplate,
    spec: &SequenceSpec,
    registry: &ProcedureRegistry,
) -> AppResult<Vec<ProcedureInstance>> {
    let definition = registry.get(&template.procedure)?;
    let base = definition.parameter_set().layer(&spec.common)?;
    let effective = base.resolve_effective(&template.overrides)?;

    let instance = |instance: usize,
                    parameters: ParameterSet,
                    sweep_value: Option<ParameterValue>| ProcedureInstance {
        id: StepId::new(index, instance),
        procedure: template.procedure.clone(),
        parameters,
        data_columns: definition.data_columns().to_vec(),
        instruments: definition.instruments().to_vec(),
        skip_startup: template.skip_startup,
        skip_shutdown: template.skip_shutdown,
        sweep_value,
    };

    let Some(sweep) = &template.sweep else {
        return Ok(vec![instance(0, effective, None)]);
    };

    if template.overrides.contains(&sweep.parameter) {
        return Err(DaqError::SweepOverrideConflict(sweep.parameter.clone()));
    }
    if !effective.contains(&sweep.parameter) {
        return Err(DaqError::UnknownParameter(sweep.parameter.clone()));
    }

    sweep
        .values
        .iter()
        .enumerate()
        .map(|(k, value)| -> AppResult<ProcedureInstance> {
            let mut parameters = effective.clone();
            parameters.set_value(&sweep.parameter, value.clone())?;
            let stored = parameters.value(&sweep.parameter).cloned();
            Ok(instance(k, parameters, stored))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterBuilder;
    use crate::procedure::{Procedure, ProcedureDefinition, StepContext};
    use crate::sequence::StepTemplate;
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl Procedure for Idle {
        async fn execute(&mut self, _ctx: &mut StepContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> ProcedureRegistry {
        let factory = |_: &ParameterSet| -> anyhow::Result<Box<dyn Procedure>> { Ok(Box::new(Idle)) };
        ProcedureRegistry::new()
            .with(
                ProcedureDefinition::new("A", factory).parameters(
                    ParameterSet::new()
                        .with(ParameterBuilder::new("vds", 0.0).range(-1.0, 1.0).build())
                        .with(ParameterBuilder::new("vg", 0.0).range(-35.0, 35.0).build()),
                ),
            )
            .with(
                ProcedureDefinition::new("B", factory).parameters(
                    ParameterSet::new()
                        .with(ParameterBuilder::new("vds", 0.0).range(-1.0, 1.0).build())
                        .with(ParameterBuilder::new("target_T", 25.0).range(0.0, 100.0).build()),
                ),
            )
    }

    fn value(step: &ProcedureInstance, name: &str) -> f64 {
        step.parameters.value(name).and_then(ParameterValue::as_f64).unwrap()
    }

    #[test]
    fn test_scenario_override_then_sweep() {
        let spec = SequenceSpec::new("scenario")
            .common(ParameterSet::from_values([("vds", 0.075)]))
            .step(StepTemplate::new("A").with_override("vg", 1.0))
            .step(StepTemplate::new("B").sweep("target_T", [10.0, 20.0, 30.0]));

        let plan = RunPlan::expand(&spec, &registry());
        assert_eq!(plan.len(), 4);
        assert!(plan.rejected.is_empty());

        let a = &plan.steps[0];
        assert_eq!(a.procedure, "A");
        assert_eq!((value(a, "vds"), value(a, "vg")), (0.075, 1.0));
        for (step, target) in plan.steps[1..].iter().zip([10.0, 20.0, 30.0]) {
            assert_eq!(step.procedure, "B");
            assert_eq!(value(step, "vds"), 0.075);
            assert_eq!(value(step, "target_T"), target);
        }
        let ids: Vec<String> = plan.steps.iter().map(|s| s.id.to_string()).collect();
        assert_eq!(ids, ["0.0", "1.0", "1.1", "1.2"]);
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let spec = SequenceSpec::new("twice")
            .step(StepTemplate::new("B").sweep("target_T", [30, 10, 20]))
            .step(StepTemplate::new("A").with_override("vg", -2.0));
        let registry = registry();
        assert_eq!(RunPlan::expand(&spec, &registry), RunPlan::expand(&spec, &registry));
    }

    #[test]
    fn test_sweep_instances_differ_only_in_swept_parameter() {
        let spec = SequenceSpec::new("sweep").step(StepTemplate::new("B").sweep("target_T", [5, 6, 7, 8, 9]));
        let plan = RunPlan::expand(&spec, &registry());
        assert_eq!(plan.len(), 5);
        for step in &plan.steps {
            assert_eq!(value(step, "vds"), 0.0);
            assert!(step.sweep_value.is_some());
        }
        assert_eq!(plan.steps[4].sweep_value, Some(ParameterValue::Float(9.0)));
    }

    #[test]
    fn test_unknown_override_rejects_only_that_template() {
        let spec = SequenceSpec::new("typo")
            .step(StepTemplate::new("A").with_override("vgs", 1.0))
            .step(StepTemplate::new("B"));
        let plan = RunPlan::expand(&spec, &registry());

        assert_eq!(plan.len(), 1);
        assert!(plan.steps.iter().all(|s| s.id.template != 0));
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].template_index, 0);
        assert_eq!(plan.rejected[0].error.kind, crate::error::ErrorKind::UnknownParameter);
    }

    #[test]
    fn test_repeated_override_in_document_rejects_template() {
        let template: StepTemplate =
            serde_json::from_str(r#"{"procedure": "A", "overrides": {"vg": 1.0, "vg": 2.0}}"#).unwrap();
        assert_eq!(template.overrides.len(), 2);

        let spec = SequenceSpec::new("dup").step(template).step(StepTemplate::new("B"));
        let plan = RunPlan::expand(&spec, &registry());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.rejected[0].template_index, 0);
        assert_eq!(plan.rejected[0].error.kind, crate::error::ErrorKind::DuplicateOverride);
    }

    #[test]
    fn test_sweep_override_conflict() {
        let spec = SequenceSpec::new("conflict").step(
            StepTemplate::new("B")
                .with_override("target_T", 10.0)
                .sweep("target_T", [20.0, 30.0]),
        );
        let plan = RunPlan::expand(&spec, &registry());
        assert!(plan.is_empty());
        assert_eq!(
            plan.rejected[0].error.kind,
            crate::error::ErrorKind::SweepOverrideConflict
        );
    }

    #[test]
    fn test_out_of_range_sweep_value_rejects_template() {
        let spec = SequenceSpec::new("range").step(StepTemplate::new("B").sweep("target_T", [10.0, 500.0]));
        let plan = RunPlan::expand(&spec, &registry());
        assert!(plan.is_empty());
        assert_eq!(
            plan.rejected[0].error.kind,
            crate::error::ErrorKind::InvalidParameterValue
        );
    }

    #[test]
    fn test_empty_sweep_yields_no_instances() {
        let spec = SequenceSpec::new("empty").step(StepTemplate::new("B").sweep("target_T", Vec::<f64>::new()));
        let plan = RunPlan::expand(&spec, &registry());
        assert!(plan.is_empty());
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn test_unknown_procedure_and_entry_order() {
        let spec = SequenceSpec::new("order")
            .step(StepTemplate::new("A"))
            .step(StepTemplate::new("Missing"))
            .step(StepTemplate::new("B"));
        let plan = RunPlan::expand(&spec, &registry());
        let kinds: Vec<&str> = plan
            .entries()
            .iter()
            .map(|e| match e {
                PlanEntry::Step(s) => s.procedure.as_str(),
                PlanEntry::Rejected(_) => "rejected",
            })
            .collect();
        assert_eq!(kinds, ["A", "rejected", "B"]);
    }

    #[test]
    fn test_common_parameters_appended() {
        let spec = SequenceSpec::new("common")
            .common(ParameterSet::from_values([("chip_number", 8)]))
            .step(StepTemplate::new("A"));
        let plan = RunPlan::expand(&spec, &registry());
        assert_eq!(plan.steps[0].parameters.names().last(), Some("chip_number"));
    }
}
