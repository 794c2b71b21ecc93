//! Sequence specification: an ordered list of step templates sharing common
//! parameters.

use serde::{Deserialize, Serialize};

use crate::parameter::{Overrides, ParameterSet, ParameterValue};

/// Vary one parameter over an explicit, ordered list of values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepDirective {
    pub parameter: String,
    pub values: Vec<ParameterValue>,
}

impl SweepDirective {
    pub fn new<I, V>(parameter: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParameterValue>,
    {
        Self {
            parameter: parameter.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// One step of a sequence before expansion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Registered procedure type.
    pub procedure: String,
    #[serde(default)]
    pub overrides: Overrides,
    #[serde(default)]
    pub sweep: Option<SweepDirective>,
    #[serde(default)]
    pub skip_startup: bool,
    #[serde(default)]
    pub skip_shutdown: bool,
}

impl StepTemplate {
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            ..Self::default()
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.overrides = self.overrides.value(name, value);
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn sweep<I, V>(mut self, parameter: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParameterValue>,
    {
        self.sweep = Some(SweepDirective::new(parameter, values));
        self
    }

    pub fn skip_startup(mut self, skip: bool) -> Self {
        self.skip_startup = skip;
        self
    }

    pub fn skip_shutdown(mut self, skip: bool) -> Self {
        self.skip_shutdown = skip;
        self
    }
}

/// Immutable input of a sequence run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    pub name: String,
    /// Values shared by every step.
    #[serde(default)]
    pub common: ParameterSet,
    #[serde(default)]
    pub steps: Vec<StepTemplate>,
}

impl SequenceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn common(mut self, common: ParameterSet) -> Self {
        self.common = common;
        self
    }

    pub fn step(mut self, template: StepTemplate) -> Self {
        self.steps.push(template);
        self
    }
}
