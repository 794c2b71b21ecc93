//! Procedure registry: procedure type name → definition and factory.
//!
//! Procedures are plain implementations registered at startup, looked up by
//! the string a sequence step refers to.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::Procedure;
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentRequirement;
use crate::parameter::ParameterSet;

/// Builds a procedure object from its effective parameters.
pub type ProcedureFactory =
    Arc<dyn Fn(&ParameterSet) -> anyhow::Result<Box<dyn Procedure>> + Send + Sync>;

/// Everything the engine needs to know about a procedure type.
#[derive(Clone)]
pub struct ProcedureDefinition {
    name: String,
    description: String,
    parameters: ParameterSet,
    data_columns: Vec<String>,
    instruments: Vec<InstrumentRequirement>,
    factory: ProcedureFactory,
}

impl ProcedureDefinition {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ParameterSet) -> anyhow::Result<Box<dyn Procedure>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: ParameterSet::new(),
            data_columns: Vec::new(),
            instruments: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Parameter template with defaults.
    pub fn parameters(mut self, parameters: ParameterSet) -> Self {
        self.parameters = parameters;
        self
    }

    /// Ordered output columns; every emitted row must match their count.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn instrument(mut self, requirement: InstrumentRequirement) -> Self {
        self.instruments.push(requirement);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn summary(&self) -> &str {
        &self.description
    }

    pub fn parameter_set(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn data_columns(&self) -> &[String] {
        &self.data_columns
    }

    pub fn instruments(&self) -> &[InstrumentRequirement] {
        &self.instruments
    }

    /// Construct a procedure object for one run.
    pub fn build(&self, parameters: &ParameterSet) -> anyhow::Result<Box<dyn Procedure>> {
        (self.factory)(parameters)
    }
}

impl fmt::Debug for ProcedureDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureDefinition")
            .field("name", &self.name)
            .field("parameters", &self.parameters.names().collect::<Vec<_>>())
            .field("data_columns", &self.data_columns)
            .field("instruments", &self.instruments)
            .finish()
    }
}

/// Registry of available procedure types, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct ProcedureRegistry {
    definitions: BTreeMap<String, ProcedureDefinition>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any previous one with the same name.
    pub fn register(&mut self, definition: ProcedureDefinition) {
        debug!(procedure = definition.name(), "Registering procedure");
        self.definitions
            .insert(definition.name().to_string(), definition);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, definition: ProcedureDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, name: &str) -> AppResult<&ProcedureDefinition> {
        self.definitions
            .get(name)
            .ok_or_else(|| DaqError::UnknownProcedure(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcedureDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::Parameter;
    use crate::procedure::StepContext;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Procedure for Noop {
        async fn execute(&mut self, _ctx: &mut StepContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn noop() -> ProcedureDefinition {
        ProcedureDefinition::new("Noop", |_| Ok(Box::new(Noop) as Box<dyn Procedure>))
            .parameters(ParameterSet::new().with(Parameter::new("x", 1.0)))
            .columns(["a", "b"])
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ProcedureRegistry::new().with(noop());
        let def = registry.get("Noop").unwrap();
        assert_eq!(def.data_columns(), ["a", "b"]);
        assert!(def.build(def.parameter_set()).is_ok());
    }

    #[test]
    fn test_unknown_procedure() {
        let registry = ProcedureRegistry::new();
        let err = registry.get("Missing").unwrap_err();
        assert!(matches!(err, DaqError::UnknownProcedure(name) if name == "Missing"));
    }
}
