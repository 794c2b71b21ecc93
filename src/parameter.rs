//! Parameter model - typed, named procedure inputs with constraints.
//!
//! Every procedure owns a [`ParameterSet`]: an ordered collection of
//! [`Parameter`]s with defaults, units, bounds, enumerated choices and an
//! optional [`VisibilityRule`]. Sequences customise a step by applying
//! [`Overrides`] on top of a base set with [`ParameterSet::resolve_effective`].
//!
//! All operations here are pure: they take immutable inputs and return new
//! sets, so override precedence can be tested without any runtime.
//!
//! # Example
//!
//! ```rust
//! use lab_sequencer::parameter::{Overrides, ParameterBuilder, ParameterSet};
//!
//! let base = ParameterSet::new()
//!     .with(ParameterBuilder::new("vds", 0.075).unit("V").range(-1.0, 1.0).build())
//!     .with(ParameterBuilder::new("vg", 0.0).unit("V").build());
//!
//! let effective = base
//!     .resolve_effective(&Overrides::new().value("vg", 1.0))
//!     .unwrap();
//! assert_eq!(effective.value("vg").and_then(|v| v.as_f64()), Some(1.0));
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

// =============================================================================
// ParameterValue
// =============================================================================

/// Strongly-typed parameter value.
///
/// Deserializes untagged so configuration files can write plain literals
/// (`vg = 1.0`, `sense_T = true`, `chip_group = "Margarita"`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Float(fl) => write!(f, "{}", fl),
            ParameterValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl ParameterValue {
    /// Extract value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Extract value as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract value as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract value as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by visibility predicates.
    pub fn is_truthy(&self) -> bool {
        match self {
            ParameterValue::Bool(b) => *b,
            ParameterValue::Int(i) => *i != 0,
            ParameterValue::Float(f) => *f != 0.0,
            ParameterValue::String(s) => !s.is_empty(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Int(_) => "integer",
            ParameterValue::Float(_) => "float",
            ParameterValue::String(_) => "string",
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Int(value as i64)
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        ParameterValue::Int(value as i64)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

// =============================================================================
// Visibility
// =============================================================================

/// Condition on the controlling parameter's current value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Visible when the controlling value is truthy (`true`, non-zero, non-empty).
    Truthy,
    /// Visible when the controlling value equals the given value.
    Equals(ParameterValue),
    /// Visible when the controlling value is one of the given values.
    OneOf(Vec<ParameterValue>),
}

impl Predicate {
    fn holds(&self, value: &ParameterValue) -> bool {
        match self {
            Predicate::Truthy => value.is_truthy(),
            Predicate::Equals(expected) => values_equal(expected, value),
            Predicate::OneOf(options) => options.iter().any(|o| values_equal(o, value)),
        }
    }
}

/// `group_by`-style rule: the parameter is presented only while the predicate
/// holds for the referenced parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisibilityRule {
    /// Name of the controlling parameter.
    pub parameter: String,
    /// Condition on the controlling parameter's value.
    pub predicate: Predicate,
}

impl VisibilityRule {
    /// Shorthand for a [`Predicate::Truthy`] rule.
    pub fn when_true(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            predicate: Predicate::Truthy,
        }
    }

    /// Shorthand for a [`Predicate::Equals`] rule.
    pub fn when_equals(parameter: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        Self {
            parameter: parameter.into(),
            predicate: Predicate::Equals(value.into()),
        }
    }
}

fn values_equal(a: &ParameterValue, b: &ParameterValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

// =============================================================================
// Parameter
// =============================================================================

/// A named, typed procedure input.
///
/// The kind of the default value fixes the kind of the parameter. Integer
/// literals are accepted for float parameters; everything else must match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    value: ParameterValue,
    default: ParameterValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    choices: Option<Vec<ParameterValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    visibility: Option<VisibilityRule>,
}

impl Parameter {
    /// Create an unconstrained parameter whose value starts at `default`.
    pub fn new(name: impl Into<String>, default: impl Into<ParameterValue>) -> Self {
        let default = default.into();
        Self {
            name: name.into(),
            value: default.clone(),
            default,
            unit: None,
            description: None,
            min: None,
            max: None,
            choices: None,
            visibility: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn default_value(&self) -> &ParameterValue {
        &self.default
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Inclusive numeric bounds, if any.
    pub fn bounds(&self) -> (Option<f64>, Option<f64>) {
        (self.min, self.max)
    }

    pub fn choices(&self) -> Option<&[ParameterValue]> {
        self.choices.as_deref()
    }

    pub fn visibility(&self) -> Option<&VisibilityRule> {
        self.visibility.as_ref()
    }

    /// Check `value` against kind, bounds and choices.
    ///
    /// Returns the value as it would be stored (integers widened for float
    /// parameters).
    pub fn validate(&self, value: &ParameterValue) -> AppResult<ParameterValue> {
        let coerced = match (&self.default, value) {
            (ParameterValue::Float(_), ParameterValue::Int(i)) => ParameterValue::Float(*i as f64),
            (ParameterValue::Int(_), ParameterValue::Float(f)) if f.fract() == 0.0 => {
                ParameterValue::Int(*f as i64)
            }
            (d, v) if std::mem::discriminant(d) == std::mem::discriminant(v) => v.clone(),
            (d, v) => {
                return Err(self.invalid(format!(
                    "expected {}, got {} '{}'",
                    d.kind(),
                    v.kind(),
                    v
                )))
            }
        };

        if let Some(x) = coerced.as_f64() {
            if !x.is_finite() {
                return Err(self.invalid(format!("{} is not a finite number", x)));
            }
            if let Some(min) = self.min {
                if x < min {
                    return Err(self.invalid(format!("{} is below minimum {}", x, min)));
                }
            }
            if let Some(max) = self.max {
                if x > max {
                    return Err(self.invalid(format!("{} is above maximum {}", x, max)));
                }
            }
        }

        if let Some(choices) = &self.choices {
            if !choices.iter().any(|c| values_equal(c, &coerced)) {
                return Err(self.invalid(format!("'{}' is not one of the allowed choices", coerced)));
            }
        }

        Ok(coerced)
    }

    /// Validate and store a new value.
    pub fn set(&mut self, value: impl Into<ParameterValue>) -> AppResult<()> {
        self.value = self.validate(&value.into())?;
        Ok(())
    }

    /// Restore the default value.
    pub fn reset(&mut self) {
        self.value = self.default.clone();
    }

    fn invalid(&self, reason: String) -> DaqError {
        DaqError::InvalidParameterValue {
            name: self.name.clone(),
            reason,
        }
    }
}

/// Builder for creating parameters with fluent API
///
/// # Example
///
/// ```rust
/// use lab_sequencer::parameter::ParameterBuilder;
///
/// let param = ParameterBuilder::new("laser_wl", 530.0)
///     .description("Laser wavelength")
///     .unit("nm")
///     .choices(vec![280.0.into(), 530.0.into(), 660.0.into()])
///     .build();
/// assert_eq!(param.unit(), Some("nm"));
/// ```
pub struct ParameterBuilder {
    inner: Parameter,
}

impl ParameterBuilder {
    /// Create a new parameter builder.
    pub fn new(name: impl Into<String>, default: impl Into<ParameterValue>) -> Self {
        Self {
            inner: Parameter::new(name, default),
        }
    }

    /// Human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.inner.description = Some(description.into());
        self
    }

    /// Unit of measurement (e.g. "V", "s", "nm").
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.inner.unit = Some(unit.into());
        self
    }

    /// Inclusive numeric bounds.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.inner.min = Some(min);
        self.inner.max = Some(max);
        self
    }

    /// Inclusive lower bound only.
    pub fn min(mut self, min: f64) -> Self {
        self.inner.min = Some(min);
        self
    }

    /// Discrete set of allowed values.
    pub fn choices(mut self, choices: Vec<ParameterValue>) -> Self {
        self.inner.choices = Some(choices);
        self
    }

    /// Only present the parameter while `rule` holds.
    pub fn visible_when(mut self, rule: VisibilityRule) -> Self {
        self.inner.visibility = Some(rule);
        self
    }

    /// Build the parameter.
    pub fn build(self) -> Parameter {
        self.inner
    }
}

// =============================================================================
// ParameterSet
// =============================================================================

/// Ordered mapping of parameter name to [`Parameter`].
///
/// Names are unique and insertion order is preserved; the order drives
/// display and iteration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    params: Vec<Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an unconstrained set from `(name, value)` pairs, keeping their order.
    pub fn from_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParameterValue>,
    {
        let mut set = Self::new();
        for (name, value) in values {
            set.insert(Parameter::new(name, value));
        }
        set
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, param: Parameter) -> Self {
        self.insert(param);
        self
    }

    /// Insert a parameter, replacing any existing one with the same name in place.
    pub fn insert(&mut self, param: Parameter) {
        match self.params.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param,
            None => self.params.push(param),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.name == name)
    }

    /// Current value of `name`.
    pub fn value(&self, name: &str) -> Option<&ParameterValue> {
        self.get(name).map(Parameter::value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    /// Parameters that should currently be presented, in set order.
    pub fn visible(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter().filter(move |p| is_visible(p, self))
    }

    /// Validate and set a single value.
    pub fn set_value(&mut self, name: &str, value: impl Into<ParameterValue>) -> AppResult<()> {
        self.get_mut(name)
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))?
            .set(value)
    }

    /// Copy of `self` with `overrides` applied in order.
    ///
    /// Unknown names fail with [`DaqError::UnknownParameter`]; values that do
    /// not fit the parameter fail with [`DaqError::InvalidParameterValue`];
    /// repeated names fail with [`DaqError::DuplicateOverride`].
    pub fn resolve_effective(&self, overrides: &Overrides) -> AppResult<ParameterSet> {
        overrides.validate()?;

        let mut effective = self.clone();
        for (name, entry) in overrides.iter() {
            let param = effective
                .get_mut(name)
                .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))?;
            if let Some(value) = &entry.value {
                param.value = param.validate(value)?;
            }
            if let Some(rule) = &entry.visibility {
                param.visibility = Some(rule.clone());
            }
        }
        Ok(effective)
    }

    /// Layer shared values onto this set.
    ///
    /// Parameters this set already declares take the shared value (checked
    /// against their own constraints); the rest are appended as-is.
    pub fn layer(&self, shared: &ParameterSet) -> AppResult<ParameterSet> {
        let mut merged = self.clone();
        for param in shared.iter() {
            match merged.get_mut(&param.name) {
                Some(existing) => existing.value = existing.validate(&param.value)?,
                None => merged.params.push(param.clone()),
            }
        }
        Ok(merged)
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

/// Evaluate `p`'s visibility rule against the current values in `set`.
///
/// Parameters without a rule are always visible. A rule whose controlling
/// parameter is missing, or itself hidden, hides `p`. Never changes any value.
pub fn is_visible(p: &Parameter, set: &ParameterSet) -> bool {
    let mut current = p;
    // Bounded by the set size so a cyclic chain cannot loop forever.
    for _ in 0..=set.len() {
        let Some(rule) = &current.visibility else {
            return true;
        };
        let Some(controller) = set.get(&rule.parameter) else {
            return false;
        };
        if !rule.predicate.holds(&controller.value) {
            return false;
        }
        current = controller;
    }
    false
}

// =============================================================================
// Overrides
// =============================================================================

/// One override entry: a new value, a new visibility rule, or both.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ParameterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<VisibilityRule>,
}

/// Ordered list of per-step overrides.
///
/// Kept as a list rather than a map so that a repeated name survives until
/// [`Overrides::validate`] can reject it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overrides {
    entries: Vec<(String, ParameterOverride)>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style value override.
    pub fn value(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.push(
            name,
            ParameterOverride {
                value: Some(value.into()),
                visibility: None,
            },
        );
        self
    }

    /// Builder-style visibility override.
    pub fn visibility(mut self, name: impl Into<String>, rule: VisibilityRule) -> Self {
        self.push(
            name,
            ParameterOverride {
                value: None,
                visibility: Some(rule),
            },
        );
        self
    }

    pub fn push(&mut self, name: impl Into<String>, entry: ParameterOverride) {
        self.entries.push((name.into(), entry));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterOverride)> {
        self.entries.iter().map(|(n, e)| (n.as_str(), e))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject repeated names.
    pub fn validate(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        for (name, _) in &self.entries {
            if !seen.insert(name.as_str()) {
                return Err(DaqError::DuplicateOverride(name.clone()));
            }
        }
        Ok(())
    }
}

/// A bare value (`vg = 1.0`) or a `{ value, visibility }` table.
#[derive(Deserialize)]
#[serde(untagged)]
enum OverrideEntry {
    Value(ParameterValue),
    Table(ParameterOverride),
}

impl From<OverrideEntry> for ParameterOverride {
    fn from(entry: OverrideEntry) -> Self {
        match entry {
            OverrideEntry::Value(value) => ParameterOverride {
                value: Some(value),
                visibility: None,
            },
            OverrideEntry::Table(table) => table,
        }
    }
}

struct OverridesVisitor;

impl<'de> serde::de::Visitor<'de> for OverridesVisitor {
    type Value = Overrides;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of parameter names to values or { value, visibility } tables")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Overrides, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        // Entries keep document order; repeated names are left for validate()
        let mut overrides = Overrides::new();
        while let Some((name, entry)) = map.next_entry::<String, OverrideEntry>()? {
            overrides.push(name, entry.into());
        }
        Ok(overrides)
    }
}

impl<'de> Deserialize<'de> for Overrides {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(OverridesVisitor)
    }
}

impl Serialize for Overrides {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, entry) in &self.entries {
            match (&entry.value, &entry.visibility) {
                (Some(value), None) => map.serialize_entry(name, value)?,
                _ => map.serialize_entry(name, entry)?,
            }
        }
        map.end()
    }
}

// =============================================================================
// Tests
// =============================================================================
