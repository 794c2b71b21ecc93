//! Built-in procedures.
//!
//! Every procedure shares the base parameters below; instrument roles are
//! mapped to resource keys through the `[instruments.addresses]` table.

use crate::config::InstrumentsConfig;
use crate::parameter::{Parameter, ParameterBuilder, ParameterSet};
use crate::procedure::{ProcedureRegistry, CHAINED_EXEC};

pub mod fake;
pub mod it;
pub mod ivg;
pub mod wait;

pub use fake::FakeProcedure;
pub use it::It;
pub use ivg::{gate_ramp, IVg};
pub use wait::Wait;

/// Version tag recorded with every result file.
pub const PROCEDURE_VERSION: &str = "1.0.0";

/// Parameters every built-in procedure carries.
pub fn base_parameters() -> Vec<Parameter> {
    vec![
        ParameterBuilder::new("procedure_version", PROCEDURE_VERSION)
            .description("Procedure version")
            .build(),
        ParameterBuilder::new("show_more", false)
            .description("Show more parameters")
            .build(),
        ParameterBuilder::new(CHAINED_EXEC, false)
            .description("Leave instruments as they are for the next step")
            .build(),
    ]
}

/// Numeric value of `name` in `params`.
pub(crate) fn number(params: &ParameterSet, name: &str) -> anyhow::Result<f64> {
    params
        .value(name)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| anyhow::anyhow!("parameter '{}' is missing or not numeric", name))
}

pub(crate) fn with_base(mut set: ParameterSet) -> ParameterSet {
    for param in base_parameters() {
        if !set.contains(param.name()) {
            set.insert(param);
        }
    }
    set
}

/// Registry holding every built-in procedure.
pub fn builtin_registry(instruments: &InstrumentsConfig) -> ProcedureRegistry {
    ProcedureRegistry::new()
        .with(wait::definition())
        .with(fake::definition())
        .with(it::definition(instruments))
        .with(ivg::definition(instruments))
}
