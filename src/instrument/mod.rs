//! Instrument abstraction and shared-instrument lifecycle.
//!
//! Physical drivers live outside this crate. They are reached through two
//! traits:
//!
//! - [`InstrumentDriver`]: opens a physical connection for a resource key
//!   (VISA resource string, serial port, ...).
//! - [`Instrument`]: an open connection, with property-style `write`/`read`
//!   and a power-down `shutdown`.
//!
//! [`InstrumentManager`] is the single authority that opens, shares and closes
//! those connections for one execution. Procedures only ever see an
//! [`InstrumentHandle`], leased between `acquire` and `release`.
//!
//! ```text
//! Step ──acquire(key, mode)──▶ InstrumentManager ──open(key)──▶ InstrumentDriver
//!   ◀──────── InstrumentHandle ──────┘   (refcounted claims, one open per key)
//! ```

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod manager;
pub mod simulated;

pub use manager::{InstrumentClaim, InstrumentHandle, InstrumentManager};
pub use simulated::{FallbackDriver, SimulatedDriver, SimulatedInstrument};

/// How a claim intends to use an instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Several holders may use the instrument at once (readers, shared sources).
    Shared,
    /// A single holder drives the instrument (source-measure units, writers).
    Exclusive,
    /// Keep-alive hold placed by the execution itself. Compatible with every
    /// mode; it only keeps the connection open between steps.
    Retain,
}

impl AccessMode {
    /// Whether a claim in `self` held by one owner tolerates `other` from another.
    pub fn compatible_with(self, other: AccessMode) -> bool {
        match (self, other) {
            (AccessMode::Retain, _) | (_, AccessMode::Retain) => true,
            (AccessMode::Shared, AccessMode::Shared) => true,
            _ => false,
        }
    }

    fn strongest(self, other: AccessMode) -> AccessMode {
        match (self, other) {
            (AccessMode::Exclusive, _) | (_, AccessMode::Exclusive) => AccessMode::Exclusive,
            (AccessMode::Shared, _) | (_, AccessMode::Shared) => AccessMode::Shared,
            _ => AccessMode::Retain,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessMode::Shared => "shared",
            AccessMode::Exclusive => "exclusive",
            AccessMode::Retain => "retain",
        };
        f.write_str(name)
    }
}

/// Identity of a claim holder: a step, or the execution itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Owner used for the execution-wide keep-alive claims.
    pub fn execution(run_id: impl fmt::Display) -> Self {
        Self(format!("run:{}", run_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An open connection to a physical instrument.
///
/// Property-style access mirrors how lab drivers expose controls
/// (`source_voltage`, `output`) and measurements (`current`, `power`).
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Resource key this connection was opened for.
    fn key(&self) -> &str;

    /// Set a control property.
    async fn write(&self, property: &str, value: f64) -> Result<()>;

    /// Read a measurement or the current value of a control.
    async fn read(&self, quantity: &str) -> Result<f64>;

    /// Power down and release the transport. Called once when the last claim goes.
    async fn shutdown(&self) -> Result<()>;
}

/// Opens physical connections.
#[async_trait]
pub trait InstrumentDriver: Send + Sync {
    /// Open `key`. Fails on transport errors (device missing, port busy).
    async fn open(&self, key: &str, mode: AccessMode) -> Result<Arc<dyn Instrument>>;
}

/// An instrument a procedure needs, declared up front so the lifecycle can
/// acquire it before `startup`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRequirement {
    /// Name the procedure uses to look the handle up (e.g. "meter").
    pub role: String,
    /// Resource key passed to the manager.
    pub key: String,
    pub mode: AccessMode,
}

impl InstrumentRequirement {
    pub fn new(role: impl Into<String>, key: impl Into<String>, mode: AccessMode) -> Self {
        Self {
            role: role.into(),
            key: key.into(),
            mode,
        }
    }
}
