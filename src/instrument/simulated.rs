//! Simulated instruments for development, tests and debug runs.
//!
//! `SimulatedInstrument` accepts any property write and answers reads with
//! the last written value, or a random value in a plausible range for the
//! quantity. `FallbackDriver` substitutes a simulated instrument whenever the
//! real driver fails to open a resource.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{AccessMode, Instrument, InstrumentDriver};

/// Open/close bookkeeping for one resource key.
#[derive(Debug, Default)]
pub struct SimulatedCounters {
    pub opens: AtomicU64,
    pub closes: AtomicU64,
    pub writes: AtomicU64,
}

/// In-memory stand-in for a physical instrument.
pub struct SimulatedInstrument {
    key: String,
    properties: RwLock<HashMap<String, f64>>,
    counters: Arc<SimulatedCounters>,
}

impl SimulatedInstrument {
    fn new(key: &str, counters: Arc<SimulatedCounters>) -> Self {
        Self {
            key: key.to_string(),
            properties: RwLock::new(HashMap::new()),
            counters,
        }
    }

    /// Last value written to `property`.
    pub async fn property(&self, property: &str) -> Option<f64> {
        self.properties.read().await.get(property).copied()
    }
}

#[async_trait]
impl Instrument for SimulatedInstrument {
    fn key(&self) -> &str {
        &self.key
    }

    async fn write(&self, property: &str, value: f64) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        self.properties
            .write()
            .await
            .insert(property.to_string(), value);
        Ok(())
    }

    async fn read(&self, quantity: &str) -> Result<f64> {
        if let Some(value) = self.properties.read().await.get(quantity) {
            return Ok(*value);
        }
        let mut rng = rand::thread_rng();
        let value = match quantity {
            "current" => rng.gen_range(1e-9..1e-6),
            "voltage" => rng.gen_range(1e-3..1e-1),
            "power" => rng.gen_range(1e-6..1e-3),
            "temperature" => rng.gen_range(15.0..25.0),
            _ => rng.gen::<f64>(),
        };
        Ok(value)
    }

    async fn shutdown(&self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        debug!(instrument = %self.key, "Simulated instrument shut down");
        Ok(())
    }
}

/// Driver that opens [`SimulatedInstrument`]s.
///
/// Clones share state, so a test can keep one clone to inspect counters while
/// the manager owns another.
#[derive(Clone, Default)]
pub struct SimulatedDriver {
    unavailable: Arc<StdRwLock<HashSet<String>>>,
    counters: Arc<Mutex<HashMap<String, Arc<SimulatedCounters>>>>,
    instruments: Arc<Mutex<HashMap<String, Arc<SimulatedInstrument>>>>,
    open_delay: Duration,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every open of `key`.
    pub fn with_unavailable(self, key: impl Into<String>) -> Self {
        self.offline().insert(key.into());
        self
    }

    // Never held across an await.
    fn offline(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.unavailable.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulated connection latency.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Mark `key` as unavailable (or available again) at runtime.
    pub async fn set_unavailable(&self, key: &str, unavailable: bool) {
        let mut set = self.offline();
        if unavailable {
            set.insert(key.to_string());
        } else {
            set.remove(key);
        }
    }

    async fn counters_for(&self, key: &str) -> Arc<SimulatedCounters> {
        self.counters
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Number of times `key` was opened.
    pub async fn opens_of(&self, key: &str) -> u64 {
        self.counters_for(key).await.opens.load(Ordering::SeqCst)
    }

    /// Number of times `key` was shut down.
    pub async fn closes_of(&self, key: &str) -> u64 {
        self.counters_for(key).await.closes.load(Ordering::SeqCst)
    }

    /// Most recently opened instance for `key`.
    pub async fn instrument(&self, key: &str) -> Option<Arc<SimulatedInstrument>> {
        self.instruments.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl InstrumentDriver for SimulatedDriver {
    async fn open(&self, key: &str, mode: AccessMode) -> Result<Arc<dyn Instrument>> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let offline = self.offline().contains(key);
        if offline {
            return Err(anyhow!("no device at '{}'", key));
        }

        let counters = self.counters_for(key).await;
        counters.opens.fetch_add(1, Ordering::SeqCst);
        let instrument = Arc::new(SimulatedInstrument::new(key, counters));
        self.instruments
            .lock()
            .await
            .insert(key.to_string(), instrument.clone());
        debug!(instrument = key, %mode, "Simulated instrument opened");
        Ok(instrument)
    }
}

/// Driver wrapper that falls back to a simulated instrument when the inner
/// driver cannot open a resource. Intended for debug runs without hardware.
pub struct FallbackDriver {
    inner: Arc<dyn InstrumentDriver>,
    fallback: SimulatedDriver,
}

impl FallbackDriver {
    pub fn new(inner: Arc<dyn InstrumentDriver>) -> Self {
        Self {
            inner,
            fallback: SimulatedDriver::new(),
        }
    }

    /// The driver used for substitutes, for inspection.
    pub fn fallback(&self) -> &SimulatedDriver {
        &self.fallback
    }
}

#[async_trait]
impl InstrumentDriver for FallbackDriver {
    async fn open(&self, key: &str, mode: AccessMode) -> Result<Arc<dyn Instrument>> {
        match self.inner.open(key, mode).await {
            Ok(instrument) => Ok(instrument),
            Err(e) => {
                warn!(instrument = key, error = %e, "Could not connect, using debug instrument");
                self.fallback.open(key, mode).await
            }
        }
    }
}
