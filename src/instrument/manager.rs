//! Shared-instrument manager with reference-counted claims.
//!
//! Many lab instruments only tolerate one physical connection, and reopening
//! them between steps is slow. The manager keeps one connection per resource
//! key and hands out [`InstrumentHandle`]s backed by claims.
//!
//! # Claims
//!
//! A claim is `(key, owner, mode, count)`. Acquiring again with the same owner
//! bumps the count. Claims from different owners must have compatible modes
//! (see [`AccessMode::compatible_with`]).
//!
//! The first open of a key also records a [`AccessMode::Retain`] claim for the
//! execution owner, so a connection survives between steps that use it. The
//! engine drops that hold once, with `release_all(execution_owner)`, when the
//! run ends. A connection is closed, and its `shutdown` called, exactly when
//! its last claim goes away.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lab_sequencer::instrument::{AccessMode, InstrumentManager, OwnerId, SimulatedDriver};
//!
//! # tokio_test::block_on(async {
//! let manager = InstrumentManager::new(Arc::new(SimulatedDriver::new()), OwnerId::new("run:demo"));
//! let step = OwnerId::new("step:0.0");
//!
//! let meter = manager.acquire("GPIB0::26::INSTR", &step, AccessMode::Exclusive).await?;
//! meter.write("source_voltage", 0.075).await?;
//!
//! // The step is done, but the run still holds the connection
//! manager.release_all(&step).await;
//! assert!(manager.is_open("GPIB0::26::INSTR").await);
//!
//! manager.release_all(manager.execution_owner()).await;
//! assert_eq!(manager.closes(), 1);
//! # Ok::<(), anyhow::Error>(())
//! # }).unwrap();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AccessMode, Instrument, InstrumentDriver, OwnerId};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{retry_with_policy, RetryPolicy};

/// A single owner's hold on an instrument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstrumentClaim {
    pub instrument_key: String,
    pub owner: OwnerId,
    pub mode: AccessMode,
    pub count: usize,
}

/// Leased access to an open instrument.
///
/// Valid until the owner releases it. Cloning does not add a claim.
#[derive(Clone)]
pub struct InstrumentHandle {
    key: String,
    owner: OwnerId,
    mode: AccessMode,
    instrument: Arc<dyn Instrument>,
}

impl InstrumentHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Set a control property on the instrument.
    pub async fn write(&self, property: &str, value: f64) -> anyhow::Result<()> {
        self.instrument.write(property, value).await
    }

    /// Read a quantity from the instrument.
    pub async fn read(&self, quantity: &str) -> anyhow::Result<f64> {
        self.instrument.read(quantity).await
    }
}

impl std::fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("mode", &self.mode)
            .finish()
    }
}

struct Connection {
    instrument: Arc<dyn Instrument>,
    claims: Vec<InstrumentClaim>,
}

impl Connection {
    fn total_claims(&self) -> usize {
        self.claims.iter().map(|c| c.count).sum()
    }
}

#[derive(Default)]
struct Counters {
    opens: AtomicU64,
    closes: AtomicU64,
}

/// Opens, shares and closes instrument connections for one execution.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InstrumentManager {
    driver: Arc<dyn InstrumentDriver>,
    execution_owner: OwnerId,
    retry: RetryPolicy,
    connections: Arc<Mutex<HashMap<String, Connection>>>,
    counters: Arc<Counters>,
}

impl InstrumentManager {
    /// Create a manager whose keep-alive claims belong to `execution_owner`.
    pub fn new(driver: Arc<dyn InstrumentDriver>, execution_owner: OwnerId) -> Self {
        Self {
            driver,
            execution_owner,
            retry: RetryPolicy::no_retry(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Retry physical opens according to `policy`.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn execution_owner(&self) -> &OwnerId {
        &self.execution_owner
    }

    /// Grant `owner` access to `key` in `mode`, opening the connection if needed.
    ///
    /// # Errors
    ///
    /// - [`DaqError::ModeConflict`] if another owner holds an incompatible claim.
    /// - [`DaqError::InstrumentUnavailable`] if the driver cannot open `key`.
    pub async fn acquire(
        &self,
        key: &str,
        owner: &OwnerId,
        mode: AccessMode,
    ) -> AppResult<InstrumentHandle> {
        // The lock is held across the open so concurrent acquisitions of the
        // same key serialize and never open twice.
        let mut connections = self.connections.lock().await;

        if let Some(conn) = connections.get_mut(key) {
            if let Some(conflict) = conn
                .claims
                .iter()
                .find(|c| &c.owner != owner && !c.mode.compatible_with(mode))
            {
                return Err(DaqError::ModeConflict {
                    key: key.to_string(),
                    held: conflict.mode.to_string(),
                    holder: conflict.owner.to_string(),
                    requested: mode.to_string(),
                    requested_by: owner.to_string(),
                });
            }

            debug!(instrument = key, %owner, %mode, "Reusing open instrument");
            let granted = add_claim(&mut conn.claims, key, owner, mode);
            return Ok(InstrumentHandle {
                key: key.to_string(),
                owner: owner.clone(),
                mode: granted,
                instrument: conn.instrument.clone(),
            });
        }

        debug!(instrument = key, %owner, %mode, "Opening instrument");
        let driver = self.driver.clone();
        let instrument = retry_with_policy(&self.retry, |attempt| {
            let driver = driver.clone();
            async move {
                if attempt > 1 {
                    debug!(instrument = key, attempt, "Retrying instrument open");
                }
                driver.open(key, mode).await
            }
        })
        .await
        .map_err(|e| DaqError::InstrumentUnavailable {
            key: key.to_string(),
            reason: format!("{:#}", e),
        })?;

        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        info!(instrument = key, "Instrument opened");

        let mut claims = Vec::with_capacity(2);
        if owner != &self.execution_owner {
            add_claim(&mut claims, key, &self.execution_owner, AccessMode::Retain);
        }
        let granted = add_claim(&mut claims, key, owner, mode);
        connections.insert(
            key.to_string(),
            Connection {
                instrument: instrument.clone(),
                claims,
            },
        );

        Ok(InstrumentHandle {
            key: key.to_string(),
            owner: owner.clone(),
            mode: granted,
            instrument,
        })
    }

    /// Drop one claim of `owner` on `key`. Closes the connection when it was the last.
    ///
    /// Releasing something `owner` does not hold is logged and ignored.
    pub async fn release(&self, key: &str, owner: &OwnerId) {
        let mut connections = self.connections.lock().await;
        let Some(conn) = connections.get_mut(key) else {
            warn!(instrument = key, %owner, "Release of instrument that is not open");
            return;
        };
        let Some(pos) = conn.claims.iter().position(|c| &c.owner == owner) else {
            warn!(instrument = key, %owner, "Release by owner without a claim");
            return;
        };

        conn.claims[pos].count -= 1;
        if conn.claims[pos].count == 0 {
            conn.claims.remove(pos);
        }
        if conn.total_claims() == 0 {
            if let Some(conn) = connections.remove(key) {
                self.close(key, conn).await;
            }
        }
    }

    /// Drop every claim held by `owner`, closing connections left without claims.
    ///
    /// Returns how many claims were dropped. Safe to call repeatedly.
    pub async fn release_all(&self, owner: &OwnerId) -> usize {
        let mut connections = self.connections.lock().await;
        let mut released = 0;
        let mut orphaned = Vec::new();

        for (key, conn) in connections.iter_mut() {
            conn.claims.retain(|c| {
                if &c.owner == owner {
                    released += c.count;
                    false
                } else {
                    true
                }
            });
            if conn.total_claims() == 0 {
                orphaned.push(key.clone());
            }
        }

        // Sorted so teardown order does not depend on hash order.
        orphaned.sort();
        for key in orphaned {
            if let Some(conn) = connections.remove(&key) {
                self.close(&key, conn).await;
            }
        }

        if released > 0 {
            debug!(%owner, released, "Released all claims");
        }
        released
    }

    async fn close(&self, key: &str, conn: Connection) {
        if let Err(e) = conn.instrument.shutdown().await {
            warn!(instrument = key, error = %e, "Instrument shutdown failed");
        }
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        info!(instrument = key, "Instrument closed");
    }

    /// Whether `key` currently has an open connection.
    pub async fn is_open(&self, key: &str) -> bool {
        self.connections.lock().await.contains_key(key)
    }

    /// Keys with an open connection, sorted.
    pub async fn open_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the claims on `key`.
    pub async fn claims(&self, key: &str) -> Vec<InstrumentClaim> {
        self.connections
            .lock()
            .await
            .get(key)
            .map(|c| c.claims.clone())
            .unwrap_or_default()
    }

    /// Sum of claim counts on `key` (0 when closed).
    pub async fn ref_count(&self, key: &str) -> usize {
        self.connections
            .lock()
            .await
            .get(key)
            .map(Connection::total_claims)
            .unwrap_or(0)
    }

    /// Physical opens performed by this manager.
    pub fn opens(&self) -> u64 {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Physical closes performed by this manager.
    pub fn closes(&self) -> u64 {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

fn add_claim(
    claims: &mut Vec<InstrumentClaim>,
    key: &str,
    owner: &OwnerId,
    mode: AccessMode,
) -> AccessMode {
    match claims.iter_mut().find(|c| &c.owner == owner) {
        Some(existing) => {
            existing.count += 1;
            existing.mode = existing.mode.strongest(mode);
            existing.mode
        }
        None => {
            claims.push(InstrumentClaim {
                instrument_key: key.to_string(),
                owner: owner.clone(),
                mode,
                count: 1,
            });
            mode
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SimulatedDriver;
    use std::time::Duration;

    fn manager(driver: &SimulatedDriver) -> InstrumentManager {
        InstrumentManager::new(Arc::new(driver.clone()), OwnerId::execution("test"))
    }

    #[tokio::test]
    async fn test_reuse_single_connection() {
        let driver = SimulatedDriver::new();
        let manager = manager(&driver);
        let a = OwnerId::new("0.0");
        let b = OwnerId::new("1.0");

        manager.acquire("laser", &a, AccessMode::Shared).await.unwrap();
        manager.acquire("laser", &b, AccessMode::Shared).await.unwrap();

        assert_eq!(manager.opens(), 1);
        // execution retain + two steps
        assert_eq!(manager.ref_count("laser").await, 3);
        assert_eq!(driver.opens_of("laser").await, 1);
    }

    #[tokio::test]
    async fn test_exclusive_conflict() {
        let driver = SimulatedDriver::new();
        let manager = manager(&driver);
        let a = OwnerId::new("0.0");
        let b = OwnerId::new("1.0");

        manager.acquire("smu", &a, AccessMode::Exclusive).await.unwrap();
        let err = manager.acquire("smu", &b, AccessMode::Shared).await.unwrap_err();
        assert!(matches!(err, DaqError::ModeConflict { ref holder, .. } if holder == "0.0"));

        // The same owner may stack claims
        manager.acquire("smu", &a, AccessMode::Shared).await.unwrap();
        let claims = manager.claims("smu").await;
        let own = claims.iter().find(|c| c.owner == a).unwrap();
        assert_eq!(own.count, 2);
        assert_eq!(own.mode, AccessMode::Exclusive);
    }

    #[tokio::test]
    async fn test_step_release_keeps_connection_until_execution_ends() {
        let driver = SimulatedDriver::new();
        let manager = manager(&driver);
        let step = OwnerId::new("0.0");

        manager.acquire("smu", &step, AccessMode::Exclusive).await.unwrap();
        assert_eq!(manager.release_all(&step).await, 1);
        assert!(manager.is_open("smu").await);
        assert_eq!(manager.closes(), 0);

        manager.release_all(manager.execution_owner()).await;
        assert!(!manager.is_open("smu").await);
        assert_eq!(manager.closes(), 1);
        assert_eq!(driver.closes_of("smu").await, 1);

        // Idempotent
        assert_eq!(manager.release_all(&step).await, 0);
        assert_eq!(manager.closes(), 1);
    }

    #[tokio::test]
    async fn test_release_decrements_then_closes() {
        let driver = SimulatedDriver::new();
        let manager = manager(&driver);
        let exec = manager.execution_owner().clone();

        manager.acquire("laser", &exec, AccessMode::Shared).await.unwrap();
        manager.acquire("laser", &exec, AccessMode::Shared).await.unwrap();
        assert_eq!(manager.ref_count("laser").await, 2);

        manager.release("laser", &exec).await;
        assert!(manager.is_open("laser").await);
        manager.release("laser", &exec).await;
        assert!(!manager.is_open("laser").await);
        assert_eq!(manager.closes(), 1);

        // Unknown release is ignored
        manager.release("laser", &exec).await;
        assert_eq!(manager.closes(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_instrument() {
        let driver = SimulatedDriver::new().with_unavailable("COM9");
        let manager = manager(&driver).with_retry_policy(RetryPolicy {
            max_attempts: 2,
            backoff_delay: Duration::from_millis(1),
        });

        let err = manager
            .acquire("COM9", &OwnerId::new("0.0"), AccessMode::Exclusive)
            .await
            .unwrap_err();
        assert!(err.is_acquisition());
        assert_eq!(manager.opens(), 0);
        assert!(manager.open_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_opens_once() {
        let driver = SimulatedDriver::new().with_open_delay(Duration::from_millis(20));
        let manager = manager(&driver);

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .acquire("laser", &OwnerId::new(format!("{}.0", i)), AccessMode::Shared)
                        .await
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        assert_eq!(manager.opens(), 1);
        assert_eq!(driver.opens_of("laser").await, 1);
    }
}
