//! Process-wide registry of runtime connections.
//!
//! One entry per runtime endpoint, capped by subscription tier. The pool
//! owns the periodic keep-alive and health-check sweeps; both start with
//! the first registration and stop when the last entry goes away.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::api::{AssignedRuntime, ControlPlane};
use crate::config::{Config, SubscriptionTier};

use super::{ConnectOptions, Connection, ConnectionError, ConnectionState};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub tier: SubscriptionTier,
    pub keep_alive_interval: Duration,
    pub health_check_interval: Duration,
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tier: config.tier,
            keep_alive_interval: config.keep_alive_interval,
            health_check_interval: config.health_check_interval,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub connected: usize,
    pub reconnecting: usize,
    pub failed: usize,
    pub limit: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("connection limit reached: the {tier:?} tier allows {limit} concurrent runtime connection(s); shut one down with `cumulus shutdown` or upgrade the subscription")]
    CapacityExceeded {
        tier: SubscriptionTier,
        limit: usize,
    },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    api: Arc<dyn ControlPlane>,
    connect_opts: ConnectOptions,
    keep_alive_interval: Duration,
    health_check_interval: Duration,
    tier: parking_lot::RwLock<SubscriptionTier>,
    entries: tokio::sync::Mutex<HashMap<String, Arc<Connection>>>,
    sweeps: parking_lot::Mutex<Option<Sweeps>>,
}

struct Sweeps {
    keep_alive: tokio::task::JoinHandle<()>,
    health: tokio::task::JoinHandle<()>,
}

impl ConnectionPool {
    pub fn new(api: Arc<dyn ControlPlane>, connect_opts: ConnectOptions, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolShared {
                api,
                connect_opts,
                keep_alive_interval: config.keep_alive_interval,
                health_check_interval: config.health_check_interval,
                tier: parking_lot::RwLock::new(config.tier),
                entries: tokio::sync::Mutex::new(HashMap::new()),
                sweeps: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Return the healthy connection for this endpoint, or build one.
    ///
    /// Reusing a pooled endpoint never counts against the tier limit; only
    /// a genuinely new entry does.
    pub async fn get_or_create(
        &self,
        runtime: AssignedRuntime,
    ) -> Result<Arc<Connection>, PoolError> {
        let mut entries = self.inner.entries.lock().await;

        if let Some(existing) = entries.get(&runtime.endpoint) {
            if existing.is_healthy() {
                tracing::debug!(
                    target: "cumulus::pool",
                    endpoint = %runtime.endpoint,
                    "reusing pooled connection"
                );
                return Ok(existing.clone());
            }
            let stale = entries.remove(&runtime.endpoint).expect("entry just seen");
            tracing::info!(
                target: "cumulus::pool",
                endpoint = %runtime.endpoint,
                state = ?stale.state(),
                "replacing unhealthy pooled connection"
            );
            stale.shutdown(false).await;
        }

        let tier = *self.inner.tier.read();
        let limit = tier.connection_limit();
        if entries.len() >= limit {
            return Err(PoolError::CapacityExceeded { tier, limit });
        }

        let connection = Connection::new(
            runtime,
            self.inner.api.clone(),
            self.inner.connect_opts.clone(),
        );
        connection.initialize().await.map_err(PoolError::from)?;
        entries.insert(connection.endpoint().to_string(), connection.clone());
        self.inner.start_sweeps();
        Ok(connection)
    }

    pub async fn get(&self, endpoint: &str) -> Option<Arc<Connection>> {
        self.inner.entries.lock().await.get(endpoint).cloned()
    }

    pub async fn close_connection(&self, endpoint: &str) {
        let mut entries = self.inner.entries.lock().await;
        let Some(conn) = entries.remove(endpoint) else {
            return;
        };
        conn.shutdown(false).await;
        if entries.is_empty() {
            self.inner.stop_sweeps();
        }
    }

    /// Close every entry, waiting for all attempts regardless of outcome.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut entries = self.inner.entries.lock().await;
            entries.drain().map(|(_, conn)| conn).collect()
        };
        let count = drained.len();
        futures::future::join_all(
            drained
                .into_iter()
                .map(|conn| async move { conn.shutdown(false).await }),
        )
        .await;
        self.inner.stop_sweeps();
        tracing::debug!(target: "cumulus::pool", closed = count, "closed all pooled connections");
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.inner.entries.lock().await;
        let mut stats = PoolStats {
            total: entries.len(),
            limit: self.inner.tier.read().connection_limit(),
            ..PoolStats::default()
        };
        for conn in entries.values() {
            match conn.state() {
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::Reconnecting => stats.reconnecting += 1,
                ConnectionState::Failed => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }

    /// Takes effect on future capacity checks only; existing entries stay.
    pub fn set_tier(&self, tier: SubscriptionTier) {
        *self.inner.tier.write() = tier;
    }
}

impl PoolShared {
    fn start_sweeps(self: &Arc<Self>) {
        let mut slot = self.sweeps.lock();
        if slot.is_some() {
            return;
        }
        let keep_alive = tokio::spawn(keep_alive_sweep(
            Arc::downgrade(self),
            self.keep_alive_interval,
        ));
        let health = tokio::spawn(health_sweep(
            Arc::downgrade(self),
            self.health_check_interval,
        ));
        *slot = Some(Sweeps { keep_alive, health });
    }

    fn stop_sweeps(&self) {
        if let Some(sweeps) = self.sweeps.lock().take() {
            sweeps.keep_alive.abort();
            sweeps.health.abort();
        }
    }
}

/// Liveness probe per connected entry. Failures are logged, never fatal.
async fn keep_alive_sweep(weak: Weak<PoolShared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = weak.upgrade() else { return };
        let targets: Vec<Arc<Connection>> =
            pool.entries.lock().await.values().cloned().collect();
        for conn in targets {
            if conn.state() != ConnectionState::Connected {
                continue;
            }
            if let Err(err) = pool.api.send_keep_alive(conn.endpoint()).await {
                tracing::debug!(
                    target: "cumulus::pool",
                    endpoint = %conn.endpoint(),
                    %err,
                    "keep-alive ping failed"
                );
            }
            if let Err(err) = conn.kernel_info().await {
                tracing::warn!(
                    target: "cumulus::pool",
                    endpoint = %conn.endpoint(),
                    %err,
                    "keep-alive kernel probe failed"
                );
            }
        }
    }
}

/// Entries stuck in `Failed` are closed and dropped from the registry.
async fn health_sweep(weak: Weak<PoolShared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = weak.upgrade() else { return };
        let mut entries = pool.entries.lock().await;
        let failed: Vec<String> = entries
            .iter()
            .filter(|(_, conn)| conn.state() == ConnectionState::Failed)
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        for endpoint in failed {
            if let Some(conn) = entries.remove(&endpoint) {
                tracing::warn!(
                    target: "cumulus::pool",
                    endpoint = %endpoint,
                    "dropping failed connection from pool"
                );
                conn.shutdown(false).await;
            }
        }
        if entries.is_empty() {
            drop(entries);
            pool.stop_sweeps();
            return;
        }
    }
}
