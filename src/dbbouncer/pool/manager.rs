use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::config::settings::{DRAIN_POLL_MILLIS, DRAIN_TIMEOUT_SECS};
use crate::dbbouncer::directory::RoutingDirectory;
use crate::dbbouncer::metrics::MetricsSink;
use crate::dbbouncer::pool::connection::PooledConnection;
use crate::dbbouncer::pool::tenant_pool::TenantPool;

/// Owns one [TenantPool] per tenant, created lazily on first use. Pools are
/// looked up by tenant id through a `DashMap` so unrelated tenants never
/// contend on the same lock the way a single `Mutex<HashMap<_>>` would.
pub struct PoolManager {
    directory: Arc<RoutingDirectory>,
    metrics: Arc<dyn MetricsSink>,
    pools: DashMap<String, Arc<TenantPool>>,
}

impl PoolManager {
    pub fn new(directory: Arc<RoutingDirectory>, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        Arc::new(PoolManager { directory, metrics, pools: DashMap::new() })
    }

    /// Get or lazily create the pool for `tenant_id`. Double-checks after
    /// acquiring the `DashMap` entry so concurrent first-touches don't race
    /// to create two pools for the same tenant.
    pub async fn get_or_create(&self, tenant_id: &str) -> Result<Arc<TenantPool>> {
        if let Some(pool) = self.pools.get(tenant_id) {
            return Ok(pool.clone());
        }
        let tenant = self
            .directory
            .resolve(tenant_id)
            .ok_or_else(|| Error::admission(format!("unknown tenant {:?}", tenant_id)))?;
        let settings = self.directory.defaults().resolve(&tenant.pool);

        let pool = match self.pools.entry(tenant_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let pool = TenantPool::new(tenant, settings, self.metrics.clone());
                e.insert(pool.clone());
                pool
            }
        };
        Ok(pool)
    }

    pub async fn prewarm_all(&self) {
        for tenant in self.directory.list() {
            if let Ok(pool) = self.get_or_create(&tenant.tenant_id).await {
                pool.prewarm().await;
            }
        }
    }

    /// Drain and drop the pool for a tenant removed from the routing directory.
    pub async fn remove(&self, tenant_id: &str) {
        if let Some((_, pool)) = self.pools.remove(tenant_id) {
            pool.drain(Duration::from_secs(DRAIN_TIMEOUT_SECS), Duration::from_millis(DRAIN_POLL_MILLIS)).await;
        }
    }

    pub async fn release(&self, tenant_id: &str, conn: PooledConnection, healthy: bool) {
        if let Some(pool) = self.pools.get(tenant_id) {
            pool.release(conn, healthy).await;
        } else {
            let _ = conn.close().await;
        }
    }

    /// Background task: reap idle connections across every tenant pool on a
    /// fixed interval.
    pub async fn run_idle_reaper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for entry in self.pools.iter() {
                entry.value().reap_idle().await;
            }
        }
    }

    /// Background task: log a stats snapshot for every tenant pool on a fixed
    /// interval, independent of the per-operation metrics already published by
    /// each pool as it acquires/releases connections.
    pub async fn run_stats_reporter(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for entry in self.pools.iter() {
                let stats = entry.value().stats().await;
                info!(
                    tenant = entry.key().as_str(),
                    active = stats.active,
                    idle = stats.idle,
                    total = stats.total,
                    waiting = stats.waiting,
                    "pool stats"
                );
            }
        }
    }

    pub async fn close_all(&self) {
        for entry in self.pools.iter() {
            entry.value().drain(Duration::from_secs(DRAIN_TIMEOUT_SECS), Duration::from_millis(DRAIN_POLL_MILLIS)).await;
        }
    }
}
