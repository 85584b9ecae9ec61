use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::config::{PoolSettings, TenantConfig};
use crate::dbbouncer::metrics::MetricsSink;
use crate::dbbouncer::pool::connection::PooledConnection;

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub active: u32,
    pub idle: u32,
    pub total: u32,
    pub waiting: u32,
}

struct Inner {
    idle: VecDeque<PooledConnection>,
    total: u32,
    waiting: u32,
    closed: bool,
}

/// A single tenant's backend connection pool. Mirrors the mutex+notify design
/// the component design doc calls for rather than a lock-free structure: the
/// hot path here is a network round trip to the backend, so a short critical
/// section guarding a `VecDeque` is not the bottleneck.
///
/// `acquire`/`release` use `notify_one` (not FIFO) — a released connection
/// wakes exactly one waiter, and which one is unspecified. Closing the pool
/// broadcasts to every waiter via `notify_waiters`.
pub struct TenantPool {
    tenant: Arc<TenantConfig>,
    settings: PoolSettings,
    inner: Mutex<Inner>,
    notify: Notify,
    metrics: Arc<dyn MetricsSink>,
}

impl TenantPool {
    pub fn new(tenant: Arc<TenantConfig>, settings: PoolSettings, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        Arc::new(TenantPool {
            tenant,
            settings,
            inner: Mutex::new(Inner { idle: VecDeque::new(), total: 0, waiting: 0, closed: false }),
            notify: Notify::new(),
            metrics,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.tenant_id
    }

    /// Dial `min_conns` connections up front so the first clients don't pay
    /// the connection setup cost.
    pub async fn prewarm(self: &Arc<Self>) {
        for _ in 0..self.settings.min_conns {
            match self.dial().await {
                Ok(conn) => {
                    let mut inner = self.inner.lock().await;
                    inner.idle.push_back(conn);
                    self.publish_stats(&inner);
                }
                Err(e) => {
                    warn!(tenant = self.tenant_id(), error = %e, "prewarm dial failed");
                    break;
                }
            }
        }
    }

    async fn dial(&self) -> Result<PooledConnection> {
        let addr = format!("{}:{}", self.tenant.host, self.tenant.port);
        let start = Instant::now();
        let stream = timeout(self.settings.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::dial_failure())?
            .map_err(|_| Error::dial_failure())?;
        let _ = stream.set_nodelay(true);
        Ok(PooledConnection::new(stream, start.elapsed()))
    }

    /// Acquire an idle connection, or dial a fresh one if under `max_conns`, or
    /// wait for one to be released. Times out after `acquire_timeout`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let start = Instant::now();
        let deadline = start + self.settings.acquire_timeout;

        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(Error::pool_closed());
                }
                while let Some(mut conn) = inner.idle.pop_front() {
                    // ping() peeks a non-blocking byte off the socket; doing that on an
                    // authenticated connection risks stealing a byte of a live backend
                    // message, so only dead/unauthenticated connections get probed.
                    let dead = conn.is_expired(self.settings.max_lifetime) || (!conn.authenticated && !conn.ping().await);
                    if dead {
                        inner.total -= 1;
                        continue;
                    }
                    conn.mark_active();
                    self.publish_stats(&inner);
                    self.metrics.observe_acquire_duration(self.tenant_id(), start.elapsed());
                    return Ok(conn);
                }
                if inner.total < self.settings.max_conns {
                    inner.total += 1;
                    self.publish_stats(&inner);
                    drop(inner);
                    return match self.dial().await {
                        Ok(conn) => {
                            self.metrics.observe_acquire_duration(self.tenant_id(), start.elapsed());
                            Ok(conn)
                        }
                        Err(e) => {
                            let mut inner = self.inner.lock().await;
                            inner.total -= 1;
                            self.publish_stats(&inner);
                            Err(e)
                        }
                    };
                }
                inner.waiting += 1;
                self.publish_stats(&inner);
                self.metrics.incr_pool_exhausted(self.tenant_id());
            }

            let now = Instant::now();
            if now >= deadline {
                let mut inner = self.inner.lock().await;
                inner.waiting = inner.waiting.saturating_sub(1);
                self.publish_stats(&inner);
                return Err(Error::acquire_timeout());
            }
            let wait = timeout(deadline - now, self.notify.notified()).await;
            {
                let mut inner = self.inner.lock().await;
                inner.waiting = inner.waiting.saturating_sub(1);
                self.publish_stats(&inner);
            }
            if wait.is_err() {
                return Err(Error::acquire_timeout());
            }
        }
    }

    /// Return a connection to the idle set (or drop it if the pool closed or
    /// the backend state is unsalvageable) and wake one waiter.
    pub async fn release(self: &Arc<Self>, mut conn: PooledConnection, healthy: bool) {
        conn.mark_idle();
        let mut inner = self.inner.lock().await;
        if inner.closed || !healthy || conn.is_expired(self.settings.max_lifetime) {
            inner.total = inner.total.saturating_sub(1);
            self.publish_stats(&inner);
            drop(inner);
            let _ = conn.close().await;
        } else {
            inner.idle.push_back(conn);
            self.publish_stats(&inner);
        }
        self.notify.notify_one();
    }

    fn publish_stats(&self, inner: &Inner) {
        let idle = inner.idle.len() as u32;
        let active = inner.total.saturating_sub(idle);
        self.metrics.set_pool_idle(self.tenant_id(), self.tenant.db_kind, idle);
        self.metrics.set_pool_active(self.tenant_id(), self.tenant.db_kind, active);
        self.metrics.set_pool_total(self.tenant_id(), self.tenant.db_kind, inner.total);
        self.metrics.set_pool_waiting(self.tenant_id(), self.tenant.db_kind, inner.waiting);
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let idle = inner.idle.len() as u32;
        PoolStats { idle, active: inner.total.saturating_sub(idle), total: inner.total, waiting: inner.waiting }
    }

    /// Close idle connections beyond `min_conns` whose idle time or lifetime
    /// has expired. Run on a fixed interval by [super::PoolManager].
    pub async fn reap_idle(&self) {
        let mut inner = self.inner.lock().await;
        let min_conns = self.settings.min_conns;
        let mut keep = VecDeque::new();
        let mut reaped = 0u32;
        while let Some(conn) = inner.idle.pop_front() {
            let total_after_keep = inner.total - reaped;
            if total_after_keep > min_conns
                && (conn.is_idle(self.settings.idle_timeout) || conn.is_expired(self.settings.max_lifetime))
            {
                reaped += 1;
                let _ = conn.close().await;
            } else {
                keep.push_back(conn);
            }
        }
        inner.idle = keep;
        inner.total -= reaped;
        if reaped > 0 {
            debug!(tenant = self.tenant_id(), reaped, "idle reaper closed connections");
        }
        self.publish_stats(&inner);
    }

    /// Mark the pool closed, drop idle connections immediately, then wait up
    /// to `DRAIN_TIMEOUT_SECS` (polling every `DRAIN_POLL_MILLIS`) for
    /// outstanding checked-out connections to be released before returning.
    pub async fn drain(&self, timeout_dur: Duration, poll: Duration) {
        {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            while let Some(conn) = inner.idle.pop_front() {
                inner.total = inner.total.saturating_sub(1);
                let _ = conn.close().await;
            }
        }
        self.notify.notify_waiters();

        let deadline = Instant::now() + timeout_dur;
        loop {
            let total = self.inner.lock().await.total;
            if total == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }
        let remaining = self.inner.lock().await.total;
        if remaining > 0 {
            warn!(tenant = self.tenant_id(), remaining, "force-closing pool with connections still checked out");
        }
        info!(tenant = self.tenant_id(), "pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbbouncer::config::{DbKind, PoolDefaults, PoolOverrides};
    use crate::dbbouncer::metrics::NoopMetrics;

    fn tenant() -> Arc<TenantConfig> {
        Arc::new(TenantConfig {
            tenant_id: "acme".to_string(),
            db_kind: DbKind::Postgres,
            host: "127.0.0.1".to_string(),
            port: 1, // nothing listens here; dials fail fast via connection refused
            database: "db".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            pool: PoolOverrides::default(),
        })
    }

    #[tokio::test]
    async fn test_acquire_dial_failure_propagates() {
        let settings = PoolDefaults::default().resolve(&PoolOverrides::default());
        let pool = TenantPool::new(tenant(), settings, Arc::new(NoopMetrics));
        let result = pool.acquire().await;
        assert!(result.is_err());
        let stats = pool.stats().await;
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn test_drain_on_empty_pool_returns_immediately() {
        let settings = PoolDefaults::default().resolve(&PoolOverrides::default());
        let pool = TenantPool::new(tenant(), settings, Arc::new(NoopMetrics));
        let start = Instant::now();
        pool.drain(Duration::from_secs(5), Duration::from_millis(10)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
