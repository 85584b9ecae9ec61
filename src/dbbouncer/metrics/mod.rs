use std::time::Duration;

use crate::dbbouncer::config::DbKind;

/// Observability seam for the pool and relay layers. A real deployment wires in
/// a Prometheus-backed sink; tests and `--no-metrics` runs use [NoopMetrics].
pub trait MetricsSink: Send + Sync {
    fn set_pool_active(&self, tenant_id: &str, db_kind: DbKind, n: u32);
    fn set_pool_idle(&self, tenant_id: &str, db_kind: DbKind, n: u32);
    fn set_pool_total(&self, tenant_id: &str, db_kind: DbKind, n: u32);
    fn set_pool_waiting(&self, tenant_id: &str, db_kind: DbKind, n: u32);
    fn incr_pool_exhausted(&self, tenant_id: &str);
    fn observe_transaction_duration(&self, tenant_id: &str, d: Duration);
    fn observe_acquire_duration(&self, tenant_id: &str, d: Duration);
    fn incr_session_pins(&self, tenant_id: &str, reason: &str);
    fn incr_backend_resets(&self, tenant_id: &str, status: &str);
    fn incr_dirty_disconnects(&self, tenant_id: &str);
    fn observe_health_check_duration(&self, tenant_id: &str, d: Duration);
    fn set_tenant_health(&self, tenant_id: &str, healthy: bool);
}

/// Discards everything. Used when metrics aren't configured and in most unit tests.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn set_pool_active(&self, _tenant_id: &str, _db_kind: DbKind, _n: u32) {}
    fn set_pool_idle(&self, _tenant_id: &str, _db_kind: DbKind, _n: u32) {}
    fn set_pool_total(&self, _tenant_id: &str, _db_kind: DbKind, _n: u32) {}
    fn set_pool_waiting(&self, _tenant_id: &str, _db_kind: DbKind, _n: u32) {}
    fn incr_pool_exhausted(&self, _tenant_id: &str) {}
    fn observe_transaction_duration(&self, _tenant_id: &str, _d: Duration) {}
    fn observe_acquire_duration(&self, _tenant_id: &str, _d: Duration) {}
    fn incr_session_pins(&self, _tenant_id: &str, _reason: &str) {}
    fn incr_backend_resets(&self, _tenant_id: &str, _status: &str) {}
    fn incr_dirty_disconnects(&self, _tenant_id: &str) {}
    fn observe_health_check_duration(&self, _tenant_id: &str, _d: Duration) {}
    fn set_tenant_health(&self, _tenant_id: &str, _healthy: bool) {}
}

/// Logs every metrics event as a structured `tracing` event at debug level.
/// Not a substitute for a real metrics backend, but gives an operator something
/// to grep without pulling in a Prometheus client dependency the pack doesn't use.
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn set_pool_active(&self, tenant_id: &str, db_kind: DbKind, n: u32) {
        tracing::debug!(tenant = tenant_id, db_kind = ?db_kind, active = n, "pool_active");
    }
    fn set_pool_idle(&self, tenant_id: &str, db_kind: DbKind, n: u32) {
        tracing::debug!(tenant = tenant_id, db_kind = ?db_kind, idle = n, "pool_idle");
    }
    fn set_pool_total(&self, tenant_id: &str, db_kind: DbKind, n: u32) {
        tracing::debug!(tenant = tenant_id, db_kind = ?db_kind, total = n, "pool_total");
    }
    fn set_pool_waiting(&self, tenant_id: &str, db_kind: DbKind, n: u32) {
        tracing::debug!(tenant = tenant_id, db_kind = ?db_kind, waiting = n, "pool_waiting");
    }
    fn incr_pool_exhausted(&self, tenant_id: &str) {
        tracing::debug!(tenant = tenant_id, "pool_exhausted_total");
    }
    fn observe_transaction_duration(&self, tenant_id: &str, d: Duration) {
        tracing::debug!(tenant = tenant_id, micros = d.as_micros() as u64, "transaction_duration");
    }
    fn observe_acquire_duration(&self, tenant_id: &str, d: Duration) {
        tracing::debug!(tenant = tenant_id, micros = d.as_micros() as u64, "acquire_duration");
    }
    fn incr_session_pins(&self, tenant_id: &str, reason: &str) {
        tracing::debug!(tenant = tenant_id, reason, "session_pins_total");
    }
    fn incr_backend_resets(&self, tenant_id: &str, status: &str) {
        tracing::debug!(tenant = tenant_id, status, "backend_resets_total");
    }
    fn incr_dirty_disconnects(&self, tenant_id: &str) {
        tracing::debug!(tenant = tenant_id, "dirty_disconnects_total");
    }
    fn observe_health_check_duration(&self, tenant_id: &str, d: Duration) {
        tracing::debug!(tenant = tenant_id, micros = d.as_micros() as u64, "health_check_duration");
    }
    fn set_tenant_health(&self, tenant_id: &str, healthy: bool) {
        tracing::debug!(tenant = tenant_id, healthy, "tenant_health");
    }
}
