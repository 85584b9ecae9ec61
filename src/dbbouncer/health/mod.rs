use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::dbbouncer::config::Settings;
use crate::dbbouncer::directory::RoutingDirectory;
use crate::dbbouncer::metrics::MetricsSink;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub status: Health,
    pub last_check: Instant,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus { status: Health::Healthy, last_check: Instant::now(), consecutive_failures: 0, last_error: None }
    }
}

/// Tracks per-tenant backend reachability. A tenant absent from the map is
/// treated as healthy (unknown defaults to healthy, per the admission rule),
/// so a freshly added tenant isn't rejected before its first health check runs.
pub struct HealthMap {
    statuses: Mutex<HashMap<String, HealthStatus>>,
    unhealthy_threshold: u32,
}

impl HealthMap {
    pub fn new(unhealthy_threshold: u32) -> Self {
        HealthMap { statuses: Mutex::new(HashMap::new()), unhealthy_threshold }
    }

    pub fn is_healthy(&self, tenant_id: &str) -> bool {
        let statuses = self.statuses.lock().unwrap();
        match statuses.get(tenant_id) {
            Some(s) => s.status == Health::Healthy,
            None => true,
        }
    }

    pub fn status_of(&self, tenant_id: &str) -> Option<HealthStatus> {
        self.statuses.lock().unwrap().get(tenant_id).cloned()
    }

    pub fn all_statuses(&self) -> HashMap<String, HealthStatus> {
        self.statuses.lock().unwrap().clone()
    }

    /// Record the outcome of a single probe. Only flips to unhealthy after
    /// `unhealthy_threshold` consecutive failures; a single success clears it.
    pub fn record(&self, tenant_id: &str, ok: bool, error: Option<String>) {
        let mut statuses = self.statuses.lock().unwrap();
        let entry = statuses.entry(tenant_id.to_string()).or_default();
        entry.last_check = Instant::now();
        if ok {
            entry.consecutive_failures = 0;
            entry.status = Health::Healthy;
            entry.last_error = None;
        } else {
            entry.consecutive_failures += 1;
            entry.last_error = error;
            if entry.consecutive_failures >= self.unhealthy_threshold {
                entry.status = Health::Unhealthy;
            }
        }
    }

    pub fn remove(&self, tenant_id: &str) {
        self.statuses.lock().unwrap().remove(tenant_id);
    }
}

/// Background task that periodically TCP-dials every tenant's backend host:port
/// and records the result in a [HealthMap]. A dial timing out or being refused
/// counts as a failure; anything else (including TLS errors past the TCP layer)
/// is considered reachable, since we only care about routing reachability here.
pub struct HealthChecker {
    directory: std::sync::Arc<RoutingDirectory>,
    health: std::sync::Arc<HealthMap>,
    metrics: std::sync::Arc<dyn MetricsSink>,
    interval: Duration,
    dial_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        directory: std::sync::Arc<RoutingDirectory>,
        health: std::sync::Arc<HealthMap>,
        metrics: std::sync::Arc<dyn MetricsSink>,
        settings: &Settings,
    ) -> Self {
        HealthChecker {
            directory,
            health,
            metrics,
            interval: Duration::from_secs(settings.health_check_interval_secs),
            dial_timeout: Duration::from_secs(2),
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            for tenant in self.directory.list() {
                let start = Instant::now();
                let addr = format!("{}:{}", tenant.host, tenant.port);
                let result = timeout(self.dial_timeout, TcpStream::connect(&addr)).await;
                let elapsed = start.elapsed();
                self.metrics.observe_health_check_duration(&tenant.tenant_id, elapsed);
                match result {
                    Ok(Ok(_)) => {
                        debug!(tenant = %tenant.tenant_id, "health check ok");
                        self.health.record(&tenant.tenant_id, true, None);
                    }
                    Ok(Err(e)) => {
                        warn!(tenant = %tenant.tenant_id, error = %e, "health check dial failed");
                        self.health.record(&tenant.tenant_id, false, Some(e.to_string()));
                    }
                    Err(_) => {
                        warn!(tenant = %tenant.tenant_id, "health check dial timed out");
                        self.health.record(&tenant.tenant_id, false, Some("dial timed out".to_string()));
                    }
                }
                let healthy = self.health.is_healthy(&tenant.tenant_id);
                self.metrics.set_tenant_health(&tenant.tenant_id, healthy);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tenant_is_healthy() {
        let health = HealthMap::new(3);
        assert!(health.is_healthy("ghost"));
    }

    #[test]
    fn test_flips_unhealthy_after_threshold() {
        let health = HealthMap::new(3);
        health.record("acme", false, Some("refused".to_string()));
        assert!(health.is_healthy("acme"));
        health.record("acme", false, Some("refused".to_string()));
        assert!(health.is_healthy("acme"));
        health.record("acme", false, Some("refused".to_string()));
        assert!(!health.is_healthy("acme"));
    }

    #[test]
    fn test_single_success_clears_failures() {
        let health = HealthMap::new(3);
        health.record("acme", false, Some("refused".to_string()));
        health.record("acme", false, Some("refused".to_string()));
        health.record("acme", true, None);
        assert!(health.is_healthy("acme"));
        let status = health.status_of("acme").unwrap();
        assert_eq!(status.consecutive_failures, 0);
    }
}
