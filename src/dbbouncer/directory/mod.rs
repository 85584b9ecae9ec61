use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::config::{PoolDefaults, Settings, TenantConfig};

/// An immutable point-in-time view of the tenant map. Readers get a strongly
/// consistent (tenant map, paused set, defaults) triple without taking a lock;
/// writers publish a brand new snapshot via [RoutingDirectory::swap].
struct Snapshot {
    tenants: HashMap<String, Arc<TenantConfig>>,
    paused: HashSet<String>,
    defaults: PoolDefaults,
}

impl Snapshot {
    fn from_settings(settings: &Settings) -> Self {
        let mut tenants = HashMap::with_capacity(settings.tenants.len());
        for tenant in &settings.tenants {
            tenants.insert(tenant.tenant_id.clone(), Arc::new(tenant.clone()));
        }
        Snapshot { tenants, paused: HashSet::new(), defaults: settings.pool_defaults.clone() }
    }
}

/// Lock-free routing table mapping tenant ids to their backend configuration.
/// Readers (the accept path, on every incoming connection) never block behind
/// writers (config reload, admin pause/resume); see the atomic-snapshot design
/// note in the component design doc.
pub struct RoutingDirectory {
    inner: ArcSwap<Snapshot>,
}

impl RoutingDirectory {
    pub fn new(settings: &Settings) -> Self {
        RoutingDirectory { inner: ArcSwap::from_pointee(Snapshot::from_settings(settings)) }
    }

    /// Look up a tenant's backend config. Returns `None` for an unknown tenant.
    pub fn resolve(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        self.inner.load().tenants.get(tenant_id).cloned()
    }

    pub fn is_paused(&self, tenant_id: &str) -> bool {
        self.inner.load().paused.contains(tenant_id)
    }

    pub fn list(&self) -> Vec<Arc<TenantConfig>> {
        self.inner.load().tenants.values().cloned().collect()
    }

    pub fn defaults(&self) -> PoolDefaults {
        self.inner.load().defaults.clone()
    }

    pub fn add(&self, tenant: TenantConfig) -> Result<()> {
        tenant.validate()?;
        self.rcu(|snap| {
            let mut tenants = snap.tenants.clone();
            tenants.insert(tenant.tenant_id.clone(), Arc::new(tenant.clone()));
            Snapshot { tenants, paused: snap.paused.clone(), defaults: snap.defaults.clone() }
        });
        Ok(())
    }

    pub fn remove(&self, tenant_id: &str) -> Result<()> {
        if self.resolve(tenant_id).is_none() {
            return Err(Error::admission(format!("unknown tenant {:?}", tenant_id)));
        }
        self.rcu(|snap| {
            let mut tenants = snap.tenants.clone();
            tenants.remove(tenant_id);
            let mut paused = snap.paused.clone();
            paused.remove(tenant_id);
            Snapshot { tenants, paused, defaults: snap.defaults.clone() }
        });
        Ok(())
    }

    pub fn pause(&self, tenant_id: &str) -> Result<()> {
        if self.resolve(tenant_id).is_none() {
            return Err(Error::admission(format!("unknown tenant {:?}", tenant_id)));
        }
        self.rcu(|snap| {
            let mut paused = snap.paused.clone();
            paused.insert(tenant_id.to_string());
            Snapshot { tenants: snap.tenants.clone(), paused, defaults: snap.defaults.clone() }
        });
        Ok(())
    }

    pub fn resume(&self, tenant_id: &str) -> Result<()> {
        if self.resolve(tenant_id).is_none() {
            return Err(Error::admission(format!("unknown tenant {:?}", tenant_id)));
        }
        self.rcu(|snap| {
            let mut paused = snap.paused.clone();
            paused.remove(tenant_id);
            Snapshot { tenants: snap.tenants.clone(), paused, defaults: snap.defaults.clone() }
        });
        Ok(())
    }

    /// Replace the whole tenant map from a freshly reloaded config file.
    /// Pause state is preserved for tenants that still exist; tenants that
    /// disappeared from the file lose their pause flag along with everything
    /// else about them (resolved per the open question on reload semantics).
    pub fn reload(&self, settings: &Settings) {
        self.rcu(|snap| {
            let mut next = Snapshot::from_settings(settings);
            next.paused = snap.paused.intersection(&next.tenants.keys().cloned().collect()).cloned().collect();
            next
        });
        info!("routing directory reloaded");
    }

    fn rcu(&self, f: impl Fn(&Snapshot) -> Snapshot) {
        self.inner.rcu(|cur| Arc::new(f(cur)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbbouncer::config::{DbKind, PoolOverrides};

    fn tenant(id: &str) -> TenantConfig {
        TenantConfig {
            tenant_id: id.to_string(),
            db_kind: DbKind::Postgres,
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "db".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            pool: PoolOverrides::default(),
        }
    }

    fn settings_with(tenants: Vec<TenantConfig>) -> Settings {
        Settings {
            host: "0.0.0.0".to_string(),
            pg_port: 6432,
            mysql_port: 3307,
            api_host: "127.0.0.1".to_string(),
            api_port: 8080,
            tls: Default::default(),
            max_proxy_connections: 0,
            shutdown_timeout_secs: 60,
            health_check_interval_secs: 10,
            unhealthy_threshold: 3,
            idle_reap_interval_secs: 30,
            stats_interval_secs: 15,
            config_reload_debounce_ms: 500,
            pool_defaults: PoolDefaults::default(),
            tenants,
        }
    }

    #[test]
    fn test_resolve_and_add() {
        let dir = RoutingDirectory::new(&settings_with(vec![tenant("acme")]));
        assert!(dir.resolve("acme").is_some());
        assert!(dir.resolve("other").is_none());
        dir.add(tenant("other")).unwrap();
        assert!(dir.resolve("other").is_some());
    }

    #[test]
    fn test_pause_resume() {
        let dir = RoutingDirectory::new(&settings_with(vec![tenant("acme")]));
        assert!(!dir.is_paused("acme"));
        dir.pause("acme").unwrap();
        assert!(dir.is_paused("acme"));
        dir.resume("acme").unwrap();
        assert!(!dir.is_paused("acme"));
    }

    #[test]
    fn test_pause_unknown_tenant_errors() {
        let dir = RoutingDirectory::new(&settings_with(vec![]));
        assert!(dir.pause("ghost").is_err());
    }

    #[test]
    fn test_reload_preserves_pause_for_surviving_tenant() {
        let dir = RoutingDirectory::new(&settings_with(vec![tenant("acme"), tenant("widgets")]));
        dir.pause("acme").unwrap();
        dir.reload(&settings_with(vec![tenant("acme")]));
        assert!(dir.is_paused("acme"));
        assert!(dir.resolve("widgets").is_none());
    }
}
