use std::time::Duration;

use serde::Deserialize;

use crate::dbbouncer::common::{Error, Result};

/// The wire protocol spoken by a tenant's backend database.
#[derive(Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Postgres,
    MySql,
}

/// Session pooling releases the backend only when the client disconnects.
/// Transaction pooling releases it at every transaction boundary.
#[derive(Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    Session,
    Transaction,
}

/// Pool sizing/timeout knobs that can be set globally (as [PoolDefaults]) and
/// overridden per tenant. Every field is optional in the YAML; `effective()`
/// resolves `None` against the defaults.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct PoolOverrides {
    pub min_conns: Option<u32>,
    pub max_conns: Option<u32>,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
    pub acquire_timeout_secs: Option<u64>,
    pub dial_timeout_secs: Option<u64>,
    pub pool_mode: Option<PoolMode>,
}

/// Resolved pool settings for one tenant: every field mandatory, defaults already
/// folded in.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub min_conns: u32,
    pub max_conns: u32,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
    pub dial_timeout: Duration,
    pub pool_mode: PoolMode,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PoolDefaults {
    #[serde(default = "default_min_conns")]
    pub min_conns: u32,
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_pool_mode")]
    pub pool_mode: PoolMode,
}

fn default_min_conns() -> u32 { 0 }
fn default_max_conns() -> u32 { 10 }
fn default_idle_timeout_secs() -> u64 { 600 }
fn default_max_lifetime_secs() -> u64 { 3600 }
fn default_acquire_timeout_secs() -> u64 { 10 }
fn default_dial_timeout_secs() -> u64 { 5 }
fn default_pool_mode() -> PoolMode { PoolMode::Transaction }

impl Default for PoolDefaults {
    fn default() -> Self {
        PoolDefaults {
            min_conns: default_min_conns(),
            max_conns: default_max_conns(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            pool_mode: default_pool_mode(),
        }
    }
}

impl PoolDefaults {
    pub fn resolve(&self, overrides: &PoolOverrides) -> PoolSettings {
        PoolSettings {
            min_conns: overrides.min_conns.unwrap_or(self.min_conns),
            max_conns: overrides.max_conns.unwrap_or(self.max_conns),
            idle_timeout: Duration::from_secs(overrides.idle_timeout_secs.unwrap_or(self.idle_timeout_secs)),
            max_lifetime: Duration::from_secs(overrides.max_lifetime_secs.unwrap_or(self.max_lifetime_secs)),
            acquire_timeout: Duration::from_secs(overrides.acquire_timeout_secs.unwrap_or(self.acquire_timeout_secs)),
            dial_timeout: Duration::from_secs(overrides.dial_timeout_secs.unwrap_or(self.dial_timeout_secs)),
            pool_mode: overrides.pool_mode.unwrap_or(self.pool_mode),
        }
    }
}

/// Configuration for a single tenant, as loaded from the routing directory's backing
/// YAML (or, at runtime, added by `RoutingDirectory::add`).
#[derive(Deserialize, Debug, Clone)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub db_kind: DbKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub pool: PoolOverrides,
}

impl TenantConfig {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_tenant_id(&self.tenant_id) {
            return Err(Error::config_invalid(format!("invalid tenant id {:?}", self.tenant_id)));
        }
        if self.host.is_empty() {
            return Err(Error::config_invalid(format!("tenant {} has no host", self.tenant_id)));
        }
        if self.port == 0 {
            return Err(Error::config_invalid(format!("tenant {} has port 0", self.tenant_id)));
        }
        if let (Some(min), Some(max)) = (self.pool.min_conns, self.pool.max_conns) {
            if min > max {
                return Err(Error::config_invalid(format!(
                    "tenant {} has min_conns {} > max_conns {}", self.tenant_id, min, max
                )));
            }
        }
        Ok(())
    }
}

/// Tenant ids are short stable strings: `[A-Za-z0-9][A-Za-z0-9_-]{0,62}`.
pub fn is_valid_tenant_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 63 {
        return false;
    }
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_tenant_id() {
        assert!(is_valid_tenant_id("acme"));
        assert!(is_valid_tenant_id("acme-corp_1"));
        assert!(!is_valid_tenant_id(""));
        assert!(!is_valid_tenant_id("-acme"));
        assert!(!is_valid_tenant_id("acme corp"));
        assert!(!is_valid_tenant_id(&"a".repeat(64)));
    }

    #[test]
    fn test_resolve_overrides() {
        let defaults = PoolDefaults::default();
        let overrides = PoolOverrides { max_conns: Some(42), ..Default::default() };
        let resolved = defaults.resolve(&overrides);
        assert_eq!(resolved.max_conns, 42);
        assert_eq!(resolved.min_conns, defaults.min_conns);
    }
}
