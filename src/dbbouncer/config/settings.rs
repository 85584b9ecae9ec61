use std::path::PathBuf;

use serde::Deserialize;

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::config::tenant::{PoolDefaults, TenantConfig};

#[derive(Deserialize, Debug, Clone)]
pub struct TlsSettings {
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl TlsSettings {
    pub fn enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings { cert_path: None, key_path: None }
    }
}

/// Top-level proxy settings: everything except the tenant map itself, which lives in
/// the routing directory (see `dbbouncer::directory`) so it can be hot-reloaded and
/// mutated independently of the rest of the process configuration.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub pg_port: u16,
    #[serde(default = "default_mysql_port")]
    pub mysql_port: u16,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub tls: TlsSettings,
    /// Global cap on proxy-accepted client connections, across both protocols. 0 disables the cap.
    #[serde(default = "default_max_proxy_connections")]
    pub max_proxy_connections: u32,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_idle_reap_interval_secs")]
    pub idle_reap_interval_secs: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_config_reload_debounce_ms")]
    pub config_reload_debounce_ms: u64,
    #[serde(default)]
    pub pool_defaults: PoolDefaults,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_pg_port() -> u16 { 6432 }
fn default_mysql_port() -> u16 { 3307 }
fn default_api_host() -> String { "127.0.0.1".to_string() }
fn default_api_port() -> u16 { 8080 }
const fn default_max_proxy_connections() -> u32 { 0 }
const fn default_shutdown_timeout_secs() -> u64 { 60 }
const fn default_health_check_interval_secs() -> u64 { 10 }
const fn default_unhealthy_threshold() -> u32 { 3 }
const fn default_idle_reap_interval_secs() -> u64 { 30 }
const fn default_stats_interval_secs() -> u64 { 15 }
const fn default_config_reload_debounce_ms() -> u64 { 500 }

/// Backlog depth for the PG/MySQL listen sockets, matching the teacher's default.
pub const LISTEN_BACKLOG: u32 = 1024;

/// How long `TenantPool::drain` waits for active connections to return before
/// force-closing them.
pub const DRAIN_TIMEOUT_SECS: u64 = 30;
pub const DRAIN_POLL_MILLIS: u64 = 100;

/// Maximum number of SSL negotiation attempts per PG session before failing it.
pub const MAX_SSL_ATTEMPTS: u32 = 3;

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.pg_port == 0 && self.mysql_port == 0 {
            return Err(Error::config_invalid("at least one of pg_port/mysql_port must be non-zero"));
        }
        if self.pg_port != 0 && self.pg_port == self.mysql_port {
            return Err(Error::config_invalid("pg_port and mysql_port must differ"));
        }
        for tenant in &self.tenants {
            tenant.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for tenant in &self.tenants {
            if !seen.insert(tenant.tenant_id.as_str()) {
                return Err(Error::config_invalid(format!("duplicate tenant id {:?}", tenant.tenant_id)));
            }
        }
        Ok(())
    }

    pub fn listen_address_pg(&self) -> String {
        format!("{}:{}", self.host, self.pg_port)
    }

    pub fn listen_address_mysql(&self) -> String {
        format!("{}:{}", self.host, self.mysql_port)
    }

    pub fn listen_address_api(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}
