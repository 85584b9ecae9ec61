pub mod load;
pub mod settings;
pub mod tenant;

pub use load::load_config;
pub use settings::{Settings, TlsSettings, DRAIN_POLL_MILLIS, DRAIN_TIMEOUT_SECS, LISTEN_BACKLOG, MAX_SSL_ATTEMPTS};
pub use tenant::{is_valid_tenant_id, DbKind, PoolDefaults, PoolMode, PoolOverrides, PoolSettings, TenantConfig};
