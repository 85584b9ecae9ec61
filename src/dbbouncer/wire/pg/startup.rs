use std::collections::HashMap;

use crate::dbbouncer::common::{split_tenant_prefix, tenant_id_from_options};

/// Work out which tenant a PG client's startup parameters are for, per the
/// priority order in the component design doc: an explicit `tenant_id`
/// startup parameter, then `-c tenant_id=...`/`tenant_id=...` inside
/// `options`, then a `user`/`database` value of the form `tenant__realuser`.
/// Returns the tenant id and the real username/database to hand to the
/// backend once resolved.
pub struct StartupIdentity {
    pub tenant_id: String,
    pub username: String,
    pub database: String,
}

pub fn resolve_tenant_identity(params: &HashMap<String, String>) -> Option<StartupIdentity> {
    let username = params.get("user").cloned().unwrap_or_default();
    let database = params.get("database").cloned().unwrap_or_else(|| username.clone());

    if let Some(tenant_id) = params.get("tenant_id") {
        return Some(StartupIdentity { tenant_id: tenant_id.clone(), username, database });
    }

    if let Some(options) = params.get("options") {
        if let Some(tenant_id) = tenant_id_from_options(options) {
            return Some(StartupIdentity { tenant_id, username, database });
        }
    }

    if let Some((tenant_id, real_user)) = split_tenant_prefix(&username) {
        return Some(StartupIdentity { tenant_id: tenant_id.to_string(), username: real_user.to_string(), database });
    }

    if let Some((tenant_id, real_db)) = split_tenant_prefix(&database) {
        return Some(StartupIdentity { tenant_id: tenant_id.to_string(), username, database: real_db.to_string() });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_direct_tenant_id_param() {
        let id = resolve_tenant_identity(&params(&[("user", "alice"), ("tenant_id", "acme")])).unwrap();
        assert_eq!(id.tenant_id, "acme");
        assert_eq!(id.username, "alice");
    }

    #[test]
    fn test_options_tenant_id() {
        let id = resolve_tenant_identity(&params(&[("user", "alice"), ("options", "-c tenant_id=acme")])).unwrap();
        assert_eq!(id.tenant_id, "acme");
    }

    #[test]
    fn test_username_prefix_fallback() {
        let id = resolve_tenant_identity(&params(&[("user", "acme__alice")])).unwrap();
        assert_eq!(id.tenant_id, "acme");
        assert_eq!(id.username, "alice");
    }

    #[test]
    fn test_no_tenant_found() {
        assert!(resolve_tenant_identity(&params(&[("user", "alice")])).is_none());
    }
}
