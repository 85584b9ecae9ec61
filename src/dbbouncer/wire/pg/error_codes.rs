// SQLSTATE codes the proxy itself can emit, trimmed from the full Postgres
// error code table to the ones used when synthesizing an ErrorResponse for a
// client without ever contacting a backend (admission rejects, auth failures,
// protocol violations).
pub const CONNECTION_EXCEPTION: &str = "08000";
pub const CONNECTION_FAILURE: &str = "08006";
pub const SQL_CLIENT_UNABLE_TO_ESTABLISH_SQL_CONNECTION: &str = "08001";
pub const PROTOCOL_VIOLATION: &str = "08P01";
pub const INVALID_PASSWORD: &str = "28P01";
pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000";
pub const TOO_MANY_CONNECTIONS: &str = "53300";
pub const CANNOT_CONNECT_NOW: &str = "57P03";
pub const ADMIN_SHUTDOWN: &str = "57P01";
pub const INTERNAL_ERROR: &str = "XX000";
