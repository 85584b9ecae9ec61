pub mod auth;
pub mod codec;
pub mod error_codes;
pub mod scram;
pub mod startup;
pub mod tag;

pub use auth::{authenticate_backend, hash_md5_password, BackendAuthResult};
pub use codec::{read_message, read_startup, write_message, write_raw, Message, StartupRequest};
pub use startup::{resolve_tenant_identity, StartupIdentity};
