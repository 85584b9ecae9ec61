pub mod mysql_session;
pub mod pg_session;

pub use pg_session::RelayContext;
