mod errors;
mod coarse_clock;
mod util;

pub use self::errors::{Error, ErrorKind, PoolErrorKind, Result};
pub use self::coarse_clock::{coarse_monotonic_now, coarse_monotonic_clock_updater};
pub use self::util::{escape_scram_name, split_tenant_prefix, split_options_tokens, tenant_id_from_options};
