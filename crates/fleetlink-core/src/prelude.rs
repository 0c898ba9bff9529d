/*!
 * Prelude module for FleetLink Core.
 *
 * Re-exports the types and helpers most FleetLink code needs.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{now, Details, Id, Timestamp};

pub use crate::config::{Config, ConfigBuilder, SharedConfig, TransportConfig};

pub use crate::utils::{elapsed_millis, with_timeout, Deadline, Expiry};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::{init, init_with_config};
