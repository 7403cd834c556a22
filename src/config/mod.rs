//! Configuration schema and loading.

pub mod load;
pub mod schema;

pub use load::{load, load_or_default, parse_service_line, parse_services, ConfigError};
pub use schema::{AdaptationConfig, Config, LogFormat, LoggingConfig, SharedMemConfig};
