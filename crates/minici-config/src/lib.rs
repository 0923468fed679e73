//! KDL configuration for the minici build service.
//!
//! The server reads one KDL file (optional) and then applies environment
//! overrides, see [`SystemConfig::load`].

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{BuildsConfig, DatabaseConfig, ServerConfig, StorageConfig, SystemConfig};
