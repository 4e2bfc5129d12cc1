//! Configuration subsystem.
//!
//! # Responsibilities
//! - Define the configuration schema
//! - Load configuration from TOML files
//! - Validate semantic correctness

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{default_config, GatewayConfig, HttpServerOptions};
pub use validation::{validate_config, ValidationError};
