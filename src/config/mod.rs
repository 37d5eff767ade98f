//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, path from --config or CONFIG_URI)
//!     → loader.rs (read & parse)
//!     → tree.rs (ConfigTree, $ENV expansion)
//!     → schema.rs (CoreConfig: node, version, [request])
//!     → validation.rs (semantic checks)
//!     → adapter subtrees handed to lifecycle::adapters
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - An empty subsystem subtree selects that subsystem's no-op adapter

pub mod loader;
pub mod schema;
pub mod tree;
pub mod validation;

pub use loader::{ConfigError, CONFIG_URI};
pub use schema::{CoreConfig, RequestConfig};
pub use tree::ConfigTree;
pub use validation::{validate_config, ValidationError};
