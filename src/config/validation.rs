//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (node name present, body limit > 0)
//! - Detect ambiguous adapter selection (two adapters under one subsystem)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: (tree, core) → Result<(), Vec<ValidationError>>
//! - Runs before any subsystem is constructed

use std::fmt;

use crate::config::schema::CoreConfig;
use crate::config::tree::ConfigTree;

/// Subsystem subtrees whose first key selects an adapter.
pub const ADAPTER_SUBSYSTEMS: [&str; 8] = [
    "log",
    "stats",
    "tracing",
    "disco",
    "schedule",
    "cache",
    "net.pubsub",
    "net.stream",
];

/// A single semantic problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a loaded tree and its core section.
pub fn validate_config(tree: &ConfigTree, core: &CoreConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if core.node.trim().is_empty() {
        errors.push(ValidationError {
            field: "node".into(),
            message: "must not be empty".into(),
        });
    }
    if core.request.max_body_bytes == 0 {
        errors.push(ValidationError {
            field: "request.max_body_bytes".into(),
            message: "must be greater than zero".into(),
        });
    }
    for subsystem in ADAPTER_SUBSYSTEMS {
        let keys = tree.get(subsystem).keys();
        if keys.len() > 1 {
            errors.push(ValidationError {
                field: subsystem.into(),
                message: format!("selects more than one adapter: {}", keys.join(", ")),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
