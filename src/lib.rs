//! Runtime spine for multi-protocol service hosts.
//!
//! Coordinates process startup and shutdown, carries a causally ordered
//! request identity (`Transit`) and a key/value payload (`Shipments`)
//! across task and process boundaries, and drains every concurrent
//! subsystem gracefully.

pub mod bg;
pub mod cache;
pub mod config;
pub mod context;
pub mod disco;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod schedule;

/// Boxed error used at adapter and handler seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::ConfigTree;
pub use context::{Ctx, Shipments, Stepper, Transit};
pub use lifecycle::{Adapters, App, ServiceRegistration};
pub use net::http::{HttpClient, HttpServer};
