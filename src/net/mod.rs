//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Lifecycle serve
//!     → registry.rs (launch every registered Server concurrently)
//!     → http/ (accept loop, middleware chain, handler)
//!     → inflight.rs (track each request until it completes)
//!
//! Lifecycle drain:
//!     → registry.rs (drain every Server concurrently, wait for all)
//!     → Server: Up → Drain, wait for in-flight, stop accepting, Down
//!
//! Messaging (pubsub/, stream/):
//!     publish → channel queue → worker job → subscriber handler
//! ```
//!
//! # Design Decisions
//! - One server per bind address; duplicates are programming errors
//! - Each server owns its own down/up/drain state
//! - Drain is cooperative: in-flight work always finishes

pub mod http;
pub mod inflight;
pub(crate) mod inmem;
pub mod pubsub;
pub mod registry;
pub mod state;
pub mod stream;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Ctx;

pub use inflight::{InflightGuard, InflightTracker};
pub use registry::TransportRegistry;
pub use state::{State, StateCell};

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("transport registry is empty")]
    EmptyRegistry,
    #[error("failed to bind <{addr}>: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server <{addr}> failed: {source}")]
    Serve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server is already serving")]
    AlreadyServing,
}

/// An inbound transport.
#[async_trait]
pub trait Server: Send + Sync {
    /// Bind `addr` and serve until drained or until `ctx` is cancelled.
    async fn serve(&self, ctx: Ctx, addr: String) -> Result<(), NetError>;

    /// Stop accepting new work and return once in-flight work completed.
    async fn drain(&self);
}
