//! Service discovery.
//!
//! # Data Flow
//! ```text
//! App::register_service → agent.register(registration) → handle id
//! App shutdown          → agent.leave() (every registration of this agent)
//!
//! agent.service(name, tags) → ServiceHandle
//!     → watch() → Watcher
//!         → next(): current membership on first call, then every change
//!         → lagging feed: resync from the current membership
//!         → severed feed: reconnect with jittered backoff
//! ```
//!
//! # Design Decisions
//! - A watch is lazy: nothing is subscribed until the first `next()`
//! - Closing a service handle ends every watcher created from it

pub mod local;
pub mod watch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::Ctx;

pub use local::{Catalog, LocalAgent};
pub use watch::{ServiceHandle, Watcher};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoError {
    #[error("service handle closed")]
    Closed,
    #[error("discovery feed unavailable: {0}")]
    Unavailable(String),
    #[error("registration for <{0}> has no name")]
    InvalidRegistration(String),
}

/// A service instance announced to discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A registered instance as seen by watchers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl Instance {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Discovery agent capability.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Announce `registration`; returns its handle id.
    async fn register(&self, ctx: &Ctx, registration: Registration) -> Result<String, DiscoError>;

    /// Withdraw one registration made by this agent.
    async fn deregister(&self, ctx: &Ctx, id: &str) -> Result<(), DiscoError>;

    /// Withdraw every registration made by this agent.
    async fn leave(&self, ctx: &Ctx);

    /// Watchable view over instances of `name` carrying every tag in `tags`.
    fn service(&self, name: &str, tags: &[String]) -> Result<ServiceHandle, DiscoError>;
}
