//! Fire-and-forget publish/subscribe.
//!
//! # Data Flow
//! ```text
//! publish(ctx, channel, data)
//!     → middleware.rs (recover → log → stats → trace)
//!     → inmem.rs (channel queue → worker job)
//!     → subscriber handler (Ctx carrying the publisher's transit and shipments)
//! ```
//!
//! # Design Decisions
//! - Handlers return nothing; a failing handler is the handler's problem
//! - Adapters are selected by the first key under `[net.pubsub]`

pub mod inmem;
pub mod middleware;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::bg::TaskError;
use crate::context::Ctx;
use crate::net::inmem::BusError;

pub use inmem::{InmemConfig, InmemPubSub};

/// Subscriber callback.
pub type MsgHandler = Arc<dyn Fn(Ctx, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into a [`MsgHandler`].
pub fn handler<F, Fut>(f: F) -> MsgHandler
where
    F: Fn(Ctx, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, data| Box::pin(f(ctx, data)))
}

/// Error type for pub/sub operations.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("pubsub is down or draining")]
    Draining,
    #[error("cannot dispatch channel worker: {0}")]
    Dispatch(#[from] TaskError),
}

impl From<BusError> for PubSubError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Draining => PubSubError::Draining,
            BusError::Dispatch(e) => PubSubError::Dispatch(e),
        }
    }
}

/// Pub/sub capability.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn start(&self, ctx: &Ctx) -> Result<(), PubSubError>;

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), PubSubError>;

    /// Deliver messages on `channel` to `handler`. Subscribers sharing a
    /// non-empty `queue` split the messages between them.
    fn subscribe(&self, queue: &str, channel: &str, handler: MsgHandler) -> Result<(), PubSubError>;

    /// Refuse new publishes and deliver everything already queued.
    async fn drain(&self);

    /// Stop delivering immediately.
    async fn close(&self) -> Result<(), PubSubError>;
}

/// Pub/sub that drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopPubSub;

#[async_trait]
impl PubSub for NopPubSub {
    async fn start(&self, _: &Ctx) -> Result<(), PubSubError> {
        Ok(())
    }

    async fn publish(&self, _: &Ctx, _: &str, _: Vec<u8>) -> Result<(), PubSubError> {
        Ok(())
    }

    fn subscribe(&self, _: &str, _: &str, _: MsgHandler) -> Result<(), PubSubError> {
        Ok(())
    }

    async fn drain(&self) {}

    async fn close(&self) -> Result<(), PubSubError> {
        Ok(())
    }
}
