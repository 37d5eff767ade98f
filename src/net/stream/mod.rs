//! At-least-once message streams.
//!
//! # Data Flow
//! ```text
//! publish(ctx, channel, data)
//!     → middleware.rs (recover → log → stats → trace)
//!     → inmem.rs (channel queue → worker job)
//!     → subscriber handler → Ok: acknowledged / Err: redelivered
//! ```
//!
//! # Design Decisions
//! - Unlike pub/sub, handlers report failure; a failed delivery is retried
//!   up to the subscription's redelivery limit
//! - Every subscription hands back an explicit [`Subscription`] handle

pub mod inmem;
pub mod middleware;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::bg::TaskError;
use crate::context::Ctx;
use crate::net::inmem::BusError;
use crate::BoxError;

pub use inmem::{InmemConfig, InmemStream};

/// Redeliveries attempted after a failed delivery unless overridden.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;

/// Subscriber callback; `Err` asks for redelivery.
pub type MsgHandler = Arc<dyn Fn(Ctx, Vec<u8>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Box an async closure into a [`MsgHandler`].
pub fn handler<F, Fut>(f: F) -> MsgHandler
where
    F: Fn(Ctx, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, data| Box::pin(f(ctx, data)))
}

/// Error type for stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is down or draining")]
    Draining,
    #[error("cannot dispatch channel worker: {0}")]
    Dispatch(#[from] TaskError),
    #[error("durable subscription <{name}> already active on <{channel}>")]
    DurableInUse { channel: String, name: String },
}

impl From<BusError> for StreamError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Draining => StreamError::Draining,
            BusError::Dispatch(e) => StreamError::Dispatch(e),
        }
    }
}

/// Per-subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOption {
    /// Name the subscription; only one subscription per name and channel
    /// may be active at a time.
    Durable(String),
    /// Redeliveries after the first failed delivery.
    MaxRedeliveries(u32),
}

/// Handle returned by [`Stream::subscribe`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Stop deliveries to this subscription.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Stream capability.
#[async_trait]
pub trait Stream: Send + Sync {
    async fn start(&self, ctx: &Ctx) -> Result<(), StreamError>;

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), StreamError>;

    fn subscribe(
        &self,
        queue: &str,
        channel: &str,
        handler: MsgHandler,
        opts: &[SubscriptionOption],
    ) -> Result<Subscription, StreamError>;

    async fn drain(&self);

    async fn close(&self) -> Result<(), StreamError>;
}

/// Stream that drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopStream;

#[async_trait]
impl Stream for NopStream {
    async fn start(&self, _: &Ctx) -> Result<(), StreamError> {
        Ok(())
    }

    async fn publish(&self, _: &Ctx, _: &str, _: Vec<u8>) -> Result<(), StreamError> {
        Ok(())
    }

    fn subscribe(
        &self,
        _: &str,
        _: &str,
        _: MsgHandler,
        _: &[SubscriptionOption],
    ) -> Result<Subscription, StreamError> {
        Ok(Subscription::detached())
    }

    async fn drain(&self) {}

    async fn close(&self) -> Result<(), StreamError> {
        Ok(())
    }
}
