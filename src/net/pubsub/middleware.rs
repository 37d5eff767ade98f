//! Pub/sub decorators.
//!
//! Each decorator wraps another [`PubSub`] and adds one concern on both
//! sides: around `publish` and around every delivered message.
//! [`decorate`] composes them as `Recover(Log(Stats(Trace(adapter))))`, so
//! panic recovery sees faults raised by every inner layer.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::context::Ctx;
use crate::net::pubsub::{MsgHandler, PubSub, PubSubError};
use crate::observability::{field, tags};

/// Wrap `adapter` in the full decorator chain.
pub fn decorate(adapter: Arc<dyn PubSub>) -> Arc<dyn PubSub> {
    let traced = Arc::new(Trace(adapter));
    let counted = Arc::new(Stats(traced));
    let logged = Arc::new(Log(counted));
    Arc::new(Recover(logged))
}

/// One tracer span per publish and per delivery.
pub struct Trace(pub Arc<dyn PubSub>);

#[async_trait]
impl PubSub for Trace {
    async fn start(&self, ctx: &Ctx) -> Result<(), PubSubError> {
        self.0.start(ctx).await
    }

    async fn drain(&self) {
        self.0.drain().await
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.0.close().await
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        let mut span = ctx.tracer().start_span(ctx, &format!("Pub {channel}"));
        span.set_tag("pubsub.channel", channel);
        let result = self.0.publish(ctx, channel, data).await;
        if let Err(e) = &result {
            span.log_field("error", &e.to_string());
        }
        span.finish();
        result
    }

    fn subscribe(&self, queue: &str, channel: &str, handler: MsgHandler) -> Result<(), PubSubError> {
        let operation = format!("Sub {channel}");
        let queue_tag = queue.to_string();
        let wrapped: MsgHandler = Arc::new(move |ctx: Ctx, data| {
            let handler = handler.clone();
            let operation = operation.clone();
            let queue = queue_tag.clone();
            Box::pin(async move {
                let mut span = ctx.tracer().start_span(&ctx, &operation);
                span.set_tag("pubsub.queue", &queue);
                handler(ctx, data).await;
                span.finish();
            })
        });
        self.0.subscribe(queue, channel, wrapped)
    }
}

/// Publish and delivery counters, delivery latency, concurrent deliveries.
pub struct Stats(pub Arc<dyn PubSub>);

#[async_trait]
impl PubSub for Stats {
    async fn start(&self, ctx: &Ctx) -> Result<(), PubSubError> {
        self.0.start(ctx).await
    }

    async fn drain(&self) {
        self.0.drain().await
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.0.close().await
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        let result = self.0.publish(ctx, channel, data).await;
        let outcome = if result.is_ok() { "ok" } else { "err" };
        ctx.stats()
            .inc("pubsub.publish", &tags([("channel", channel), ("outcome", outcome)]));
        result
    }

    fn subscribe(&self, queue: &str, channel: &str, handler: MsgHandler) -> Result<(), PubSubError> {
        let channel_tag = channel.to_string();
        let concurrent = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let wrapped: MsgHandler = Arc::new(move |ctx: Ctx, data| {
            let handler = handler.clone();
            let channel = channel_tag.clone();
            let concurrent = concurrent.clone();
            Box::pin(async move {
                let t = tags([("channel", channel.as_str())]);
                let now = concurrent.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                ctx.stats().gauge("pubsub.conc", now as f64, &t);
                let started = Instant::now();

                handler(ctx.clone(), data).await;

                ctx.stats().inc("pubsub.call", &t);
                ctx.stats().timing("pubsub.time", started.elapsed(), &t);
                let now = concurrent.fetch_sub(1, std::sync::atomic::Ordering::Relaxed) - 1;
                ctx.stats().gauge("pubsub.conc", now as f64, &t);
            })
        });
        self.0.subscribe(queue, channel, wrapped)
    }
}

/// Log publish outcomes and delivery start/end through the Logger.
pub struct Log(pub Arc<dyn PubSub>);

#[async_trait]
impl PubSub for Log {
    async fn start(&self, ctx: &Ctx) -> Result<(), PubSubError> {
        self.0.start(ctx).await
    }

    async fn drain(&self) {
        self.0.drain().await
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.0.close().await
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        let size = data.len();
        let result = self.0.publish(ctx, channel, data).await;
        let transit = ctx.transit().map(|t| t.id().to_string()).unwrap_or_default();
        match &result {
            Ok(()) => ctx.logger().trace(
                "pubsub.publish.ok",
                "published",
                &[field("channel", channel), field("bytes", size), field("transit", &transit)],
            ),
            Err(e) => ctx.logger().error(
                "pubsub.publish.err",
                "publish failed",
                &[field("channel", channel), field("error", e), field("transit", &transit)],
            ),
        }
        result
    }

    fn subscribe(&self, queue: &str, channel: &str, handler: MsgHandler) -> Result<(), PubSubError> {
        let channel_tag = channel.to_string();
        let queue_tag = queue.to_string();
        let wrapped: MsgHandler = Arc::new(move |ctx: Ctx, data| {
            let handler = handler.clone();
            let channel = channel_tag.clone();
            let queue = queue_tag.clone();
            Box::pin(async move {
                let logger = ctx.logger().with(vec![
                    field("channel", &channel),
                    field("queue", &queue),
                    field("transit", ctx.transit().map(|t| t.id()).unwrap_or_default()),
                ]);
                let started = Instant::now();
                logger.trace("pubsub.req.start", "delivering", &[]);
                handler(ctx, data).await;
                logger.trace(
                    "pubsub.req.end",
                    "delivered",
                    &[field("elapsed_ms", started.elapsed().as_millis())],
                );
            })
        });
        self.0.subscribe(queue, channel, wrapped)
    }
}

/// Contain subscriber panics to the message being delivered.
pub struct Recover(pub Arc<dyn PubSub>);

#[async_trait]
impl PubSub for Recover {
    async fn start(&self, ctx: &Ctx) -> Result<(), PubSubError> {
        self.0.start(ctx).await
    }

    async fn drain(&self) {
        self.0.drain().await
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.0.close().await
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        self.0.publish(ctx, channel, data).await
    }

    fn subscribe(&self, queue: &str, channel: &str, handler: MsgHandler) -> Result<(), PubSubError> {
        let channel_tag = channel.to_string();
        let wrapped: MsgHandler = Arc::new(move |ctx: Ctx, data| {
            let handler = handler.clone();
            let channel = channel_tag.clone();
            Box::pin(async move {
                if let Err(panic) = AssertUnwindSafe(handler(ctx.clone(), data)).catch_unwind().await {
                    let message = crate::bg::panic_message(panic.as_ref());
                    ctx.logger().error(
                        "pubsub.panic",
                        "subscriber panicked",
                        &[field("channel", &channel), field("panic", &message)],
                    );
                    ctx.stats().inc("pubsub.panic", &tags([("channel", channel.as_str())]));
                }
            })
        });
        self.0.subscribe(queue, channel, wrapped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::net::pubsub::{handler, InmemConfig, InmemPubSub};

    #[tokio::test]
    async fn recover_keeps_the_channel_alive() {
        let ctx = Ctx::background();
        let pubsub = decorate(Arc::new(InmemPubSub::new(InmemConfig::default())));
        pubsub.start(&ctx).await.unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();
        pubsub
            .subscribe(
                "",
                "jobs",
                handler(move |_, data: Vec<u8>| {
                    let seen = seen.clone();
                    async move {
                        if data == b"boom" {
                            panic!("bad message");
                        }
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        pubsub.publish(&ctx, "jobs", b"boom".to_vec()).await.unwrap();
        pubsub.publish(&ctx, "jobs", b"ok".to_vec()).await.unwrap();
        pubsub.drain().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
