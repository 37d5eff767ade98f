//! Stream decorators, composed as `Recover(Log(Stats(Trace(adapter))))`.
//!
//! A recovered panic is reported to the adapter as a failed delivery, so
//! it is redelivered like any other error.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::context::Ctx;
use crate::net::stream::{MsgHandler, Stream, StreamError, Subscription, SubscriptionOption};
use crate::observability::{field, tags};

/// Wrap `adapter` in the full decorator chain.
pub fn decorate(adapter: Arc<dyn Stream>) -> Arc<dyn Stream> {
    let traced = Arc::new(Trace(adapter));
    let counted = Arc::new(Stats(traced));
    let logged = Arc::new(Log(counted));
    Arc::new(Recover(logged))
}

pub struct Trace(pub Arc<dyn Stream>);

#[async_trait]
impl Stream for Trace {
    async fn start(&self, ctx: &Ctx) -> Result<(), StreamError> {
        self.0.start(ctx).await
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), StreamError> {
        let mut span = ctx.tracer().start_span(ctx, &format!("Pub {channel}"));
        span.set_tag("stream.channel", channel);
        let result = self.0.publish(ctx, channel, data).await;
        if let Err(e) = &result {
            span.log_field("error", &e.to_string());
        }
        span.finish();
        result
    }

    fn subscribe(
        &self,
        queue: &str,
        channel: &str,
        handler: MsgHandler,
        opts: &[SubscriptionOption],
    ) -> Result<Subscription, StreamError> {
        let operation = format!("Sub {channel}");
        let wrapped: MsgHandler = Arc::new(move |ctx: Ctx, data| {
            let handler = handler.clone();
            let operation = operation.clone();
            Box::pin(async move {
                let mut span = ctx.tracer().start_span(&ctx, &operation);
                let result = handler(ctx, data).await;
                if let Err(e) = &result {
                    span.log_field("error", &e.to_string());
                }
                span.finish();
                result
            })
        });
        self.0.subscribe(queue, channel, wrapped, opts)
    }

    async fn drain(&self) {
        self.0.drain().await
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.0.close().await
    }
}

pub struct Stats(pub Arc<dyn Stream>);

#[async_trait]
impl Stream for Stats {
    async fn start(&self, ctx: &Ctx) -> Result<(), StreamError> {
        self.0.start(ctx).await
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), StreamError> {
        let result = self.0.publish(ctx, channel, data).await;
        let outcome = if result.is_ok() { "ok" } else { "err" };
        ctx.stats()
            .inc("stream.publish", &tags([("channel", channel), ("outcome", outcome)]));
        result
    }

    fn subscribe(
        &self,
        queue: &str,
        channel: &str,
        handler: MsgHandler,
        opts: &[SubscriptionOption],
    ) -> Result<Subscription, StreamError> {
        let channel_tag = channel.to_string();
        let wrapped: MsgHandler = Arc::new(move |ctx: Ctx, data| {
            let handler = handler.clone();
            let channel = channel_tag.clone();
            Box::pin(async move {
                let started = Instant::now();
                let result = handler(ctx.clone(), data).await;
                let outcome = if result.is_ok() { "ok" } else { "err" };
                let t = tags([("channel", channel.as_str()), ("outcome", outcome)]);
                ctx.stats().inc("stream.call", &t);
                ctx.stats().timing("stream.time", started.elapsed(), &t);
                result
            })
        });
        self.0.subscribe(queue, channel, wrapped, opts)
    }

    async fn drain(&self) {
        self.0.drain().await
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.0.close().await
    }
}

pub struct Log(pub Arc<dyn Stream>);

#[async_trait]
impl Stream for Log {
    async fn start(&self, ctx: &Ctx) -> Result<(), StreamError> {
        self.0.start(ctx).await
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), StreamError> {
        let result = self.0.publish(ctx, channel, data).await;
        if let Err(e) = &result {
            ctx.logger().error(
                "stream.publish.err",
                "publish failed",
                &[field("channel", channel), field("error", e)],
            );
        }
        result
    }

    fn subscribe(
        &self,
        queue: &str,
        channel: &str,
        handler: MsgHandler,
        opts: &[SubscriptionOption],
    ) -> Result<Subscription, StreamError> {
        let channel_tag = channel.to_string();
        let wrapped: MsgHandler = Arc::new(move |ctx: Ctx, data| {
            let handler = handler.clone();
            let channel = channel_tag.clone();
            Box::pin(async move {
                let logger = ctx.logger().with(vec![
                    field("channel", &channel),
                    field("transit", ctx.transit().map(|t| t.id()).unwrap_or_default()),
                ]);
                let result = handler(ctx, data).await;
                match &result {
                    Ok(()) => logger.trace("stream.req.end", "acknowledged", &[]),
                    Err(e) => logger.warning("stream.req.err", "delivery failed", &[field("error", e)]),
                }
                result
            })
        });
        self.0.subscribe(queue, channel, wrapped, opts)
    }

    async fn drain(&self) {
        self.0.drain().await
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.0.close().await
    }
}

pub struct Recover(pub Arc<dyn Stream>);

#[async_trait]
impl Stream for Recover {
    async fn start(&self, ctx: &Ctx) -> Result<(), StreamError> {
        self.0.start(ctx).await
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), StreamError> {
        self.0.publish(ctx, channel, data).await
    }

    fn subscribe(
        &self,
        queue: &str,
        channel: &str,
        handler: MsgHandler,
        opts: &[SubscriptionOption],
    ) -> Result<Subscription, StreamError> {
        let channel_tag = channel.to_string();
        let wrapped: MsgHandler = Arc::new(move |ctx: Ctx, data| {
            let handler = handler.clone();
            let channel = channel_tag.clone();
            Box::pin(async move {
                match AssertUnwindSafe(handler(ctx.clone(), data)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = crate::bg::panic_message(panic.as_ref());
                        ctx.logger().error(
                            "stream.panic",
                            "subscriber panicked",
                            &[field("channel", &channel), field("panic", &message)],
                        );
                        ctx.stats().inc("stream.panic", &tags([("channel", channel.as_str())]));
                        Err(format!("subscriber panicked: {message}").into())
                    }
                }
            })
        });
        self.0.subscribe(queue, channel, wrapped, opts)
    }

    async fn drain(&self) {
        self.0.drain().await
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.0.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::net::stream::{handler, InmemConfig, InmemStream};

    #[tokio::test]
    async fn recovered_panic_is_redelivered() {
        let ctx = Ctx::background();
        let stream = decorate(Arc::new(InmemStream::new(InmemConfig::default())));
        stream.start(&ctx).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let _sub = stream
            .subscribe(
                "",
                "ledger",
                handler(move |_, _| {
                    let seen = seen.clone();
                    async move {
                        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                            panic!("first delivery fails");
                        }
                        Ok(())
                    }
                }),
                &[],
            )
            .unwrap();

        stream.publish(&ctx, "ledger", b"entry".to_vec()).await.unwrap();
        stream.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
