//! In-process pub/sub adapter (`[net.pubsub.inmem]`).

use async_trait::async_trait;
use serde::Deserialize;

use crate::context::Ctx;
use crate::net::inmem::{Bus, Deliver, DEFAULT_BUFFER};
use crate::net::pubsub::{MsgHandler, PubSub, PubSubError};

#[derive(Debug, Clone, Deserialize)]
pub struct InmemConfig {
    /// Messages queued per channel before publishers wait.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

fn default_buffer() -> usize {
    DEFAULT_BUFFER
}

impl Default for InmemConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
        }
    }
}

struct Sink(MsgHandler);

#[async_trait]
impl Deliver for Sink {
    async fn deliver(&self, ctx: Ctx, data: Vec<u8>) {
        (self.0)(ctx, data).await;
    }
}

pub struct InmemPubSub {
    bus: Bus<Sink>,
}

impl InmemPubSub {
    pub fn new(config: InmemConfig) -> Self {
        Self {
            bus: Bus::new("pubsub", config.buffer),
        }
    }
}

#[async_trait]
impl PubSub for InmemPubSub {
    async fn start(&self, ctx: &Ctx) -> Result<(), PubSubError> {
        self.bus.start(ctx);
        Ok(())
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        Ok(self.bus.publish(ctx, channel, data).await?)
    }

    fn subscribe(&self, queue: &str, channel: &str, handler: MsgHandler) -> Result<(), PubSubError> {
        self.bus.subscribe(queue, channel, Sink(handler));
        Ok(())
    }

    async fn drain(&self) {
        self.bus.drain().await;
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.bus.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::net::pubsub::handler;

    fn counter(hits: &Arc<AtomicUsize>) -> MsgHandler {
        let hits = hits.clone();
        handler(move |_, _| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber_and_one_per_group() {
        let ctx = Ctx::background();
        let pubsub = InmemPubSub::new(InmemConfig::default());
        pubsub.start(&ctx).await.unwrap();

        let all = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        pubsub.subscribe("", "orders", counter(&all)).unwrap();
        pubsub.subscribe("workers", "orders", counter(&first)).unwrap();
        pubsub.subscribe("workers", "orders", counter(&second)).unwrap();

        for _ in 0..4 {
            pubsub.publish(&ctx, "orders", b"x".to_vec()).await.unwrap();
        }
        pubsub.drain().await;

        assert_eq!(all.load(Ordering::SeqCst), 4);
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn carries_transit_and_shipments() {
        let ctx = Ctx::background()
            .with_new_transit()
            .with_shipment("tenant", "acme");
        let pubsub = InmemPubSub::new(InmemConfig::default());
        pubsub.start(&ctx).await.unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        pubsub
            .subscribe(
                "",
                "events",
                handler(move |ctx: Ctx, data| {
                    let sink = sink.clone();
                    async move {
                        let id = ctx.transit().map(|t| t.id().to_string());
                        let tenant = ctx.shipment("tenant").cloned();
                        *sink.lock().unwrap() = Some((id, tenant, data));
                    }
                }),
            )
            .unwrap();

        pubsub.publish(&ctx, "events", b"hello".to_vec()).await.unwrap();
        pubsub.drain().await;

        let (id, tenant, data) = seen.lock().unwrap().take().unwrap();
        assert_eq!(id.as_deref(), ctx.transit().map(|t| t.id()));
        assert_eq!(tenant, Some(serde_json::json!("acme")));
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn publish_after_drain_is_rejected() {
        let ctx = Ctx::background();
        let pubsub = InmemPubSub::new(InmemConfig::default());
        assert!(matches!(
            pubsub.publish(&ctx, "a", vec![]).await,
            Err(PubSubError::Draining)
        ));

        pubsub.start(&ctx).await.unwrap();
        pubsub.drain().await;
        assert!(matches!(
            pubsub.publish(&ctx, "a", vec![]).await,
            Err(PubSubError::Draining)
        ));
    }
}
