//! In-process stream adapter (`[net.stream.inmem]`).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::context::Ctx;
use crate::net::inmem::{Bus, Deliver, DEFAULT_BUFFER};
use crate::net::stream::{
    MsgHandler, Stream, StreamError, Subscription, SubscriptionOption, DEFAULT_MAX_REDELIVERIES,
};

#[derive(Debug, Clone, Deserialize)]
pub struct InmemConfig {
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

struct Sink {
    handler: MsgHandler,
    durable: Option<String>,
    max_redeliveries: u32,
}

#[async_trait]
impl Deliver for Sink {
    async fn deliver(&self, ctx: Ctx, data: Vec<u8>) {
        let mut attempt = 0;
        loop {
            let Err(e) = (self.handler)(ctx.clone(), data.clone()).await else {
                return;
            };
            if attempt >= self.max_redeliveries {
                tracing::error!(
                    error = %e,
                    attempts = attempt + 1,
                    durable = ?self.durable,
                    "Stream message dropped after exhausting redeliveries"
                );
                return;
            }
            attempt += 1;
            tracing::warn!(error = %e, attempt, "Redelivering stream message");
        }
    }
}

pub struct InmemStream {
    bus: Arc<Bus<Sink>>,
}

impl InmemStream {
    pub fn new(config: InmemConfig) -> Self {
        Self {
            bus: Arc::new(Bus::new("stream", config.buffer)),
        }
    }
}

#[async_trait]
impl Stream for InmemStream {
    async fn start(&self, ctx: &Ctx) -> Result<(), StreamError> {
        self.bus.start(ctx);
        Ok(())
    }

    async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), StreamError> {
        Ok(self.bus.publish(ctx, channel, data).await?)
    }

    fn subscribe(
        &self,
        queue: &str,
        channel: &str,
        handler: MsgHandler,
        opts: &[SubscriptionOption],
    ) -> Result<Subscription, StreamError> {
        let mut sink = Sink {
            handler,
            durable: None,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        };
        for opt in opts {
            match opt {
                SubscriptionOption::Durable(name) => sink.durable = Some(name.clone()),
                SubscriptionOption::MaxRedeliveries(n) => sink.max_redeliveries = *n,
            }
        }

        let durable = sink.durable.clone();
        let id = self
            .bus
            .subscribe_unless(queue, channel, sink, |s| {
                durable.is_some() && s.durable == durable
            })
            .ok_or_else(|| StreamError::DurableInUse {
                channel: channel.to_string(),
                name: durable.clone().unwrap_or_default(),
            })?;
        let bus = Arc::downgrade(&self.bus);
        let channel = channel.to_string();
        Ok(Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(&channel, id);
            }
        }))
    }

    async fn drain(&self) {
        self.bus.drain().await;
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.bus.close();
        Ok(())
    }
}
