//! Liveness gauge published while the process serves.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bg::Job;
use crate::context::Ctx;

/// Publishes `app.heartbeat` (seconds since start) every period.
pub(crate) struct Heartbeat {
    period: Duration,
    stop: CancellationToken,
}

impl Heartbeat {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period,
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Job for Heartbeat {
    async fn start(&self, ctx: Ctx) {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ctx.done() => break,
                _ = ticker.tick() => {
                    ctx.stats().gauge(
                        "app.heartbeat",
                        started.elapsed().as_secs_f64(),
                        &Default::default(),
                    );
                }
            }
        }
        tracing::debug!("Heartbeat stopped");
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn stops_when_drained() {
        let ctx = Ctx::background();
        let tasks = ctx.tasks().clone();
        tasks
            .dispatch_job(&ctx, Arc::new(Heartbeat::new(Duration::from_millis(5))))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), tasks.drain())
            .await
            .expect("heartbeat stops on drain");
        assert_eq!(tasks.outstanding(), 0);
    }
}
