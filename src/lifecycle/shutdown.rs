//! Shutdown coordination.
//!
//! # Responsibilities
//! - `drain`: graceful; hooks first, then every subsystem in a fixed order
//! - `shutdown`: leave discovery, then drain
//! - `close`: immediate teardown without waiting for in-flight work
//!
//! # Design Decisions
//! - Traffic sources drain before the subsystems they feed:
//!   transports → scheduler → stream → pubsub → background tasks
//! - Drain is only legal from `Up`; anything else is a `false` no-op
//! - Close is idempotent and never fails; subsystem errors are logged

use std::sync::atomic::Ordering;
use std::sync::PoisonError;

use crate::lifecycle::App;
use crate::net::State;
use crate::observability::field;

impl App {
    /// Drain the process. Returns `false`, without side effects, when the
    /// app is not up.
    pub async fn drain(&self) -> bool {
        let inner = &self.inner;
        if !inner.state.transition(State::Up, State::Drain) {
            return false;
        }
        let ctx = &inner.ctx;
        tracing::info!(service = %inner.service, "Draining");

        let hooks = inner
            .drain_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook(ctx.clone()).await;
        }

        inner.transports.drain().await;
        ctx.scheduler().drain().await;
        ctx.stream().drain().await;
        ctx.pubsub().drain().await;
        ctx.tasks().drain().await;

        inner.state.set(State::Down);
        inner.stopped.cancel();
        tracing::info!(service = %inner.service, "Drained");
        true
    }

    /// Leave discovery so no new traffic is routed here, then drain.
    /// A no-op returning `false` when the app is not up.
    pub async fn shutdown(&self) -> bool {
        if self.inner.state.get() != State::Up {
            return false;
        }
        let ctx = &self.inner.ctx;
        ctx.disco().leave(ctx).await;
        self.drain().await
    }

    /// Tear down immediately: leave discovery, close every closable
    /// subsystem and cancel the root carrier.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = &inner.ctx;
        tracing::warn!(service = %inner.service, state = %inner.state.get(), "Closing");

        ctx.disco().leave(ctx).await;
        if let Err(e) = ctx.scheduler().close().await {
            ctx.logger().error("app.close", "scheduler close failed", &[field("error", &e)]);
        }
        if let Err(e) = ctx.stream().close().await {
            ctx.logger().error("app.close", "stream close failed", &[field("error", &e)]);
        }
        if let Err(e) = ctx.pubsub().close().await {
            ctx.logger().error("app.close", "pubsub close failed", &[field("error", &e)]);
        }
        if let Err(e) = ctx.tracer().close() {
            ctx.logger().error("app.close", "tracer close failed", &[field("error", &e)]);
        }
        if let Err(e) = ctx.logger().close() {
            tracing::error!(error = %e, "Logger close failed");
        }

        ctx.services().root.cancel();
        inner.state.set(State::Down);
        inner.stopped.cancel();
    }
}
