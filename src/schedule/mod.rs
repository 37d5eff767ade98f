//! Delayed job scheduling.
//!
//! # Data Flow
//! ```text
//! handle_func(target, handler)        (setup)
//! in_(ctx, delay, target, payload)    → JobId
//!     → local.rs timer task (tracked)
//!     → handler(detached ctx, job id, payload)
//! ```
//!
//! # Design Decisions
//! - Jobs run over a detached copy of the scheduling carrier, like any
//!   other background work
//! - Drain drops timers that have not fired yet and waits for running jobs

pub mod local;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

use crate::context::Ctx;
use crate::BoxError;

pub use local::LocalScheduler;

/// Job callback: carrier, job id, payload.
pub type JobHandler =
    Arc<dyn Fn(Ctx, JobId, Vec<u8>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Box an async closure into a [`JobHandler`].
pub fn job_handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Ctx, JobId, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, id, data| Box::pin(f(ctx, id, data)))
}

/// Identifier of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no handler registered for target <{0}>")]
    UnknownTarget(String),
    #[error("scheduler is not running")]
    NotRunning,
}

/// Scheduler capability.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register the handler for `target`.
    fn handle_func(&self, target: &str, handler: JobHandler);

    /// Run `target` with `payload` once `delay` has elapsed.
    fn in_(&self, ctx: &Ctx, delay: Duration, target: &str, payload: Vec<u8>) -> Result<JobId, ScheduleError>;

    async fn start(&self, ctx: &Ctx) -> Result<(), ScheduleError>;

    async fn drain(&self);

    async fn close(&self) -> Result<(), ScheduleError>;
}

/// Scheduler that accepts jobs and never runs them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopScheduler;

#[async_trait]
impl Scheduler for NopScheduler {
    fn handle_func(&self, _: &str, _: JobHandler) {}

    fn in_(&self, _: &Ctx, _: Duration, target: &str, _: Vec<u8>) -> Result<JobId, ScheduleError> {
        let id = JobId::new();
        tracing::debug!(target_name = target, job_id = %id, "No scheduler configured, job discarded");
        Ok(id)
    }

    async fn start(&self, _: &Ctx) -> Result<(), ScheduleError> {
        Ok(())
    }

    async fn drain(&self) {}

    async fn close(&self) -> Result<(), ScheduleError> {
        Ok(())
    }
}
