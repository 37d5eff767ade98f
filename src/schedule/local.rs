//! In-process timer scheduler (`[schedule.local]`).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::Ctx;
use crate::net::{State, StateCell};
use crate::observability::{field, tags};
use crate::schedule::{JobHandler, JobId, ScheduleError, Scheduler};

pub struct LocalScheduler {
    handlers: RwLock<HashMap<String, JobHandler>>,
    state: StateCell,
    timers: TaskTracker,
    /// Cancelled on close; stops pending timers and running jobs.
    halt: CancellationToken,
    /// Cancelled on drain; stops pending timers only.
    pending: CancellationToken,
}

impl LocalScheduler {
    pub fn new() -> Self {
        let halt = CancellationToken::new();
        Self {
            handlers: RwLock::new(HashMap::new()),
            state: StateCell::default(),
            timers: TaskTracker::new(),
            pending: halt.child_token(),
            halt,
        }
    }

    /// Jobs waiting on their timer or running.
    pub fn outstanding(&self) -> usize {
        self.timers.len()
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    /// # Panics
    /// When `target` already has a handler.
    fn handle_func(&self, target: &str, handler: JobHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(target) {
            panic!("schedule: duplicate handler for target <{target}>");
        }
        handlers.insert(target.to_string(), handler);
    }

    fn in_(&self, ctx: &Ctx, delay: Duration, target: &str, payload: Vec<u8>) -> Result<JobId, ScheduleError> {
        if self.state.get() != State::Up {
            return Err(ScheduleError::NotRunning);
        }
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
            .ok_or_else(|| ScheduleError::UnknownTarget(target.to_string()))?;

        let id = JobId::new();
        let job_ctx = ctx.detached();
        let target = target.to_string();
        let pending = self.pending.clone();
        let halt = self.halt.clone();
        let job_id = id.clone();

        tracing::debug!(job_id = %id, target_name = %target, delay_ms = delay.as_millis() as u64, "Job scheduled");
        self.timers.spawn(async move {
            tokio::select! {
                _ = pending.cancelled() => {
                    tracing::debug!(job_id = %job_id, "Pending job dropped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            tokio::select! {
                _ = halt.cancelled() => {
                    tracing::warn!(job_id = %job_id, "Running job abandoned on close");
                }
                _ = run(job_ctx, handler, job_id.clone(), target, payload) => {}
            }
        });
        Ok(id)
    }

    async fn start(&self, _: &Ctx) -> Result<(), ScheduleError> {
        self.state.transition(State::Down, State::Up);
        Ok(())
    }

    async fn drain(&self) {
        if !self.state.transition(State::Up, State::Drain) {
            return;
        }
        tracing::info!(outstanding = self.timers.len(), "Draining scheduler");
        self.pending.cancel();
        self.timers.close();
        self.timers.wait().await;
        self.state.set(State::Down);
        tracing::info!("Scheduler drained");
    }

    async fn close(&self) -> Result<(), ScheduleError> {
        self.state.set(State::Down);
        self.halt.cancel();
        self.timers.close();
        Ok(())
    }
}

async fn run(ctx: Ctx, handler: JobHandler, id: JobId, target: String, payload: Vec<u8>) {
    let started = Instant::now();
    let outcome = match AssertUnwindSafe(handler(ctx.clone(), id.clone(), payload))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => "ok",
        Ok(Err(e)) => {
            ctx.logger().warning(
                "schedule.job.err",
                "job failed",
                &[field("job_id", &id), field("target", &target), field("error", e)],
            );
            "err"
        }
        Err(panic) => {
            tracing::error!(
                job_id = %id,
                target_name = %target,
                panic = %crate::bg::panic_message(panic.as_ref()),
                "Scheduled job panicked"
            );
            "panic"
        }
    };
    let t = tags([("target", target.as_str()), ("outcome", outcome)]);
    ctx.stats().inc("schedule.job", &t);
    ctx.stats().timing("schedule.job.duration", started.elapsed(), &t);
}
