//! Task registry.
//!
//! # Responsibilities
//! - Spawn detached background units of work
//! - Track every unit until it completes
//! - Contain panics so a faulty task cannot take the registry down
//! - Stop long-lived jobs and wait for everything on drain

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;
use tokio_util::task::TaskTracker;

use crate::context::Ctx;

/// Error type for dispatch operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The registry has been drained and accepts no new work.
    #[error("task registry <{0}> is closed")]
    Closed(String),
}

/// A long-lived unit of background work.
///
/// `start` runs until the job decides to return; `stop` asks it to return
/// soon. Drain calls `stop` and then waits for `start` to finish.
#[async_trait]
pub trait Job: Send + Sync {
    async fn start(&self, ctx: Ctx);
    fn stop(&self);
}

/// Tracks concurrently dispatched background work.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    tracker: TaskTracker,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    closed: bool,
    jobs: Vec<Arc<dyn Job>>,
}

impl TaskRegistry {
    /// Create an open registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tracker: TaskTracker::new(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `task` as an independent unit over a detached copy of `ctx`.
    ///
    /// The caller's cancellation and deadline do not reach the task;
    /// process-wide shutdown does.
    pub fn dispatch<F, Fut>(&self, ctx: &Ctx, task: F) -> Result<(), TaskError>
    where
        F: FnOnce(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ctx = ctx.detached();
        let state = self.lock();
        if state.closed {
            return Err(TaskError::Closed(self.inner.name.clone()));
        }
        self.inner
            .tracker
            .spawn(isolate(self.inner.name.clone(), ctx.clone(), task(ctx)));
        Ok(())
    }

    /// Run a long-lived job. Drain stops it and waits for it to return.
    pub fn dispatch_job(&self, ctx: &Ctx, job: Arc<dyn Job>) -> Result<(), TaskError> {
        let ctx = ctx.detached();
        let mut state = self.lock();
        if state.closed {
            return Err(TaskError::Closed(self.inner.name.clone()));
        }
        state.jobs.push(job.clone());
        let job_ctx = ctx.clone();
        self.inner.tracker.spawn(isolate(
            self.inner.name.clone(),
            ctx,
            async move { job.start(job_ctx).await },
        ));
        Ok(())
    }

    /// Stop accepting work, stop every job and wait for all tasks.
    pub async fn drain(&self) {
        let jobs = {
            let mut state = self.lock();
            state.closed = true;
            self.inner.tracker.close();
            std::mem::take(&mut state.jobs)
        };

        tracing::info!(
            registry = %self.inner.name,
            outstanding = self.inner.tracker.len(),
            jobs = jobs.len(),
            "Draining background tasks"
        );

        for job in &jobs {
            job.stop();
        }
        self.inner.tracker.wait().await;

        tracing::info!(registry = %self.inner.name, "Background tasks drained");
    }

    /// Number of tasks still running.
    pub fn outstanding(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("name", &self.inner.name)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Run `fut`, catching and logging a panic instead of propagating it.
async fn isolate<Fut>(registry: String, ctx: Ctx, fut: Fut)
where
    Fut: Future<Output = ()> + Send,
{
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        let transit = ctx.transit().map(|t| t.id().to_string()).unwrap_or_default();
        tracing::error!(
            registry = %registry,
            transit = %transit,
            panic = %super::panic_message(panic.as_ref()),
            "Background task panicked"
        );
        ctx.stats().inc("bg.panic", &Default::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn drain_waits_for_outstanding_tasks() {
        let registry = TaskRegistry::new("test");
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        registry
            .dispatch(&Ctx::background(), move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        registry.drain().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn panicking_task_does_not_affect_siblings() {
        let registry = TaskRegistry::new("test");
        let completed = Arc::new(AtomicUsize::new(0));

        registry
            .dispatch(&Ctx::background(), |_ctx| async move {
                panic!("boom");
            })
            .unwrap();
        for _ in 0..3 {
            let completed = completed.clone();
            registry
                .dispatch(&Ctx::background(), move |_ctx| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        registry.drain().await;
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dispatch_after_drain_is_rejected() {
        let registry = TaskRegistry::new("closed");
        registry.drain().await;

        let err = registry
            .dispatch(&Ctx::background(), |_ctx| async {})
            .unwrap_err();
        assert_eq!(err, TaskError::Closed("closed".into()));
        assert!(registry.is_closed());
    }

    #[tokio::test]
    async fn caller_cancellation_does_not_reach_the_task() {
        let registry = TaskRegistry::new("test");
        let (caller, cancel) = Ctx::background()
            .with_new_transit()
            .with_shipment("user", "7")
            .with_cancel();
        let caller_id = caller.transit().unwrap().id().to_string();
        let observed = Arc::new(Mutex::new(None));

        let gate = Arc::new(Notify::new());
        let (out, wait) = (observed.clone(), gate.clone());
        registry
            .dispatch(&caller, move |ctx| async move {
                wait.notified().await;
                *out.lock().unwrap() = Some((
                    ctx.error(),
                    ctx.transit().map(|t| t.id().to_string()),
                    ctx.shipment("user").cloned(),
                ));
            })
            .unwrap();

        cancel.cancel();
        gate.notify_one();
        registry.drain().await;

        let (err, transit, user) = observed.lock().unwrap().take().unwrap();
        assert_eq!(err, None);
        assert_eq!(transit.as_deref(), Some(caller_id.as_str()));
        assert_eq!(user, Some(serde_json::json!("7")));
    }

    struct Ticker {
        stop: tokio_util::sync::CancellationToken,
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl Job for Ticker {
        async fn start(&self, _ctx: Ctx) {
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => return,
                    _ = interval.tick() => { self.ticks.fetch_add(1, Ordering::SeqCst); }
                }
            }
        }

        fn stop(&self) {
            self.stop.cancel();
        }
    }

    #[tokio::test]
    async fn drain_stops_long_lived_jobs() {
        let registry = TaskRegistry::new("jobs");
        let job = Arc::new(Ticker {
            stop: Default::default(),
            ticks: AtomicUsize::new(0),
        });
        registry.dispatch_job(&Ctx::background(), job.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(1), registry.drain())
            .await
            .expect("drain should return once the job stops");
        assert!(job.ticks.load(Ordering::SeqCst) > 0);
    }
}
