//! Call-scoped carrier.
//!
//! `Ctx` is an immutable value threaded by parameter through every call.
//! Each `with_*` returns a new carrier; the original is never mutated, so
//! forking a carrier across tasks is always safe.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bg::TaskRegistry;
use crate::cache::{self, Cache};
use crate::config::ConfigTree;
use crate::disco::{self, Agent};
use crate::net::pubsub::{self, PubSub};
use crate::net::stream::{self, Stream};
use crate::observability::logging::{Logger, NopLogger};
use crate::observability::metrics::{NopStats, Stats};
use crate::observability::tracing::{NopTracer, Tracer};
use crate::schedule::{self, Scheduler};

use super::shipment::Shipments;
use super::transit::Transit;

/// Process-wide collaborators reachable from every carrier.
pub struct Services {
    /// Cancelled when the process closes; every carrier derives from it.
    pub root: CancellationToken,
    pub config: ConfigTree,
    pub logger: Arc<dyn Logger>,
    pub stats: Arc<dyn Stats>,
    pub tracer: Arc<dyn Tracer>,
    pub tasks: TaskRegistry,
    pub disco: Arc<dyn Agent>,
    pub scheduler: Arc<dyn Scheduler>,
    pub cache: Arc<dyn Cache>,
    pub pubsub: Arc<dyn PubSub>,
    pub stream: Arc<dyn Stream>,
}

impl Services {
    /// Every collaborator set to its no-op implementation.
    pub fn nop() -> Self {
        Self {
            root: CancellationToken::new(),
            config: ConfigTree::empty(),
            logger: Arc::new(NopLogger),
            stats: Arc::new(NopStats),
            tracer: Arc::new(NopTracer),
            tasks: TaskRegistry::new("background"),
            disco: Arc::new(disco::LocalAgent::new()),
            scheduler: Arc::new(schedule::NopScheduler),
            cache: Arc::new(cache::NopCache),
            pubsub: Arc::new(pubsub::NopPubSub),
            stream: Arc::new(stream::NopStream),
        }
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("root_cancelled", &self.root.is_cancelled())
            .field("outstanding_tasks", &self.tasks.outstanding())
            .finish_non_exhaustive()
    }
}

/// Why a carrier is done.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CtxError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// The call-scoped carrier.
#[derive(Clone)]
pub struct Ctx {
    services: Arc<Services>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    transit: Option<Transit>,
    shipments: Shipments,
}

impl Ctx {
    /// Carrier rooted at the process: cancelled when the process closes.
    pub fn root(services: Arc<Services>) -> Self {
        let cancel = services.root.clone();
        Self {
            services,
            cancel,
            deadline: None,
            transit: None,
            shipments: Shipments::new(),
        }
    }

    /// A carrier over no-op services. Useful in tests and tools.
    pub fn background() -> Self {
        Self::root(Arc::new(Services::nop()))
    }

    pub fn transit(&self) -> Option<&Transit> {
        self.transit.as_ref()
    }

    pub fn with_transit(&self, transit: Transit) -> Self {
        Self {
            transit: Some(transit),
            ..self.clone()
        }
    }

    /// Attach a freshly minted transit.
    pub fn with_new_transit(&self) -> Self {
        self.with_transit(Transit::new())
    }

    /// Carry the current transit, or mint one when absent.
    pub fn ensure_transit(&self) -> Self {
        match self.transit {
            Some(_) => self.clone(),
            None => self.with_new_transit(),
        }
    }

    pub fn shipments(&self) -> &Shipments {
        &self.shipments
    }

    pub fn shipment(&self, key: &str) -> Option<&Value> {
        self.shipments.get(key)
    }

    pub fn with_shipment(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            shipments: self.shipments.with(key, value),
            ..self.clone()
        }
    }

    pub fn with_shipments(&self, shipments: Shipments) -> Self {
        Self {
            shipments,
            ..self.clone()
        }
    }

    /// Child carrier with its own cancellation scope.
    ///
    /// Cancelling the returned token ends the child only; cancelling this
    /// carrier ends both.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Self {
            cancel: token.clone(),
            ..self.clone()
        };
        (ctx, token)
    }

    /// Child carrier whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
            ..self.clone()
        }
    }

    /// Carrier for work that outlives the caller.
    ///
    /// The caller's cancellation and deadline are dropped; process-wide
    /// shutdown still applies. The transit is carried (or minted) and every
    /// shipment is copied forward.
    pub fn detached(&self) -> Self {
        Self {
            services: self.services.clone(),
            cancel: self.services.root.child_token(),
            deadline: None,
            transit: Some(self.transit.clone().unwrap_or_default()),
            shipments: self.shipments.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves once the carrier is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// `Some` once the carrier is done, telling why.
    pub fn error(&self) -> Option<CtxError> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(CtxError::DeadlineExceeded);
        }
        if self.cancel.is_cancelled() {
            return Some(CtxError::Canceled);
        }
        None
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn config(&self) -> &ConfigTree {
        &self.services.config
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.services.logger
    }

    pub fn stats(&self) -> &Arc<dyn Stats> {
        &self.services.stats
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.services.tracer
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.services.tasks
    }

    pub fn disco(&self) -> &Arc<dyn Agent> {
        &self.services.disco
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.services.scheduler
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.services.cache
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.services.pubsub
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.services.stream
    }
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("transit", &self.transit.as_ref().map(ToString::to_string))
            .field("shipments", &self.shipments.len())
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
