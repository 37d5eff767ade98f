//! Process lifecycle controller.
//!
//! # Responsibilities
//! - Own the root carrier and every subsystem built at startup
//! - Hold transports and service registrations until `serve`
//! - Serve: launch transports, announce services, open the readiness gate
//! - Block until the process stops, or fail when a transport dies
//!
//! # Design Decisions
//! - `App` is a cheap handle; clones share one process state
//! - A panic escaping the serve path closes the process and is re-raised
//! - Drain hooks run in registration order, before any subsystem drains

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ConfigTree, CoreConfig};
use crate::context::Ctx;
use crate::disco::DiscoError;
use crate::lifecycle::{heartbeat::Heartbeat, signals};
use crate::net::{NetError, Server, State, StateCell, TransportRegistry};

/// Error type for [`App::serve`].
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("app is not down (state: {0})")]
    NotDown(State),
    #[error(transparent)]
    Transport(#[from] NetError),
    #[error("service registration failed: {0}")]
    Registration(#[from] DiscoError),
    #[error("a transport stopped unexpectedly")]
    TransportFailed,
}

/// A transport announced to service discovery.
pub struct ServiceRegistration {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub server: Arc<dyn Server>,
    pub tags: Vec<String>,
}

impl ServiceRegistration {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub(crate) type DrainHook = Arc<dyn Fn(Ctx) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle on the running process.
#[derive(Clone)]
pub struct App {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) service: String,
    pub(crate) core: CoreConfig,
    pub(crate) ctx: Ctx,
    pub(crate) state: StateCell,
    pub(crate) ready: watch::Sender<bool>,
    pub(crate) stopped: CancellationToken,
    pub(crate) closed: AtomicBool,
    pub(crate) transports: TransportRegistry,
    pub(crate) registrations: Mutex<Vec<crate::disco::Registration>>,
    pub(crate) drain_hooks: Mutex<Vec<DrainHook>>,
}

impl App {
    pub(crate) fn from_parts(service: String, core: CoreConfig, ctx: Ctx) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                service,
                core,
                ctx,
                state: StateCell::default(),
                ready,
                stopped: CancellationToken::new(),
                closed: AtomicBool::new(false),
                transports: TransportRegistry::new(),
                registrations: Mutex::new(Vec::new()),
                drain_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Core settings (`node`, `version`, `[request]`, ...).
    pub fn config(&self) -> &CoreConfig {
        &self.inner.core
    }

    pub fn tree(&self) -> &ConfigTree {
        self.inner.ctx.config()
    }

    /// The `[app]` subtree, owned by the service.
    pub fn app_config<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        self.tree().get("app").unmarshal()
    }

    /// The root carrier: cancelled when the process closes.
    pub fn ctx(&self) -> &Ctx {
        &self.inner.ctx
    }

    pub fn state(&self) -> State {
        self.inner.state.get()
    }

    /// Expose `server` on `addr` once serving.
    ///
    /// # Panics
    /// When `addr` or `server` is already registered.
    pub fn register_server(&self, addr: impl Into<String>, server: Arc<dyn Server>) {
        self.inner.transports.add(addr, server);
    }

    /// Expose the registration's server and announce it to discovery once
    /// serving. The service name is added to the discovery tags.
    ///
    /// # Panics
    /// Like [`App::register_server`].
    pub fn register_service(&self, registration: ServiceRegistration) {
        let address = registration.address();
        self.inner.transports.add(address, registration.server);

        let mut tags = registration.tags;
        if !tags.contains(&self.inner.service) {
            tags.push(self.inner.service.clone());
        }
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(crate::disco::Registration {
                name: registration.name,
                host: registration.host,
                port: registration.port,
                tags,
            });
    }

    /// Run `hook` at the start of drain. Hooks run in registration order.
    pub fn register_drain_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .drain_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(move |ctx| Box::pin(hook(ctx))));
    }

    /// Resolves once `serve` has opened the readiness gate.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Resolves once the process has stopped (drained or closed).
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    /// Serve until the process stops.
    ///
    /// # Panics
    /// Re-raises any panic escaping the serve path, after closing the app.
    pub async fn serve(&self) -> Result<(), ServeError> {
        match AssertUnwindSafe(self.serve_until_stopped()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    service = %self.inner.service,
                    panic = %crate::bg::panic_message(panic.as_ref()),
                    "Fault escaped the serve loop, closing"
                );
                self.close().await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn serve_until_stopped(&self) -> Result<(), ServeError> {
        let state = self.inner.state.get();
        if state != State::Down || self.inner.stopped.is_cancelled() {
            return Err(ServeError::NotDown(state));
        }
        let ctx = &self.inner.ctx;

        self.inner.transports.serve(ctx)?;
        if let Err(e) = self.announce().await {
            tracing::error!(service = %self.inner.service, error = %e, "Service registration failed, stopping transports");
            ctx.disco().leave(ctx).await;
            self.inner.transports.drain().await;
            return Err(e.into());
        }

        if self.inner.core.heartbeat_secs > 0 {
            let heartbeat = Heartbeat::new(Duration::from_secs(self.inner.core.heartbeat_secs));
            if let Err(e) = ctx.tasks().dispatch_job(ctx, Arc::new(heartbeat)) {
                tracing::warn!(error = %e, "Heartbeat not started");
            }
        }
        if self.inner.core.trap_signals {
            signals::trap(self.clone());
        }

        self.inner.state.set(State::Up);
        self.inner.ready.send_replace(true);
        tracing::info!(
            service = %self.inner.service,
            node = %self.inner.core.node,
            version = %self.inner.core.version,
            transports = self.inner.transports.len(),
            "Serving"
        );

        tokio::select! {
            _ = self.inner.stopped.cancelled() => Ok(()),
            _ = self.inner.transports.failed() => {
                tracing::error!(service = %self.inner.service, "Transport failed, closing");
                self.close().await;
                Err(ServeError::TransportFailed)
            }
        }
    }

    async fn announce(&self) -> Result<(), DiscoError> {
        let registrations = std::mem::take(
            &mut *self
                .inner
                .registrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let ctx = &self.inner.ctx;
        for registration in registrations {
            ctx.disco().register(ctx, registration).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("service", &self.inner.service)
            .field("state", &self.inner.state.get())
            .field("transports", &self.inner.transports.len())
            .finish()
    }
}
