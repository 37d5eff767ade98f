//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Register endpoints before serving
//! - Wire up the middleware chain once, at serve time
//! - Bind the listener and run the accept loop
//! - Drain: refuse new requests, wait for in-flight ones, stop accepting

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::Method,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{on, MethodFilter},
    Extension, Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::config::RequestConfig;
use crate::context::Ctx;
use crate::net::http::middleware;
use crate::net::{InflightTracker, NetError, Server, State, StateCell};

/// Per-server settings resolved at serve time, shared with the middleware.
pub(crate) struct Shared {
    pub(crate) root: Ctx,
    pub(crate) allow_context: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) let_panic: bool,
    pub(crate) state: Arc<StateCell>,
    pub(crate) inflight: InflightTracker,
}

/// HTTP transport implementing [`Server`].
pub struct HttpServer {
    config: RequestConfig,
    router: Mutex<Router>,
    state: Arc<StateCell>,
    inflight: InflightTracker,
    stop: CancellationToken,
    stopped: CancellationToken,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl HttpServer {
    /// Create a server governed by the process `[request]` settings.
    pub fn new(config: RequestConfig) -> Self {
        let (local_addr, _) = watch::channel(None);
        Self {
            config,
            router: Mutex::new(Router::new()),
            state: Arc::new(StateCell::default()),
            inflight: InflightTracker::new(),
            stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
            local_addr,
        }
    }

    /// Override the inbound trust boundary for this server only.
    pub fn allow_context(mut self, allow: bool) -> Self {
        self.config.allow_context = allow;
        self
    }

    /// Register `handler` for `method` on `path` (axum path syntax).
    ///
    /// # Panics
    /// When `method` is not routable.
    pub fn handle<F, Fut, R>(&self, method: Method, path: &str, handler: F)
    where
        F: Fn(Ctx, Request) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        let filter = match MethodFilter::try_from(method.clone()) {
            Ok(filter) => filter,
            Err(_) => panic!("unsupported HTTP method <{method}> for <{path}>"),
        };
        let endpoint = move |Extension(ctx): Extension<Ctx>, req: Request| {
            let handler = handler.clone();
            async move { handler(ctx, req).await.into_response() }
        };

        let mut router = self.router.lock().unwrap_or_else(PoisonError::into_inner);
        *router = std::mem::take(&mut *router).route(path, on(filter, endpoint));
        tracing::debug!(method = %method, path = %path, "Endpoint registered");
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Requests currently being served.
    pub fn inflight(&self) -> usize {
        self.inflight.count()
    }

    /// The bound address, once the accept loop is running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.local_addr.subscribe();
        let addr = rx.wait_for(Option::is_some).await.ok().and_then(|addr| *addr);
        addr
    }

    /// Build the router with all middleware layers.
    ///
    /// Layers run outermost first: body limit, http trace, context,
    /// span, stats, access log, panic recovery, interrupt, handler.
    fn build_router(&self, shared: Arc<Shared>) -> Router {
        let routes = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        routes
            .layer(from_fn_with_state(shared.clone(), middleware::interrupt))
            .layer(from_fn_with_state(shared.clone(), middleware::recover))
            .layer(from_fn_with_state(shared.clone(), middleware::access_log))
            .layer(from_fn_with_state(shared.clone(), middleware::stats))
            .layer(from_fn_with_state(shared.clone(), middleware::span))
            .layer(from_fn_with_state(shared, middleware::context))
            .layer(TraceLayer::new_for_http())
            .layer(RequestBodyLimitLayer::new(self.config.max_body_bytes))
    }
}

#[async_trait]
impl Server for HttpServer {
    async fn serve(&self, ctx: Ctx, addr: String) -> Result<(), NetError> {
        if !self.state.transition(State::Down, State::Up) {
            return Err(NetError::AlreadyServing);
        }

        let (listener, bound) = match bind(&addr).await {
            Ok(bound) => bound,
            Err(source) => {
                self.state.set(State::Down);
                self.stopped.cancel();
                return Err(NetError::Bind { addr, source });
            }
        };

        let shared = Arc::new(Shared {
            root: ctx.clone(),
            allow_context: self.config.allow_context,
            timeout: (self.config.timeout_ms > 0)
                .then(|| Duration::from_millis(self.config.timeout_ms)),
            let_panic: self.config.panic,
            state: self.state.clone(),
            inflight: self.inflight.clone(),
        });
        let app = self.build_router(shared);

        tracing::info!(
            address = %bound,
            allow_context = self.config.allow_context,
            "HTTP server starting"
        );
        self.local_addr.send_replace(Some(bound));

        let stop = self.stop.clone();
        let root = ctx.cancellation_token().clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = root.cancelled() => {}
                }
            })
            .await;

        self.state.set(State::Down);
        self.stopped.cancel();
        tracing::info!(address = %bound, "HTTP server stopped");
        result.map_err(|source| NetError::Serve { addr, source })
    }

    async fn drain(&self) {
        if !self.state.transition(State::Up, State::Drain) {
            // Not launched yet: a later serve exits as soon as it binds.
            if self.state.get() == State::Down {
                self.stop.cancel();
            }
            return;
        }
        tracing::info!(inflight = self.inflight.count(), "Draining HTTP server");

        self.inflight.wait_idle().await;
        self.stop.cancel();
        self.stopped.cancelled().await;
    }
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new(RequestConfig::default())
    }
}

async fn bind(addr: &str) -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}
