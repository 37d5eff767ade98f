//! HTTP middleware chain.
//!
//! # Responsibilities
//! - `context`: gate on server state, build the request carrier, echo the
//!   transit id as `x-request-id`, track the request as in flight
//! - `span`: one tracer span per request
//! - `stats`: request count, latency and in-flight gauge
//! - `access_log`: one line per request through the Logger collaborator
//! - `recover`: turn a handler panic into 500
//! - `interrupt`: answer 504 once the request deadline passes
//!
//! # Design Decisions
//! - Each layer reads the carrier from request extensions; only `context`
//!   writes it
//! - Inbound sideband is honoured only when the server allows context

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;

use crate::context::{Ctx, CtxError, Sideband, SHIPMENTS_HEADER, TRANSIT_HEADER};
use crate::net::http::server::Shared;
use crate::net::State as RunState;
use crate::observability::{field, tags};
use crate::resilience::timeouts::run_until_done;

/// Response header echoing the transit id.
pub const X_REQUEST_ID: &str = "x-request-id";

pub(crate) async fn context(
    State(shared): State<Arc<Shared>>,
    mut req: Request,
    next: Next,
) -> Response {
    let refused = || shared.state.get() != RunState::Up || shared.root.error().is_some();
    if refused() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is draining").into_response();
    }
    let _inflight = shared.inflight.track();
    // Drain may have begun between the check and the track.
    if refused() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is draining").into_response();
    }

    let ctx = if shared.allow_context {
        match inbound_context(&shared.root, req.headers()) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, path = %req.uri().path(), "Rejected malformed context sideband");
                return (StatusCode::BAD_REQUEST, "malformed context sideband").into_response();
            }
        }
    } else {
        shared.root.with_new_transit()
    };
    let ctx = match shared.timeout {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx,
    };

    // The request carrier ends with the request, whether it completes or
    // the client goes away.
    let (ctx, cancel) = ctx.with_cancel();
    let _cancel_on_drop = cancel.drop_guard();

    let request_id = ctx.transit().map(|t| t.id().to_string()).unwrap_or_default();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

fn inbound_context(root: &Ctx, headers: &HeaderMap) -> Result<Ctx, crate::context::SidebandError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    Sideband::from_text(header(TRANSIT_HEADER), header(SHIPMENTS_HEADER))?.apply(root)
}

pub(crate) async fn span(State(_): State<Arc<Shared>>, req: Request, next: Next) -> Response {
    let Some(ctx) = carrier(&req) else {
        return next.run(req).await;
    };
    let mut span = ctx.tracer().start_span(&ctx, &format!("{} {}", req.method(), route(&req)));
    span.set_tag("http.method", req.method().as_str());

    let response = next.run(req).await;
    span.set_tag("http.status", response.status().as_str());
    span.finish();
    response
}

pub(crate) async fn stats(State(shared): State<Arc<Shared>>, req: Request, next: Next) -> Response {
    let Some(ctx) = carrier(&req) else {
        return next.run(req).await;
    };
    let method = req.method().to_string();
    let path = route(&req);
    let started = Instant::now();
    ctx.stats()
        .gauge("http.inflight", shared.inflight.count() as f64, &Default::default());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    let t = tags([("method", method.as_str()), ("path", path.as_str()), ("status", status.as_str())]);
    ctx.stats().inc("http.request", &t);
    ctx.stats().timing("http.request.duration", started.elapsed(), &t);
    response
}

pub(crate) async fn access_log(State(_): State<Arc<Shared>>, req: Request, next: Next) -> Response {
    let Some(ctx) = carrier(&req) else {
        return next.run(req).await;
    };
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    let fields = [
        field("method", &method),
        field("uri", &uri),
        field("status", status.as_u16()),
        field("elapsed_ms", started.elapsed().as_millis()),
        field("transit", ctx.transit().map(|t| t.id()).unwrap_or_default()),
    ];
    if status.is_server_error() {
        ctx.logger().warning("http", "request failed", &fields);
    } else {
        ctx.logger().trace("http", "request served", &fields);
    }
    response
}

pub(crate) async fn recover(State(shared): State<Arc<Shared>>, req: Request, next: Next) -> Response {
    if shared.let_panic {
        return next.run(req).await;
    }
    let ctx = carrier(&req);
    let path = req.uri().path().to_string();

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            tracing::error!(
                path = %path,
                transit = %ctx.as_ref().and_then(Ctx::transit).map(|t| t.id()).unwrap_or_default(),
                panic = %crate::bg::panic_message(panic.as_ref()),
                "HTTP handler panicked"
            );
            if let Some(ctx) = &ctx {
                ctx.stats().inc("http.panic", &tags([("path", path.as_str())]));
            }
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

pub(crate) async fn interrupt(State(_): State<Arc<Shared>>, req: Request, next: Next) -> Response {
    let Some(ctx) = carrier(&req) else {
        return next.run(req).await;
    };
    match run_until_done(&ctx, next.run(req)).await {
        Ok(response) => response,
        Err(CtxError::DeadlineExceeded) => {
            (StatusCode::GATEWAY_TIMEOUT, "request timed out").into_response()
        }
        Err(CtxError::Canceled) => {
            (StatusCode::SERVICE_UNAVAILABLE, "request canceled").into_response()
        }
    }
}

fn carrier(req: &Request) -> Option<Ctx> {
    req.extensions().get::<Ctx>().cloned()
}

/// Matched route template when available, to keep metric cardinality low.
fn route(req: &Request) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}
