//! Outbound HTTP client.
//!
//! # Responsibilities
//! - Forward transit and shipments to the callee when propagation is on
//! - Bound every call by the carrier's deadline and cancellation

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

use crate::config::RequestConfig;
use crate::context::{Ctx, CtxError, Sideband, SHIPMENTS_HEADER, TRANSIT_HEADER};
use crate::resilience::timeouts::run_until_done;

/// Error type for outbound calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("outbound call interrupted: {0}")]
    Interrupted(#[from] CtxError),
    #[error("outbound call failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
}

/// Context-aware HTTP client.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Body>,
    propagate_context: bool,
}

impl HttpClient {
    /// Create a client governed by the process `[request]` settings.
    pub fn new(config: &RequestConfig) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            propagate_context: config.propagate_context,
        }
    }

    /// Override outbound propagation for this client only.
    pub fn propagate_context(mut self, propagate: bool) -> Self {
        self.propagate_context = propagate;
        self
    }

    /// Send `req` on behalf of `ctx`.
    pub async fn send(&self, ctx: &Ctx, mut req: Request<Body>) -> Result<Response<Incoming>, ClientError> {
        if self.propagate_context {
            let (transit, shipments) = Sideband::capture(ctx).to_text();
            let headers = req.headers_mut();
            if let Some(value) = transit.and_then(|t| HeaderValue::from_str(&t).ok()) {
                headers.insert(TRANSIT_HEADER, value);
            }
            if let Ok(value) = HeaderValue::from_str(&shipments) {
                headers.insert(SHIPMENTS_HEADER, value);
            }
        }

        tracing::debug!(
            method = %req.method(),
            uri = %req.uri(),
            propagate = self.propagate_context,
            "Outbound request"
        );
        Ok(run_until_done(ctx, self.client.request(req)).await??)
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("propagate_context", &self.propagate_context)
            .finish()
    }
}
