//! Span tracing.
//!
//! # Responsibilities
//! - Start a span per operation, correlated by the transit id
//! - Carry tags and log fields on the span
//! - Report span duration when it finishes
//!
//! # Design Decisions
//! - Optional: an empty `[tracing]` tree selects the no-op tracer
//! - The `log` adapter renders spans as `tracing` spans, so they nest under
//!   whatever subscriber the process installed

use std::time::Instant;

use crate::context::Ctx;

/// One traced operation.
pub trait Span: Send {
    fn set_tag(&mut self, key: &str, value: &str);
    fn log_field(&mut self, key: &str, value: &str);
    fn finish(self: Box<Self>);
}

/// The tracer collaborator.
pub trait Tracer: Send + Sync {
    fn start_span(&self, ctx: &Ctx, operation: &str) -> Box<dyn Span>;
    fn close(&self) -> Result<(), crate::BoxError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NopTracer;

struct NopSpan;

impl Span for NopSpan {
    fn set_tag(&mut self, _: &str, _: &str) {}
    fn log_field(&mut self, _: &str, _: &str) {}
    fn finish(self: Box<Self>) {}
}

impl Tracer for NopTracer {
    fn start_span(&self, _: &Ctx, _: &str) -> Box<dyn Span> {
        Box::new(NopSpan)
    }
}

/// Tracer backed by `tracing` spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

struct LogSpan {
    span: tracing::Span,
    started: Instant,
    tags: Vec<(String, String)>,
}

impl Tracer for LogTracer {
    fn start_span(&self, ctx: &Ctx, operation: &str) -> Box<dyn Span> {
        let (transit, step) = match ctx.transit() {
            Some(tr) => (tr.id().to_string(), tr.stepper().to_string()),
            None => (String::new(), String::new()),
        };
        let span = tracing::info_span!("span", operation = %operation, transit = %transit, step = %step);
        Box::new(LogSpan {
            span,
            started: Instant::now(),
            tags: Vec::new(),
        })
    }
}

impl Span for LogSpan {
    fn set_tag(&mut self, key: &str, value: &str) {
        self.tags.push((key.to_string(), value.to_string()));
    }

    fn log_field(&mut self, key: &str, value: &str) {
        tracing::debug!(parent: &self.span, key, value, "span log");
    }

    fn finish(self: Box<Self>) {
        let tags = self
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        tracing::debug!(
            parent: &self.span,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            tags = %tags,
            "span finished"
        );
    }
}
