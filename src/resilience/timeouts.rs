//! Timeout enforcement.
//!
//! # Responsibilities
//! - Race work against the carrier's cancellation and deadline
//! - Report which of the two ended the work
//!
//! # Design Decisions
//! - Timeout errors are distinct from other errors
//! - Timed-out requests return 504 Gateway Timeout

use std::future::Future;

use crate::context::{Ctx, CtxError};

/// Run `fut` until it completes or `ctx` is done.
///
/// The future is dropped (cancelled) when the carrier ends first.
pub async fn run_until_done<F>(ctx: &Ctx, fut: F) -> Result<F::Output, CtxError>
where
    F: Future,
{
    if let Some(err) = ctx.error() {
        return Err(err);
    }
    tokio::select! {
        out = fut => Ok(out),
        _ = ctx.done() => Err(ctx.error().unwrap_or(CtxError::Canceled)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn deadline_interrupts_slow_work() {
        let ctx = Ctx::background().with_timeout(Duration::from_millis(10));
        let result = run_until_done(&ctx, tokio::time::sleep(Duration::from_secs(5))).await;
        assert_eq!(result, Err(CtxError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancellation_is_reported_as_canceled() {
        let (ctx, cancel) = Ctx::background().with_cancel();
        cancel.cancel();
        let result = run_until_done(&ctx, async { 1 }).await;
        assert_eq!(result, Err(CtxError::Canceled));
    }

    #[tokio::test]
    async fn fast_work_completes() {
        let ctx = Ctx::background().with_timeout(Duration::from_secs(5));
        assert_eq!(run_until_done(&ctx, async { 7 }).await, Ok(7));
    }
}
