//! Background dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! Request handler / process code
//!     → registry.rs dispatch(ctx, task)
//!         → ctx.detached() (caller cancellation dropped, transit carried or minted)
//!         → tokio task tracked by the registry
//!
//! Lifecycle drain:
//!     → stop every long-lived Job
//!     → close the registry (new dispatches fail)
//!     → wait for every outstanding task
//! ```
//!
//! # Design Decisions
//! - Drain is cooperative: outstanding tasks are never aborted
//! - A panicking task is contained and logged; siblings keep running
//! - Long-lived jobs are told to stop, then awaited like any other task

pub mod registry;

pub use registry::{Job, TaskError, TaskRegistry};

use std::any::Any;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
