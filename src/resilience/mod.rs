//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request / outbound call:
//!     → timeouts.rs (race the work against the carrier deadline)
//!
//! Reconnect loops (discovery watch):
//!     → backoff.rs (exponential delay with jitter between attempts)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call observes its carrier
//! - Jitter keeps reconnecting watchers from synchronising

pub mod backoff;
pub mod timeouts;
