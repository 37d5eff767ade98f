//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, Logger collaborator)
//!     → metrics.rs (counters, gauges, histograms through Stats)
//!     → tracing.rs (spans correlated by transit id)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Span output through the installed subscriber
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Transit id flows through all subsystems
//! - Every collaborator has a no-op form selected by an empty config tree

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use self::logging::{field, Field, Logger};
pub use self::metrics::{tags, Stats, Tags};
pub use self::tracing::{Span, Tracer};
