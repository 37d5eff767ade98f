//! Causality propagation subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound call (any transport)
//!     → sideband.rs (decode transit + shipments, or mint a transit)
//!     → carrier.rs (Ctx: deadline, cancellation, transit, shipments, services)
//!     → handler, background tasks, outbound calls
//!
//! Outbound call:
//!     Ctx → sideband.rs (capture child transit + shipments snapshot)
//!         → transport header / envelope field
//! ```
//!
//! # Design Decisions
//! - One transit per logical flow; nested calls fork the stepper, never the id
//! - Shipments are a persistent list, so captured snapshots are immutable
//! - The carrier is passed by parameter, never looked up from ambient state

pub mod carrier;
pub mod shipment;
pub mod sideband;
pub mod stepper;
pub mod transit;

pub use carrier::{Ctx, CtxError, Services};
pub use shipment::{Shipment, Shipments};
pub use sideband::{Sideband, SidebandError, SHIPMENTS_HEADER, TRANSIT_HEADER};
pub use stepper::Stepper;
pub use transit::Transit;
