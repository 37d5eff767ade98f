//! HTTP transport.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (axum accept loop, router, layers)
//!     → middleware.rs (context → span → stats → access log → recover → interrupt)
//!     → registered handler (Ctx, Request)
//!
//! Outbound:
//!     Ctx → client.rs (sideband headers when propagating, deadline-bound call)
//! ```

pub mod client;
pub mod middleware;
pub mod server;

pub use client::{ClientError, HttpClient};
pub use middleware::X_REQUEST_ID;
pub use server::HttpServer;
