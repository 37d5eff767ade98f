//! Transport registry.
//!
//! # Responsibilities
//! - Hold one inbound server per bind address
//! - Launch every server concurrently
//! - Drain every server concurrently and wait for all of them
//! - Surface a server that stopped with an error

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::Ctx;
use crate::net::{NetError, Server};

struct Entry {
    addr: String,
    server: Arc<dyn Server>,
}

/// The set of inbound transports a process exposes.
#[derive(Default)]
pub struct TransportRegistry {
    entries: Mutex<Vec<Entry>>,
    running: TaskTracker,
    failed: CancellationToken,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `server` on `addr`.
    ///
    /// # Panics
    /// When `addr` is already registered, or when the same server object is
    /// registered twice.
    pub fn add(&self, addr: impl Into<String>, server: Arc<dyn Server>) {
        let addr = addr.into();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|e| e.addr == addr) {
            panic!("transport address <{addr}> is already registered");
        }
        if entries.iter().any(|e| same_server(&e.server, &server)) {
            panic!("transport server for <{addr}> is already registered");
        }
        entries.push(Entry { addr, server });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Launch every server. Returns once all are launched, not when they exit.
    pub fn serve(&self, ctx: &Ctx) -> Result<(), NetError> {
        let servers = self.snapshot();
        if servers.is_empty() {
            return Err(NetError::EmptyRegistry);
        }

        for (addr, server) in servers {
            let ctx = ctx.clone();
            let failed = self.failed.clone();
            tracing::info!(address = %addr, "Starting transport");
            self.running.spawn(async move {
                if let Err(e) = server.serve(ctx, addr.clone()).await {
                    tracing::error!(address = %addr, error = %e, "Transport stopped with error");
                    failed.cancel();
                }
            });
        }
        Ok(())
    }

    /// Drain every server concurrently; returns when all have drained and
    /// every serve loop has exited.
    pub async fn drain(&self) {
        let servers = self.snapshot();
        tracing::info!(transports = servers.len(), "Draining transports");

        join_all(servers.iter().map(|(_, server)| server.drain())).await;

        self.running.close();
        self.running.wait().await;
        tracing::info!("Transports drained");
    }

    /// Resolves when any server stopped with an error.
    pub async fn failed(&self) {
        self.failed.cancelled().await
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Server>)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| (e.addr.clone(), e.server.clone()))
            .collect()
    }
}

fn same_server(a: &Arc<dyn Server>, b: &Arc<dyn Server>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
