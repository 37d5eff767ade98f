//! In-flight work tracking.
//!
//! # Responsibilities
//! - Count units of inbound work currently being served
//! - Release the count automatically when a unit ends (guard drop)
//! - Let drain wait until the count reaches zero

use std::sync::Arc;

use tokio::sync::watch;

/// Tracks in-flight units for graceful drain.
///
/// The count lives in a watch channel so waiters wake on every change
/// instead of polling.
#[derive(Debug, Clone)]
pub struct InflightTracker {
    count: Arc<watch::Sender<usize>>,
}

impl InflightTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    /// Record one unit. The returned guard releases it on drop.
    pub fn track(&self) -> InflightGuard {
        self.count.send_modify(|n| *n += 1);
        InflightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no unit is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender is held by `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InflightTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks one unit's lifetime.
/// Decrements the count when dropped, including on panic.
#[derive(Debug)]
pub struct InflightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}
