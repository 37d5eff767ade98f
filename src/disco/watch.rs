//! Restartable membership watch.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::disco::{DiscoError, Instance};
use crate::resilience::backoff::Backoff;

const RECONNECT_BASE_MS: u64 = 50;
const RECONNECT_MAX_MS: u64 = 5_000;

/// Source of membership changes behind a [`ServiceHandle`].
pub trait Feed: Send + Sync {
    /// Subscribe to change notifications.
    fn connect(&self) -> Result<broadcast::Receiver<()>, DiscoError>;

    /// Current instances of `name` carrying every tag in `tags`.
    fn members(&self, name: &str, tags: &[String]) -> Vec<Instance>;
}

/// A watchable service, returned by `Agent::service`.
#[derive(Clone)]
pub struct ServiceHandle {
    feed: Arc<dyn Feed>,
    name: String,
    tags: Vec<String>,
    closed: CancellationToken,
}

impl ServiceHandle {
    pub fn new(feed: Arc<dyn Feed>, name: &str, tags: &[String]) -> Self {
        Self {
            feed,
            name: name.to_string(),
            tags: tags.to_vec(),
            closed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current instances, without watching.
    pub fn members(&self) -> Vec<Instance> {
        self.feed.members(&self.name, &self.tags)
    }

    /// A new watcher; it subscribes on its first `next()`.
    pub fn watch(&self) -> Watcher {
        Watcher {
            handle: self.clone(),
            rx: None,
            last: None,
            backoff: Backoff::new(RECONNECT_BASE_MS, RECONNECT_MAX_MS),
        }
    }

    /// End every watcher created from this handle.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// Infinite sequence of membership snapshots.
pub struct Watcher {
    handle: ServiceHandle,
    rx: Option<broadcast::Receiver<()>>,
    last: Option<Vec<Instance>>,
    backoff: Backoff,
}

impl Watcher {
    /// The next membership that differs from the previous one returned.
    ///
    /// The first call returns the current membership. Fails only once the
    /// service handle is closed.
    pub async fn next(&mut self) -> Result<Vec<Instance>, DiscoError> {
        let closed = self.handle.closed.clone();
        if closed.is_cancelled() {
            return Err(DiscoError::Closed);
        }
        tokio::select! {
            _ = closed.cancelled() => Err(DiscoError::Closed),
            snapshot = self.advance() => Ok(snapshot),
        }
    }

    async fn advance(&mut self) -> Vec<Instance> {
        loop {
            if self.rx.is_none() {
                self.connect().await;
                if let Some(snapshot) = self.changed() {
                    return snapshot;
                }
                continue;
            }
            let Some(rx) = self.rx.as_mut() else {
                continue;
            };

            match rx.recv().await {
                Ok(()) => self.backoff.reset(),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(service = %self.handle.name, skipped, "Discovery watcher lagged, resyncing");
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        service = %self.handle.name,
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Discovery feed severed, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
            if let Some(snapshot) = self.changed() {
                return snapshot;
            }
        }
    }

    async fn connect(&mut self) {
        loop {
            match self.handle.feed.connect() {
                Ok(rx) => {
                    self.rx = Some(rx);
                    return;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        service = %self.handle.name,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Discovery feed unavailable"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn changed(&mut self) -> Option<Vec<Instance>> {
        let snapshot = self.handle.members();
        if self.last.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last = Some(snapshot.clone());
        Some(snapshot)
    }
}
