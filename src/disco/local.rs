//! In-process discovery agent (`[disco.local]`).
//!
//! Agents sharing one [`Catalog`] see each other's registrations, which is
//! enough to run several nodes inside one process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::context::Ctx;
use crate::disco::watch::Feed;
use crate::disco::{Agent, DiscoError, Instance, Registration, ServiceHandle};

const FEED_CAPACITY: usize = 16;

struct Entry {
    agent: String,
    instance: Instance,
}

/// Shared membership directory.
pub struct Catalog {
    entries: Mutex<BTreeMap<String, Entry>>,
    changes: Mutex<broadcast::Sender<()>>,
}

impl Catalog {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            changes: Mutex::new(changes),
        })
    }

    /// Drop the change feed. Connected watchers see it close and reconnect.
    pub fn sever(&self) {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        *self.changes.lock().unwrap_or_else(PoisonError::into_inner) = changes;
    }

    fn notify(&self) {
        let _ = self
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(());
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Feed for Catalog {
    fn connect(&self) -> Result<broadcast::Receiver<()>, DiscoError> {
        Ok(self
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe())
    }

    fn members(&self, name: &str, tags: &[String]) -> Vec<Instance> {
        let mut members: Vec<Instance> = self
            .entries()
            .values()
            .map(|e| &e.instance)
            .filter(|i| i.name == name && tags.iter().all(|t| i.tags.contains(t)))
            .cloned()
            .collect();
        members.sort();
        members
    }
}

pub struct LocalAgent {
    id: String,
    catalog: Arc<Catalog>,
}

impl LocalAgent {
    /// Agent over a private catalog.
    pub fn new() -> Self {
        Self::with_catalog(Catalog::new())
    }

    pub fn with_catalog(catalog: Arc<Catalog>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            catalog,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
}

impl Default for LocalAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for LocalAgent {
    async fn register(&self, _: &Ctx, registration: Registration) -> Result<String, DiscoError> {
        if registration.name.is_empty() {
            return Err(DiscoError::InvalidRegistration(format!(
                "{}:{}",
                registration.host, registration.port
            )));
        }
        let id = Uuid::new_v4().simple().to_string();
        let instance = Instance {
            id: id.clone(),
            name: registration.name,
            host: registration.host,
            port: registration.port,
            tags: registration.tags,
        };
        tracing::info!(id = %id, service = %instance.name, address = %instance.address(), "Service registered");
        self.catalog.entries().insert(
            id.clone(),
            Entry {
                agent: self.id.clone(),
                instance,
            },
        );
        self.catalog.notify();
        Ok(id)
    }

    async fn deregister(&self, _: &Ctx, id: &str) -> Result<(), DiscoError> {
        let removed = {
            let mut entries = self.catalog.entries();
            match entries.get(id) {
                Some(entry) if entry.agent == self.id => entries.remove(id).is_some(),
                _ => false,
            }
        };
        if removed {
            tracing::info!(id, "Service deregistered");
            self.catalog.notify();
        }
        Ok(())
    }

    async fn leave(&self, _: &Ctx) {
        let removed = {
            let mut entries = self.catalog.entries();
            let before = entries.len();
            entries.retain(|_, e| e.agent != self.id);
            before - entries.len()
        };
        if removed > 0 {
            tracing::info!(agent = %self.id, removed, "Left discovery");
            self.catalog.notify();
        }
    }

    fn service(&self, name: &str, tags: &[String]) -> Result<ServiceHandle, DiscoError> {
        Ok(ServiceHandle::new(self.catalog.clone(), name, tags))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registration(name: &str, port: u16, tags: &[&str]) -> Registration {
        Registration {
            name: name.into(),
            host: "127.0.0.1".into(),
            port,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn watch_reports_membership_changes() {
        let ctx = Ctx::background();
        let agent = LocalAgent::new();
        agent.register(&ctx, registration("api", 8080, &["http"])).await.unwrap();

        let mut watcher = agent.service("api", &["http".into()]).unwrap().watch();
        let first = watcher.next().await.unwrap();
        assert_eq!(first.len(), 1);

        agent.register(&ctx, registration("api", 8081, &["http"])).await.unwrap();
        let second = watcher.next().await.unwrap();
        assert_eq!(second.len(), 2);

        agent.leave(&ctx).await;
        assert!(watcher.next().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tags_filter_members() {
        let ctx = Ctx::background();
        let agent = LocalAgent::new();
        agent.register(&ctx, registration("api", 1, &["http", "v2"])).await.unwrap();
        agent.register(&ctx, registration("api", 2, &["http"])).await.unwrap();
        agent.register(&ctx, registration("worker", 3, &["v2"])).await.unwrap();

        let handle = agent.service("api", &["v2".into()]).unwrap();
        let members = handle.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].port, 1);
    }

    #[tokio::test]
    async fn leave_only_removes_own_registrations() {
        let ctx = Ctx::background();
        let catalog = Catalog::new();
        let a = LocalAgent::with_catalog(catalog.clone());
        let b = LocalAgent::with_catalog(catalog.clone());
        a.register(&ctx, registration("api", 1, &[])).await.unwrap();
        b.register(&ctx, registration("api", 2, &[])).await.unwrap();

        a.leave(&ctx).await;

        let members = b.service("api", &[]).unwrap().members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].port, 2);
    }

    #[tokio::test]
    async fn lagging_watcher_resyncs() {
        let ctx = Ctx::background();
        let agent = LocalAgent::new();
        let mut watcher = agent.service("api", &[]).unwrap().watch();
        assert!(watcher.next().await.unwrap().is_empty());

        for port in 0..(FEED_CAPACITY as u16 * 2) {
            agent.register(&ctx, registration("api", port, &[])).await.unwrap();
        }

        let members = watcher.next().await.unwrap();
        assert_eq!(members.len(), FEED_CAPACITY * 2);
    }

    #[tokio::test]
    async fn severed_feed_is_rejoined() {
        let ctx = Ctx::background();
        let agent = LocalAgent::new();
        let mut watcher = agent.service("api", &[]).unwrap().watch();
        assert!(watcher.next().await.unwrap().is_empty());

        agent.catalog().sever();
        agent.register(&ctx, registration("api", 80, &[])).await.unwrap();

        let members = tokio::time::timeout(Duration::from_secs(2), watcher.next())
            .await
            .expect("watcher reconnects")
            .unwrap();
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn closed_handle_ends_watchers() {
        let agent = LocalAgent::new();
        let handle = agent.service("api", &[]).unwrap();
        let mut watcher = handle.watch();
        watcher.next().await.unwrap();

        handle.close();
        assert_eq!(watcher.next().await, Err(DiscoError::Closed));
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let agent = LocalAgent::new();
        let result = agent.register(&Ctx::background(), registration("", 80, &[])).await;
        assert!(matches!(result, Err(DiscoError::InvalidRegistration(_))));
    }
}
