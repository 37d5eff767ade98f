//! Adapter registry.
//!
//! # Responsibilities
//! - Map each subsystem's adapter names to constructors
//! - Build a subsystem from its config subtree (first key selects)
//! - Fall back to the subsystem's no-op when the subtree is empty
//!
//! # Design Decisions
//! - One explicit registry object owned by the bootstrap code and passed to
//!   `App::start`; nothing is registered globally
//! - Registering a name twice is a programming error and panics

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::{self, Cache};
use crate::config::ConfigTree;
use crate::disco::{self, Agent};
use crate::net::pubsub::{self, PubSub};
use crate::net::stream::{self, Stream};
use crate::observability::logging::{LogConfig, LogFormat, Logger, NopLogger, TracingLogger};
use crate::observability::metrics::{LogStats, MetricsStats, NopStats, PrometheusConfig, Stats};
use crate::observability::tracing::{LogTracer, NopTracer, Tracer};
use crate::schedule::{self, Scheduler};
use crate::BoxError;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{subsystem} adapter not found <{name}> (known: {known})")]
    NotFound {
        subsystem: &'static str,
        name: String,
        known: String,
    },
    #[error("{subsystem} adapter <{name}> failed to build: {source}")]
    Build {
        subsystem: &'static str,
        name: String,
        #[source]
        source: BoxError,
    },
}

type Factory<T> = Box<dyn Fn(&ConfigTree) -> Result<Arc<T>, BoxError> + Send + Sync>;

struct Registry<T: ?Sized> {
    subsystem: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    fn new(subsystem: &'static str) -> Self {
        Self {
            subsystem,
            factories: BTreeMap::new(),
        }
    }

    fn register(&mut self, name: &str, factory: Factory<T>) {
        if self.factories.contains_key(name) {
            panic!("{}: duplicate adapter <{name}>", self.subsystem);
        }
        self.factories.insert(name.to_string(), factory);
    }

    fn build(&self, tree: &ConfigTree, nop: impl FnOnce() -> Arc<T>) -> Result<Arc<T>, AdapterError> {
        let Some((name, settings)) = tree.adapter() else {
            tracing::debug!(subsystem = self.subsystem, "No adapter configured, using no-op");
            return Ok(nop());
        };
        let factory = self.factories.get(&name).ok_or_else(|| AdapterError::NotFound {
            subsystem: self.subsystem,
            name: name.clone(),
            known: self.names().join(", "),
        })?;
        let built = factory(&settings).map_err(|source| AdapterError::Build {
            subsystem: self.subsystem,
            name: name.clone(),
            source,
        })?;
        tracing::debug!(subsystem = self.subsystem, adapter = %name, "Adapter built");
        Ok(built)
    }

    fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// Constructors for every pluggable subsystem.
pub struct Adapters {
    log: Registry<dyn Logger>,
    stats: Registry<dyn Stats>,
    tracing: Registry<dyn Tracer>,
    disco: Registry<dyn Agent>,
    schedule: Registry<dyn Scheduler>,
    cache: Registry<dyn Cache>,
    pubsub: Registry<dyn PubSub>,
    stream: Registry<dyn Stream>,
}

impl Adapters {
    /// A registry with no adapters: every subsystem can only be no-op.
    pub fn new() -> Self {
        Self {
            log: Registry::new("log"),
            stats: Registry::new("stats"),
            tracing: Registry::new("tracing"),
            disco: Registry::new("disco"),
            schedule: Registry::new("schedule"),
            cache: Registry::new("cache"),
            pubsub: Registry::new("net.pubsub"),
            stream: Registry::new("net.stream"),
        }
    }

    /// The adapters shipped with the crate.
    pub fn with_defaults() -> Self {
        let mut adapters = Self::new();
        adapters.register_logger("stdout", |tree| {
            let config: LogConfig = tree.unmarshal()?;
            Ok(Arc::new(TracingLogger::init(LogFormat::Stdout, &config)?))
        });
        adapters.register_logger("json", |tree| {
            let config: LogConfig = tree.unmarshal()?;
            Ok(Arc::new(TracingLogger::init(LogFormat::Json, &config)?))
        });
        adapters.register_stats("prometheus", |tree| {
            let config: PrometheusConfig = tree.unmarshal()?;
            Ok(Arc::new(MetricsStats::prometheus(&config)?))
        });
        adapters.register_stats("log", |_| Ok(Arc::new(LogStats::default())));
        adapters.register_tracer("log", |_| Ok(Arc::new(LogTracer)));
        adapters.register_disco("local", |_| Ok(Arc::new(disco::LocalAgent::new())));
        adapters.register_scheduler("local", |_| Ok(Arc::new(schedule::LocalScheduler::new())));
        adapters.register_cache("local", |_| Ok(Arc::new(cache::LocalCache::new())));
        adapters.register_pubsub("inmem", |tree| {
            let config: pubsub::InmemConfig = tree.unmarshal()?;
            Ok(Arc::new(pubsub::InmemPubSub::new(config)))
        });
        adapters.register_stream("inmem", |tree| {
            let config: stream::InmemConfig = tree.unmarshal()?;
            Ok(Arc::new(stream::InmemStream::new(config)))
        });
        adapters
    }

    /// # Panics
    /// When `name` is already registered for the subsystem. The same holds
    /// for every `register_*` method.
    pub fn register_logger<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ConfigTree) -> Result<Arc<dyn Logger>, BoxError> + Send + Sync + 'static,
    {
        self.log.register(name, Box::new(factory));
    }

    pub fn register_stats<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ConfigTree) -> Result<Arc<dyn Stats>, BoxError> + Send + Sync + 'static,
    {
        self.stats.register(name, Box::new(factory));
    }

    pub fn register_tracer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ConfigTree) -> Result<Arc<dyn Tracer>, BoxError> + Send + Sync + 'static,
    {
        self.tracing.register(name, Box::new(factory));
    }

    pub fn register_disco<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ConfigTree) -> Result<Arc<dyn Agent>, BoxError> + Send + Sync + 'static,
    {
        self.disco.register(name, Box::new(factory));
    }

    pub fn register_scheduler<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ConfigTree) -> Result<Arc<dyn Scheduler>, BoxError> + Send + Sync + 'static,
    {
        self.schedule.register(name, Box::new(factory));
    }

    pub fn register_cache<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ConfigTree) -> Result<Arc<dyn Cache>, BoxError> + Send + Sync + 'static,
    {
        self.cache.register(name, Box::new(factory));
    }

    pub fn register_pubsub<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ConfigTree) -> Result<Arc<dyn PubSub>, BoxError> + Send + Sync + 'static,
    {
        self.pubsub.register(name, Box::new(factory));
    }

    pub fn register_stream<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ConfigTree) -> Result<Arc<dyn Stream>, BoxError> + Send + Sync + 'static,
    {
        self.stream.register(name, Box::new(factory));
    }

    pub fn logger(&self, tree: &ConfigTree) -> Result<Arc<dyn Logger>, AdapterError> {
        self.log.build(tree, || Arc::new(NopLogger))
    }

    pub fn stats(&self, tree: &ConfigTree) -> Result<Arc<dyn Stats>, AdapterError> {
        self.stats.build(tree, || Arc::new(NopStats))
    }

    pub fn tracer(&self, tree: &ConfigTree) -> Result<Arc<dyn Tracer>, AdapterError> {
        self.tracing.build(tree, || Arc::new(NopTracer))
    }

    /// An empty `[disco]` selects an agent over a private catalog.
    pub fn disco(&self, tree: &ConfigTree) -> Result<Arc<dyn Agent>, AdapterError> {
        self.disco.build(tree, || Arc::new(disco::LocalAgent::new()))
    }

    pub fn scheduler(&self, tree: &ConfigTree) -> Result<Arc<dyn Scheduler>, AdapterError> {
        self.schedule.build(tree, || Arc::new(schedule::NopScheduler))
    }

    pub fn cache(&self, tree: &ConfigTree) -> Result<Arc<dyn Cache>, AdapterError> {
        self.cache.build(tree, || Arc::new(cache::NopCache))
    }

    pub fn pubsub(&self, tree: &ConfigTree) -> Result<Arc<dyn PubSub>, AdapterError> {
        self.pubsub.build(tree, || Arc::new(pubsub::NopPubSub))
    }

    pub fn stream(&self, tree: &ConfigTree) -> Result<Arc<dyn Stream>, AdapterError> {
        self.stream.build(tree, || Arc::new(stream::NopStream))
    }
}

impl Default for Adapters {
    fn default() -> Self {
        Self::with_defaults()
    }
}
