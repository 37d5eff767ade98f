//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Build every subsystem from its config subtree
//! - Start the subsystems that own background work
//! - Hand back an `App` that is down and ready to `serve`
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and names its subsystem
//! - Subsystems initialize in order, not concurrently
//! - Transports start in `serve`, never here (traffic only when ready)

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bg::TaskRegistry;
use crate::config::{self, validate_config, ConfigError, ConfigTree, CoreConfig};
use crate::context::{Ctx, Services};
use crate::lifecycle::adapters::{AdapterError, Adapters};
use crate::lifecycle::App;
use crate::net::{pubsub, stream};
use crate::observability::{field, tags};
use crate::BoxError;

/// Error type for [`App::start`].
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("{subsystem} failed to start: {source}")]
    Subsystem {
        subsystem: &'static str,
        #[source]
        source: BoxError,
    },
}

impl StartError {
    fn subsystem(subsystem: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Subsystem {
            subsystem,
            source: source.into(),
        }
    }
}

impl App {
    /// Start `service` from the tree named by `CONFIG_URI`, with the
    /// default adapters.
    pub async fn from_env(service: impl Into<String>) -> Result<App, StartError> {
        let tree = config::loader::load_from_env()?;
        Self::start(service, tree, &Adapters::with_defaults()).await
    }

    /// Build and start every subsystem selected by `tree`.
    pub async fn start(
        service: impl Into<String>,
        tree: ConfigTree,
        adapters: &Adapters,
    ) -> Result<App, StartError> {
        let service = service.into();
        let core: CoreConfig = tree.unmarshal()?;
        validate_config(&tree, &core).map_err(ConfigError::Validation)?;

        let logger = adapters.logger(&tree.get("log"))?.with(vec![
            field("service", &service),
            field("node", &core.node),
            field("version", &core.version),
        ]);
        let stats = adapters.stats(&tree.get("stats"))?.with(tags([
            ("service", service.as_str()),
            ("node", core.node.as_str()),
            ("version", core.version.as_str()),
        ]));
        let tracer = adapters.tracer(&tree.get("tracing"))?;
        let disco = adapters.disco(&tree.get("disco"))?;
        let scheduler = adapters.scheduler(&tree.get("schedule"))?;
        let cache = adapters.cache(&tree.get("cache"))?;
        let pubsub = pubsub::middleware::decorate(adapters.pubsub(&tree.get("net.pubsub"))?);
        let stream = stream::middleware::decorate(adapters.stream(&tree.get("net.stream"))?);

        let services = Arc::new(Services {
            root: CancellationToken::new(),
            config: tree,
            logger,
            stats,
            tracer,
            tasks: TaskRegistry::new(service.clone()),
            disco,
            scheduler,
            cache,
            pubsub,
            stream,
        });
        let ctx = Ctx::root(services);

        if let Err(e) = ctx.scheduler().start(&ctx).await {
            abandon(&ctx).await;
            return Err(StartError::subsystem("schedule", e));
        }
        if let Err(e) = ctx.pubsub().start(&ctx).await {
            abandon(&ctx).await;
            return Err(StartError::subsystem("net.pubsub", e));
        }
        if let Err(e) = ctx.stream().start(&ctx).await {
            abandon(&ctx).await;
            return Err(StartError::subsystem("net.stream", e));
        }

        tracing::info!(
            service = %service,
            node = %core.node,
            version = %core.version,
            "App started"
        );
        Ok(App::from_parts(service, core, ctx))
    }
}

/// Close whatever a failed startup already started.
async fn abandon(ctx: &Ctx) {
    if let Err(e) = ctx.scheduler().close().await {
        tracing::warn!(error = %e, "Scheduler close failed after startup error");
    }
    if let Err(e) = ctx.pubsub().close().await {
        tracing::warn!(error = %e, "Pubsub close failed after startup error");
    }
    if let Err(e) = ctx.stream().close().await {
        tracing::warn!(error = %e, "Stream close failed after startup error");
    }
    ctx.services().root.cancel();
}
