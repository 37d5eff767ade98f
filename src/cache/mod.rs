//! Read-through cache groups.
//!
//! # Data Flow
//! ```text
//! group.get(ctx, key)
//!     → hit: value from the LRU
//!     → miss: one loader call per key, shared by every concurrent caller
//!         → Ok: admitted to the LRU (evicting least-recently-used entries)
//!         → Err: returned to every waiter, never cached
//! ```

pub mod local;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::context::Ctx;
use crate::BoxError;

pub use local::LocalCache;

/// Fills the cache on a miss.
pub type Loader = Arc<dyn Fn(Ctx, String) -> BoxFuture<'static, Result<Vec<u8>, BoxError>> + Send + Sync>;

/// Box an async closure into a [`Loader`].
pub fn loader<F, Fut>(f: F) -> Loader
where
    F: Fn(Ctx, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, key| Box::pin(f(ctx, key)))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The loader failed; shared verbatim with every coalesced caller.
    #[error("cache group <{group}> failed to load <{key}>: {message}")]
    Load {
        group: String,
        key: String,
        message: String,
    },
}

/// A named, size-bounded cache namespace.
#[async_trait]
pub trait Group: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, ctx: &Ctx, key: &str) -> Result<Vec<u8>, CacheError>;
}

/// Cache capability.
pub trait Cache: Send + Sync {
    /// Create the group `name`, holding at most `capacity_bytes` of keys
    /// and values.
    ///
    /// # Panics
    /// When a group called `name` already exists.
    fn new_group(&self, name: &str, capacity_bytes: u64, loader: Loader) -> Arc<dyn Group>;
}

/// Cache that stores nothing: every `get` calls the loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopCache;

impl Cache for NopCache {
    fn new_group(&self, name: &str, _: u64, loader: Loader) -> Arc<dyn Group> {
        Arc::new(PassThrough {
            name: name.to_string(),
            loader,
        })
    }
}

struct PassThrough {
    name: String,
    loader: Loader,
}

#[async_trait]
impl Group for PassThrough {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, ctx: &Ctx, key: &str) -> Result<Vec<u8>, CacheError> {
        (self.loader)(ctx.clone(), key.to_string())
            .await
            .map_err(|e| CacheError::Load {
                group: self.name.clone(),
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}
