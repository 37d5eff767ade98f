//! In-process cache (`[cache.local]`).
//!
//! # Design Decisions
//! - An entry weighs `key.len() + value.len()` bytes
//! - A value heavier than the whole group is served but never admitted
//! - Concurrent misses on one key share a single `OnceCell`; the entry is
//!   removed once the load settles, so a failed load is retried next time

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use tokio::sync::OnceCell;

use crate::cache::{Cache, CacheError, Group, Loader};
use crate::context::Ctx;
use crate::observability::tags;

type Flight = Arc<OnceCell<Result<Vec<u8>, CacheError>>>;

#[derive(Default)]
pub struct LocalCache {
    groups: DashMap<String, Arc<LocalGroup>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for LocalCache {
    fn new_group(&self, name: &str, capacity_bytes: u64, loader: Loader) -> Arc<dyn Group> {
        let group = Arc::new(LocalGroup {
            name: name.to_string(),
            loader,
            lru: Mutex::new(Lru {
                entries: LruCache::unbounded(),
                used: 0,
                capacity: capacity_bytes,
            }),
            flights: Mutex::new(HashMap::new()),
        });
        match self.groups.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                panic!("cache: duplicate group <{name}>")
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(group.clone());
            }
        }
        tracing::debug!(group = name, capacity_bytes, "Cache group created");
        group
    }
}

struct Lru {
    entries: LruCache<String, Vec<u8>>,
    used: u64,
    capacity: u64,
}

impl Lru {
    fn admit(&mut self, key: String, value: Vec<u8>) {
        let weight = (key.len() + value.len()) as u64;
        if weight > self.capacity {
            return;
        }
        while self.used + weight > self.capacity {
            match self.entries.pop_lru() {
                Some((k, v)) => self.used -= (k.len() + v.len()) as u64,
                None => break,
            }
        }
        self.used += weight;
        if let Some(old) = self.entries.put(key.clone(), value) {
            self.used -= (key.len() + old.len()) as u64;
        }
    }
}

pub struct LocalGroup {
    name: String,
    loader: Loader,
    lru: Mutex<Lru>,
    flights: Mutex<HashMap<String, Flight>>,
}

impl LocalGroup {
    /// Bytes currently held.
    pub fn used_bytes(&self) -> u64 {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner).used
    }

    async fn load(&self, ctx: &Ctx, key: &str) -> Result<Vec<u8>, CacheError> {
        ctx.stats().inc("cache.miss", &tags([("group", self.name.as_str())]));
        let value = (self.loader)(ctx.clone(), key.to_string())
            .await
            .map_err(|e| CacheError::Load {
                group: self.name.clone(),
                key: key.to_string(),
                message: e.to_string(),
            })?;
        self.lru
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(key.to_string(), value.clone());
        Ok(value)
    }
}

#[async_trait]
impl Group for LocalGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, ctx: &Ctx, key: &str) -> Result<Vec<u8>, CacheError> {
        if let Some(value) = self
            .lru
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key)
        {
            ctx.stats().inc("cache.hit", &tags([("group", self.name.as_str())]));
            return Ok(value.clone());
        }

        let flight = self
            .flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        let result = flight.get_or_init(|| self.load(ctx, key)).await.clone();

        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if flights.get(key).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
            flights.remove(key);
        }
        result
    }
}
