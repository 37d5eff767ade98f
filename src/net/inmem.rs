//! In-process message bus shared by the `inmem` pub/sub and stream adapters.
//!
//! # Responsibilities
//! - One bounded queue per channel, created on first publish
//! - One worker job per channel, dispatched on the task registry
//! - Queue groups: each message reaches every ungrouped subscriber and one
//!   member (round-robin) of every named group
//! - Drain: refuse publishes, deliver what is queued, wait for workers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

use crate::bg::{Job, TaskError};
use crate::context::{Ctx, Shipments, Transit};
use crate::net::{State, StateCell};

pub(crate) const DEFAULT_BUFFER: usize = 50;

#[derive(Debug, Error)]
pub(crate) enum BusError {
    #[error("bus is down or draining")]
    Draining,
    #[error(transparent)]
    Dispatch(#[from] TaskError),
}

/// Delivery of one message to one subscriber.
#[async_trait]
pub(crate) trait Deliver: Send + Sync + 'static {
    async fn deliver(&self, ctx: Ctx, data: Vec<u8>);
}

struct Member<D> {
    id: u64,
    queue: String,
    sink: D,
}

type Members<D> = Arc<RwLock<Vec<Arc<Member<D>>>>>;

struct Envelope {
    transit: Transit,
    shipments: Shipments,
    data: Vec<u8>,
}

pub(crate) struct Bus<D: Deliver> {
    kind: &'static str,
    buffer: usize,
    state: StateCell,
    root: Mutex<Option<Ctx>>,
    senders: Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
    members: Mutex<HashMap<String, Members<D>>>,
    workers: TaskTracker,
    halt: CancellationToken,
    next_id: AtomicU64,
}

impl<D: Deliver> Bus<D> {
    pub(crate) fn new(kind: &'static str, buffer: usize) -> Self {
        Self {
            kind,
            buffer: if buffer == 0 { DEFAULT_BUFFER } else { buffer },
            state: StateCell::default(),
            root: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            workers: TaskTracker::new(),
            halt: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn start(&self, ctx: &Ctx) {
        *lock(&self.root) = Some(ctx.clone());
        self.state.set(State::Up);
        tracing::debug!(kind = self.kind, buffer = self.buffer, "Message bus started");
    }

    pub(crate) async fn publish(&self, ctx: &Ctx, channel: &str, data: Vec<u8>) -> Result<(), BusError> {
        if self.state.get() != State::Up {
            tracing::warn!(kind = self.kind, channel, "Publish refused: bus is down or draining");
            return Err(BusError::Draining);
        }
        let tx = self.sender(channel)?;
        let envelope = Envelope {
            transit: ctx.transit().cloned().unwrap_or_default(),
            shipments: ctx.shipments().clone(),
            data,
        };
        tx.send(envelope).await.map_err(|_| BusError::Draining)
    }

    pub(crate) fn subscribe(&self, queue: &str, channel: &str, sink: D) -> u64 {
        self.subscribe_unless(queue, channel, sink, |_| false)
            .unwrap_or_default()
    }

    /// Add `sink` unless an existing member of `channel` conflicts with it.
    /// The check and the insert happen under the same write lock.
    pub(crate) fn subscribe_unless(
        &self,
        queue: &str,
        channel: &str,
        sink: D,
        conflict: impl Fn(&D) -> bool,
    ) -> Option<u64> {
        let members = self.members_of(channel);
        let mut members = members.write().unwrap_or_else(PoisonError::into_inner);
        if members.iter().any(|m| conflict(&m.sink)) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        members.push(Arc::new(Member {
            id,
            queue: queue.to_string(),
            sink,
        }));
        Some(id)
    }

    pub(crate) fn unsubscribe(&self, channel: &str, id: u64) -> bool {
        let members = self.members_of(channel);
        let mut members = members.write().unwrap_or_else(PoisonError::into_inner);
        let before = members.len();
        members.retain(|m| m.id != id);
        members.len() != before
    }

    pub(crate) async fn drain(&self) {
        if !self.state.transition(State::Up, State::Drain) {
            return;
        }
        tracing::info!(kind = self.kind, workers = self.workers.len(), "Draining message bus");

        // Dropping the senders lets each worker flush its queue and exit.
        lock(&self.senders).clear();
        self.workers.close();
        self.workers.wait().await;

        lock(&self.members).clear();
        lock(&self.root).take();
        self.state.set(State::Down);
        tracing::info!(kind = self.kind, "Message bus drained");
    }

    pub(crate) fn close(&self) {
        self.state.set(State::Down);
        self.halt.cancel();
        lock(&self.senders).clear();
        lock(&self.members).clear();
        lock(&self.root).take();
    }

    fn members_of(&self, channel: &str) -> Members<D> {
        lock(&self.members)
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    /// Queue for `channel`, creating it and its worker on first use.
    fn sender(&self, channel: &str) -> Result<mpsc::Sender<Envelope>, BusError> {
        let mut senders = lock(&self.senders);
        if let Some(tx) = senders.get(channel) {
            return Ok(tx.clone());
        }

        let root = lock(&self.root).clone().ok_or(BusError::Draining)?;
        let (tx, rx) = mpsc::channel(self.buffer);
        let worker = Arc::new(Worker {
            kind: self.kind,
            channel: channel.to_string(),
            rx: Mutex::new(Some(rx)),
            members: self.members_of(channel),
            stop: self.halt.child_token(),
            token: Mutex::new(Some(self.workers.token())),
        });
        tracing::debug!(kind = self.kind, channel, "Dispatching channel worker");
        root.tasks().dispatch_job(&root, worker)?;

        senders.insert(channel.to_string(), tx.clone());
        Ok(tx)
    }
}

struct Worker<D: Deliver> {
    kind: &'static str,
    channel: String,
    rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    members: Members<D>,
    stop: CancellationToken,
    token: Mutex<Option<TaskTrackerToken>>,
}

#[async_trait]
impl<D: Deliver> Job for Worker<D> {
    async fn start(&self, ctx: Ctx) {
        let _token = lock(&self.token).take();
        let Some(mut rx) = lock(&self.rx).take() else {
            return;
        };
        let mut cursors: HashMap<String, usize> = HashMap::new();

        loop {
            let envelope = tokio::select! {
                _ = self.stop.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let members = self
                .members
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for member in pick(&members, &mut cursors) {
                let msg_ctx = ctx
                    .with_transit(envelope.transit.clone())
                    .with_shipments(envelope.shipments.clone());
                member.sink.deliver(msg_ctx, envelope.data.clone()).await;
            }
        }
        tracing::debug!(kind = self.kind, channel = %self.channel, "Channel worker stopped");
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

/// Every ungrouped member, plus one member per named queue group.
fn pick<D>(members: &[Arc<Member<D>>], cursors: &mut HashMap<String, usize>) -> Vec<Arc<Member<D>>> {
    let mut picked = Vec::new();
    let mut groups: Vec<(&str, Vec<&Arc<Member<D>>>)> = Vec::new();

    for member in members {
        if member.queue.is_empty() {
            picked.push(member.clone());
            continue;
        }
        match groups.iter_mut().find(|(q, _)| *q == member.queue) {
            Some((_, group)) => group.push(member),
            None => groups.push((&member.queue, vec![member])),
        }
    }
    for (queue, group) in groups {
        let cursor = cursors.entry(queue.to_string()).or_insert(0);
        picked.push(group[*cursor % group.len()].clone());
        *cursor = cursor.wrapping_add(1);
    }
    picked
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
