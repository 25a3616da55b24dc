//! Distributed Container — a hash table keyed by tree-node identifier,
//! sharded across ranks by a pluggable [`ProcessMap`] (spec.md §2, §4.2).
//!
//! The local partition is a [`DashMap`], following the teacher's sharded
//! registry style (`caxton::message_router::implementations`'s agent
//! registry uses the same "shard by hash, lock per bucket" shape). Remote
//! operations ride the [`Rml`] as small `serde_json`-encoded frames; this
//! keeps the wire format legible at the cost of an allocation per remote
//! call, acceptable since the hot path (same-process access) never touches
//! the network at all.

use crate::process_map::ProcessMap;
use crate::rml::{OrderingClass, Rml};
use crate::runtime::{Priority, TaskRuntime};
use crate::tree::key::Key;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{instrument, warn};

/// RML handler id the container registers its fire-and-forget `send` path on.
pub const CONTAINER_SEND_HANDLER: u32 = 100;
/// RML handler id for `task` requests expecting a reply.
pub const CONTAINER_TASK_HANDLER: u32 = 101;
/// RML handler id for `task` replies.
pub const CONTAINER_REPLY_HANDLER: u32 = 102;

/// The small fixed set of remote operations the tree algorithms need to
/// apply at a node's owning process (spec.md §4.4.7's `gaxpy_inplace`,
/// §4.4.6's `accumulate`, and plain unconditional replacement).
#[derive(Clone, Serialize, Deserialize)]
pub enum ContainerOp<V> {
    /// `this <- alpha * this + beta * other`, inserting a zero-valued node
    /// first if `key` is absent locally (spec.md §4.4.7).
    GaxpyInPlace { alpha: f64, other: V, beta: f64 },
    /// Accumulate `value` into the node at `key`, creating it if absent
    /// (spec.md §4.4.6's apply-driver accumulation step).
    Accumulate { value: V },
    /// Store `value` unconditionally (spec.md §4.2's `replace`).
    Replace { value: V },
    /// Read-only probe used by `find`: applying it never mutates the node.
    Peek,
}

#[derive(Serialize, Deserialize)]
struct SendFrame<const D: usize, V> {
    key: Key<D>,
    op: ContainerOp<V>,
}

#[derive(Serialize, Deserialize)]
struct TaskFrame<const D: usize, V> {
    request_id: u64,
    key: Key<D>,
    op: ContainerOp<V>,
}

#[derive(Serialize, Deserialize)]
struct ReplyFrame<V> {
    request_id: u64,
    value: Option<V>,
}

/// A tree-node merge trait: how `ContainerOp` combines with an existing
/// (possibly absent) local value. Kept separate from [`TensorAlgebra`] so
/// the container stays usable for any node payload, not only tensors.
pub trait Mergeable: Clone + Send + Sync + 'static {
    /// The value to seed a not-yet-present node with before an op is
    /// applied (spec.md §4.4.6's "creating it if absent").
    fn zero_like(reference: &Self) -> Self;

    /// `self <- alpha * self + beta * other`, merging `has_children` by
    /// logical or (spec.md §4.4.7's `gaxpy_inplace`).
    fn merge_gaxpy(&mut self, alpha: f64, other: &Self, beta: f64);

    /// Fold `value` into `self` (spec.md §4.4.6's accumulation step).
    fn merge_accumulate(&mut self, value: &Self);
}

/// Messages that arrived addressed to a key not yet present in the local
/// partition, parked until [`DistributedContainer::process_pending`] is
/// called (spec.md §4.2).
enum Parked<V> {
    Apply(ContainerOp<V>),
    Reply { request_id: u64, op: ContainerOp<V> },
}

/// Sharded, process-mapped key/value store backing the function tree.
pub struct DistributedContainer<V: Mergeable, const D: usize> {
    rank: usize,
    local: DashMap<Key<D>, V>,
    pmap: Arc<dyn ProcessMap<D>>,
    runtime: TaskRuntime,
    rml: Arc<Rml>,
    pending: DashMap<Key<D>, Vec<Parked<V>>>,
    next_request_id: AtomicU64,
    inflight: Arc<DashMap<u64, oneshot::Sender<Option<V>>>>,
}

impl<V, const D: usize> DistributedContainer<V, D>
where
    V: Mergeable + Serialize + DeserializeOwned,
{
    /// Build a container over `pmap`, registering its RML handlers.
    #[must_use]
    pub fn new(rml: Arc<Rml>, runtime: TaskRuntime, pmap: Arc<dyn ProcessMap<D>>) -> Arc<Self> {
        let this = Arc::new(Self {
            rank: rml.rank(),
            local: DashMap::new(),
            pmap,
            runtime,
            rml,
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(0),
            inflight: Arc::new(DashMap::new()),
        });
        this.register_handlers();
        this
    }

    fn register_handlers(self: &Arc<Self>) {
        let send_self = Arc::clone(self);
        self.rml.register_handler(
            CONTAINER_SEND_HANDLER,
            Arc::new(move |_src, payload: Bytes| {
                let Ok(frame) = serde_json::from_slice::<SendFrame<D, V>>(&payload) else {
                    warn!("malformed container send frame");
                    return;
                };
                send_self.clone().handle_incoming_apply(frame.key, frame.op);
            }),
        );

        let task_self = Arc::clone(self);
        self.rml.register_handler(
            CONTAINER_TASK_HANDLER,
            Arc::new(move |src, payload: Bytes| {
                let Ok(frame) = serde_json::from_slice::<TaskFrame<D, V>>(&payload) else {
                    warn!("malformed container task frame");
                    return;
                };
                task_self
                    .clone()
                    .handle_incoming_task(src, frame.request_id, frame.key, frame.op);
            }),
        );

        let reply_self = Arc::clone(self);
        self.rml.register_handler(
            CONTAINER_REPLY_HANDLER,
            Arc::new(move |_src, payload: Bytes| {
                let Ok(frame) = serde_json::from_slice::<ReplyFrame<V>>(&payload) else {
                    warn!("malformed container reply frame");
                    return;
                };
                if let Some((_, tx)) = reply_self.inflight.remove(&frame.request_id) {
                    let _ = tx.send(frame.value);
                }
            }),
        );
    }

    fn owner(&self, key: Key<D>) -> usize {
        self.pmap.owner(key)
    }

    fn apply_local(&self, key: Key<D>, op: ContainerOp<V>) {
        match op {
            ContainerOp::Replace { value } => {
                self.local.insert(key, value);
            }
            ContainerOp::Accumulate { value } => {
                self.local
                    .entry(key)
                    .and_modify(|existing| existing.merge_accumulate(&value))
                    .or_insert_with(|| {
                        let mut seed = V::zero_like(&value);
                        seed.merge_accumulate(&value);
                        seed
                    });
            }
            ContainerOp::GaxpyInPlace { alpha, other, beta } => {
                self.local
                    .entry(key)
                    .and_modify(|existing| existing.merge_gaxpy(alpha, &other, beta))
                    .or_insert_with(|| {
                        let mut seed = V::zero_like(&other);
                        seed.merge_gaxpy(alpha, &other, beta);
                        seed
                    });
            }
            ContainerOp::Peek => {}
        }
    }

    fn handle_incoming_apply(self: Arc<Self>, key: Key<D>, op: ContainerOp<V>) {
        if self.local.contains_key(&key) || matches!(op, ContainerOp::Replace { .. }) {
            self.apply_local(key, op);
        } else {
            self.pending.entry(key).or_default().push(Parked::Apply(op));
        }
    }

    fn handle_incoming_task(self: Arc<Self>, src: usize, request_id: u64, key: Key<D>, op: ContainerOp<V>) {
        if let Some(existing) = self.local.get(&key).map(|v| v.clone()) {
            self.respond(src, request_id, Some(existing.clone()));
            self.apply_local(key, op);
        } else {
            self.pending
                .entry(key)
                .or_default()
                .push(Parked::Reply { request_id, op });
            self.respond(src, request_id, None);
        }
    }

    fn respond(&self, src: usize, request_id: u64, value: Option<V>) {
        let rml = Arc::clone(&self.rml);
        let frame = ReplyFrame { request_id, value };
        let Ok(bytes) = serde_json::to_vec(&frame) else {
            warn!("failed to encode container reply");
            return;
        };
        tokio::spawn(async move {
            let _ = rml
                .send(src, CONTAINER_REPLY_HANDLER, OrderingClass::Unordered, Bytes::from(bytes))
                .await;
        });
    }

    /// Fire-and-forget: apply `op` at `key`'s owner, locally as a spawned
    /// task if owned here, otherwise as an active message (spec.md §4.2).
    #[instrument(skip(self, op))]
    pub fn send(self: &Arc<Self>, key: Key<D>, op: ContainerOp<V>) {
        let owner = self.owner(key);
        if owner == self.rank {
            let this = Arc::clone(self);
            self.runtime.spawn(Priority::Normal, async move {
                this.apply_local(key, op);
            });
            return;
        }
        let rml = Arc::clone(&self.rml);
        let frame = SendFrame { key, op };
        let Ok(bytes) = serde_json::to_vec(&frame) else {
            warn!("failed to encode container send frame");
            return;
        };
        tokio::spawn(async move {
            let _ = rml
                .send(owner, CONTAINER_SEND_HANDLER, OrderingClass::Ordered, Bytes::from(bytes))
                .await;
        });
    }

    /// Schedule `op` at `key`'s owner and return a future for the node's
    /// value as it stood immediately before the op was applied there.
    pub async fn task(self: &Arc<Self>, key: Key<D>, op: ContainerOp<V>) -> Option<V> {
        let owner = self.owner(key);
        if owner == self.rank {
            let existing = self.local.get(&key).map(|v| v.clone());
            self.apply_local(key, op);
            return existing;
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(request_id, tx);
        let frame = TaskFrame { request_id, key, op };
        let Ok(bytes) = serde_json::to_vec(&frame) else {
            self.inflight.remove(&request_id);
            return None;
        };
        if self
            .rml
            .send(owner, CONTAINER_TASK_HANDLER, OrderingClass::Ordered, Bytes::from(bytes))
            .await
            .is_err()
        {
            self.inflight.remove(&request_id);
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Return the current value at `key`, fetching it remotely if owned
    /// elsewhere (spec.md §4.2's `find`). `Peek` never mutates the remote
    /// node, so this is exactly `task` with a no-op.
    pub async fn find(self: &Arc<Self>, key: Key<D>) -> Option<V> {
        self.task(key, ContainerOp::Peek).await
    }

    /// Store `value` unconditionally at `key`, assumed called on the
    /// owning rank (spec.md §4.2's `replace`).
    pub fn replace(&self, key: Key<D>, value: V) {
        self.local.insert(key, value);
    }

    /// Read the node at `key` if it is present in the local partition.
    #[must_use]
    pub fn get_local(&self, key: Key<D>) -> Option<V> {
        self.local.get(&key).map(|v| v.clone())
    }

    /// Remove the node at `key` from the local partition, if present
    /// (used by `truncate`'s child deletion, spec.md §4.4.3).
    pub fn remove(&self, key: Key<D>) {
        self.local.remove(&key);
    }

    /// Whether `key`'s owner is this rank.
    #[must_use]
    pub fn is_local(&self, key: Key<D>) -> bool {
        self.owner(key) == self.rank
    }

    /// Iterate every key/value pair in the local shard.
    pub fn local_iter(&self) -> impl Iterator<Item = (Key<D>, V)> + '_ {
        self.local.iter().map(|entry| (*entry.key(), entry.value().clone()))
    }

    /// Number of nodes in the local shard.
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Release any operations that arrived addressed to `key` before it
    /// existed locally (spec.md §4.2).
    pub fn process_pending(&self, key: Key<D>) {
        let Some((_, parked)) = self.pending.remove(&key) else {
            return;
        };
        for item in parked {
            match item {
                Parked::Apply(op) => self.apply_local(key, op),
                Parked::Reply { request_id, op } => {
                    let existing = self.local.get(&key).map(|v| v.clone());
                    self.respond(self.rank, request_id, existing);
                    self.apply_local(key, op);
                }
            }
        }
    }

    /// Drain every pending queue whose key now exists locally.
    pub fn process_all_pending(&self) {
        let keys: Vec<Key<D>> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if self.local.contains_key(&key) {
                self.process_pending(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_map::SingleProcessMap;
    use crate::transport::build_world;

    #[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
    struct Scalar(f64);

    impl Mergeable for Scalar {
        fn zero_like(_reference: &Self) -> Self {
            Scalar(0.0)
        }

        fn merge_gaxpy(&mut self, alpha: f64, other: &Self, beta: f64) {
            self.0 = alpha * self.0 + beta * other.0;
        }

        fn merge_accumulate(&mut self, value: &Self) {
            self.0 += value.0;
        }
    }

    #[tokio::test]
    async fn local_send_applies_without_network() {
        let world = build_world(1);
        let t0 = Arc::new(world.into_iter().next().unwrap());
        let rml = Rml::new(t0);
        let _io = rml.spawn_io_task();
        let runtime = TaskRuntime::current();
        let container: Arc<DistributedContainer<Scalar, 1>> =
            DistributedContainer::new(rml, runtime, Arc::new(SingleProcessMap));

        let key = Key::<1>::root();
        container.send(key, ContainerOp::Replace { value: Scalar(7.0) });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(container.get_local(key), Some(Scalar(7.0)));
    }

    #[tokio::test]
    async fn process_pending_releases_parked_ops() {
        let world = build_world(1);
        let t0 = Arc::new(world.into_iter().next().unwrap());
        let rml = Rml::new(t0);
        let _io = rml.spawn_io_task();
        let runtime = TaskRuntime::current();
        let container: Arc<DistributedContainer<Scalar, 1>> =
            DistributedContainer::new(rml, runtime, Arc::new(SingleProcessMap));
        let key = Key::<1>::root();

        container
            .clone()
            .handle_incoming_apply(key, ContainerOp::Accumulate { value: Scalar(3.0) });
        assert_eq!(container.get_local(key), None);

        container.replace(key, Scalar(0.0));
        container.process_pending(key);
        assert_eq!(container.get_local(key), Some(Scalar(3.0)));
    }
}
