//! MPI-like transport — the point-to-point and collective primitives
//! spec.md §1 and §6 name as an external collaborator. Concretized here
//! with an in-process implementation over `tokio::sync::mpsc` so the RML
//! and container layers can be exercised without a real MPI runtime,
//! following the `Communicator`/`Barrier` trait shape used by `rsmpi`'s
//! collective module (pack reference `rsmpi-rsmpi/src/collective/mod.rs`).

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{Barrier as TokioBarrier, Mutex, mpsc};

/// Reserved tag for eager active messages (spec.md §6).
pub const RMI_TAG: i32 = 1;
/// Reserved tag for rendezvous data transfer.
pub const RMI_HUGE_DAT_TAG: i32 = 2;
/// Reserved tag for rendezvous acknowledgement.
pub const RMI_HUGE_ACK_TAG: i32 = 3;

/// A single point-to-point message as seen by the transport layer.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Sending rank.
    pub src: usize,
    /// Reserved tag distinguishing eager/huge-data/huge-ack traffic.
    pub tag: i32,
    /// Untyped byte payload.
    pub payload: Bytes,
}

/// Point-to-point send/recv plus the collectives spec.md §6 requires
/// (barrier, sum, max, min, any-to-one gather for diagnostics).
#[async_trait]
pub trait Transport: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Total number of ranks in the world.
    fn world_size(&self) -> usize;

    /// Non-blocking-semantics send: payload lands in the destination's
    /// receive queue; the await resolves once it has been enqueued.
    async fn send(&self, dest: usize, tag: i32, payload: Bytes) -> Result<(), TransportError>;

    /// Await the next message addressed to this rank, from any source.
    async fn recv_any(&self) -> Result<Envelope, TransportError>;

    /// Barrier across all ranks.
    async fn barrier(&self);

    /// Sum-reduce a scalar across all ranks; every rank receives the total.
    async fn all_reduce_sum(&self, value: f64) -> f64;

    /// Max-reduce a scalar across all ranks.
    async fn all_reduce_max(&self, value: f64) -> f64;

    /// Min-reduce a scalar across all ranks.
    async fn all_reduce_min(&self, value: f64) -> f64;

    /// Gather one value per rank at `root`; non-root ranks get `None`.
    async fn gather(&self, value: Bytes, root: usize) -> Option<Vec<Bytes>>;
}

enum ReduceOp {
    Sum,
    Max,
    Min,
}

fn fold(op: &ReduceOp, values: &[f64]) -> f64 {
    match op {
        ReduceOp::Sum => values.iter().sum(),
        ReduceOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        ReduceOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

struct Shared {
    inboxes: Vec<mpsc::UnboundedSender<Envelope>>,
    barrier: TokioBarrier,
    reduce_slots: Mutex<Vec<f64>>,
    gather_slots: Mutex<Vec<Option<Bytes>>>,
}

/// A rank's handle into an in-process `World` of peers.
pub struct InProcessTransport {
    rank: usize,
    shared: Arc<Shared>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

/// Builds a set of [`InProcessTransport`] handles, one per rank, that can
/// all exchange point-to-point messages and participate in collectives.
#[must_use]
pub fn build_world(world_size: usize) -> Vec<InProcessTransport> {
    assert!(world_size > 0, "world must have at least one rank");
    let mut senders = Vec::with_capacity(world_size);
    let mut receivers = Vec::with_capacity(world_size);
    for _ in 0..world_size {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push(tx);
        receivers.push(rx);
    }
    let shared = Arc::new(Shared {
        inboxes: senders,
        barrier: TokioBarrier::new(world_size),
        reduce_slots: Mutex::new(vec![0.0; world_size]),
        gather_slots: Mutex::new(vec![None; world_size]),
    });
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, rx)| InProcessTransport {
            rank,
            shared: Arc::clone(&shared),
            inbox: Mutex::new(rx),
        })
        .collect()
}

impl InProcessTransport {
    async fn all_reduce(&self, value: f64, op: &ReduceOp) -> f64 {
        {
            let mut slots = self.shared.reduce_slots.lock().await;
            slots[self.rank] = value;
        }
        self.shared.barrier.wait().await;
        let result = {
            let slots = self.shared.reduce_slots.lock().await;
            fold(op, &slots)
        };
        self.shared.barrier.wait().await;
        result
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.inboxes.len()
    }

    async fn send(&self, dest: usize, tag: i32, payload: Bytes) -> Result<(), TransportError> {
        let inbox = self
            .shared
            .inboxes
            .get(dest)
            .ok_or(TransportError::NoSuchPeer(dest))?;
        inbox
            .send(Envelope {
                src: self.rank,
                tag,
                payload,
            })
            .map_err(|_| TransportError::ChannelClosed(dest))
    }

    async fn recv_any(&self) -> Result<Envelope, TransportError> {
        let mut rx = self.inbox.lock().await;
        rx.recv().await.ok_or(TransportError::ChannelClosed(self.rank))
    }

    async fn barrier(&self) {
        self.shared.barrier.wait().await;
    }

    async fn all_reduce_sum(&self, value: f64) -> f64 {
        self.all_reduce(value, &ReduceOp::Sum).await
    }

    async fn all_reduce_max(&self, value: f64) -> f64 {
        self.all_reduce(value, &ReduceOp::Max).await
    }

    async fn all_reduce_min(&self, value: f64) -> f64 {
        self.all_reduce(value, &ReduceOp::Min).await
    }

    async fn gather(&self, value: Bytes, root: usize) -> Option<Vec<Bytes>> {
        {
            let mut slots = self.shared.gather_slots.lock().await;
            slots[self.rank] = Some(value);
        }
        self.shared.barrier.wait().await;
        let result = if self.rank == root {
            let slots = self.shared.gather_slots.lock().await;
            Some(slots.iter().map(|v| v.clone().unwrap_or_default()).collect())
        } else {
            None
        };
        self.shared.barrier.wait().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reduce_sum_sees_all_ranks() {
        let world = build_world(4);
        let handles: Vec<_> = world
            .into_iter()
            .enumerate()
            .map(|(rank, t)| tokio::spawn(async move { t.all_reduce_sum(rank as f64).await }))
            .collect();
        for h in handles {
            let total = h.await.unwrap();
            assert!((total - 6.0).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn send_recv_delivers_payload() {
        let world = build_world(2);
        let mut iter = world.into_iter();
        let t0 = Arc::new(iter.next().unwrap());
        let t1 = Arc::new(iter.next().unwrap());
        t0.send(1, RMI_TAG, Bytes::from_static(b"hello")).await.unwrap();
        let env = t1.recv_any().await.unwrap();
        assert_eq!(env.src, 0);
        assert_eq!(&env.payload[..], b"hello");
    }
}
