//! Reliable Messaging Layer (spec.md §4.1): one background I/O task per
//! process drains a stream of short active messages, enforcing per-peer
//! FIFO ordering when requested, and splits oversized payloads off to a
//! rendezvous huge-message side channel.

pub mod config;

use crate::abort_fatal;
use crate::error::RmlError;
use crate::transport::{Envelope, RMI_HUGE_ACK_TAG, RMI_HUGE_DAT_TAG, RMI_TAG, Transport};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use config::RmlConfig;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, instrument, warn};

const ORDERED_BIT: u32 = 1;
/// Sentinel handler id marking an eager frame as a huge-message control
/// record rather than user payload.
const HUGE_CONTROL_HANDLER: u32 = u32::MAX;
/// Bound on how many out-of-order messages may be parked per peer before
/// the queue overflow is treated as a fatal contract violation.
const MAX_PARKED_PER_PEER: usize = 4096;

/// Running counters spec.md §4.1 lists.
#[derive(Default)]
pub struct RmlStats {
    /// Messages sent.
    pub nmsg_sent: AtomicU64,
    /// Bytes sent.
    pub nbyte_sent: AtomicU64,
    /// Messages received.
    pub nmsg_recv: AtomicU64,
    /// Bytes received.
    pub nbyte_recv: AtomicU64,
}

/// Whether a message must preserve FIFO order relative to other ordered
/// messages between the same source/destination pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderingClass {
    /// Arbitrary delivery order.
    Unordered,
    /// Per source/destination pair, delivered in send order.
    Ordered,
}

type Handler = Arc<dyn Fn(usize, Bytes) + Send + Sync>;

struct HugeSlot {
    tx_ack: oneshot::Sender<()>,
}

/// Per-process reliable messaging state.
pub struct Rml {
    rank: usize,
    transport: Arc<dyn Transport>,
    config: RmlConfig,
    send_counters: DashMap<usize, AtomicU16>,
    recv_counters: DashMap<usize, u16>,
    parked: DashMap<usize, VecDeque<(u16, u32, Bytes)>>,
    send_mutex: Mutex<()>,
    huge_queue: Arc<Mutex<VecDeque<(usize, usize)>>>,
    huge_acks: DashMap<u64, HugeSlot>,
    next_huge_id: AtomicU64,
    handlers: DashMap<u32, Handler>,
    finished: Arc<AtomicBool>,
    stats: RmlStats,
}

impl Rml {
    /// Build an RML instance over `transport`, reading configuration from
    /// the environment (spec.md §4.1).
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_config(transport, RmlConfig::from_env())
    }

    /// Build an RML instance with an explicit configuration (used by tests
    /// to pick a small `max_msg_len` and exercise the huge-message path).
    #[must_use]
    pub fn with_config(transport: Arc<dyn Transport>, config: RmlConfig) -> Arc<Self> {
        Arc::new(Self {
            rank: transport.rank(),
            transport,
            config,
            send_counters: DashMap::new(),
            recv_counters: DashMap::new(),
            parked: DashMap::new(),
            send_mutex: Mutex::new(()),
            huge_queue: Arc::new(Mutex::new(VecDeque::new())),
            huge_acks: DashMap::new(),
            next_huge_id: AtomicU64::new(0),
            handlers: DashMap::new(),
            finished: Arc::new(AtomicBool::new(false)),
            stats: RmlStats::default(),
        })
    }

    /// Statistics accumulated so far.
    #[must_use]
    pub fn stats(&self) -> &RmlStats {
        &self.stats
    }

    /// This process's rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Register the handler invoked for messages addressed to `handler_id`.
    /// `process_pending` on the container layer relies on handlers being
    /// registered before traffic for them can be dispatched.
    pub fn register_handler(&self, handler_id: u32, f: Handler) {
        self.handlers.insert(handler_id, f);
    }

    /// Spawn `config.n_recv` concurrent tasks draining the transport — the
    /// posted eager receive buffer count from spec.md §4.1, scaled up from
    /// spec.md §5's "one dedicated I/O thread" baseline so more than one
    /// drain can be in flight against the shared inbox at a time. Returns
    /// the handle to one of them; callers that `.await` it (as `end`'s
    /// drain-then-exit callers do) still observe the whole group's work
    /// finish, since every task exits on the same `finished` flag.
    pub fn spawn_io_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        for _ in 1..self.config.n_recv {
            let extra = Arc::clone(self);
            tokio::spawn(async move { extra.io_loop().await });
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.io_loop().await })
    }

    async fn io_loop(self: Arc<Self>) {
        loop {
            if self.finished.load(Ordering::Acquire) {
                debug!(rank = self.rank, "RML I/O loop exiting");
                return;
            }
            let recv_fut = self.transport.recv_any();
            let envelope = tokio::select! {
                biased;
                () = tokio::time::sleep(std::time::Duration::from_millis(20)) => continue,
                result = recv_fut => match result {
                    Ok(e) => e,
                    Err(_) => return,
                },
            };
            self.on_envelope(envelope).await;
        }
    }

    async fn on_envelope(&self, envelope: Envelope) {
        match envelope.tag {
            RMI_TAG => self.on_eager(envelope),
            RMI_HUGE_DAT_TAG => self.on_huge_data(envelope),
            RMI_HUGE_ACK_TAG => self.on_huge_ack(envelope),
            other => warn!(tag = other, "unrecognized RML tag"),
        }
    }

    fn on_eager(&self, envelope: Envelope) {
        self.stats.nmsg_recv.fetch_add(1, Ordering::Relaxed);
        self.stats
            .nbyte_recv
            .fetch_add(envelope.payload.len() as u64, Ordering::Relaxed);
        let mut buf = envelope.payload;
        let handler_id = buf.get_u32();
        let attr = buf.get_u32();
        let payload = buf;

        if handler_id == HUGE_CONTROL_HANDLER {
            let mut p = payload;
            let id = p.get_u64();
            let nbyte = p.get_u64() as usize;
            self.on_huge_control(envelope.src, id, nbyte);
            return;
        }

        if attr & ORDERED_BIT == 0 {
            self.dispatch(handler_id, envelope.src, payload);
            return;
        }
        let seq = (attr >> 16) as u16;
        self.deliver_ordered(envelope.src, seq, handler_id, payload);
    }

    fn deliver_ordered(&self, src: usize, seq: u16, handler_id: u32, payload: Bytes) {
        let expected = *self.recv_counters.get(&src).map(|r| *r).get_or_insert(0);
        if seq == expected {
            self.dispatch(handler_id, src, payload);
            self.recv_counters.insert(src, expected.wrapping_add(1));
            self.drain_parked(src);
        } else {
            let mut queue = self.parked.entry(src).or_default();
            if queue.len() >= MAX_PARKED_PER_PEER {
                drop(queue);
                abort_fatal!("{}", RmlError::QueueOverflow(src));
            }
            queue.push_back((seq, handler_id, payload));
        }
    }

    fn drain_parked(&self, src: usize) {
        loop {
            let mut queue = match self.parked.get_mut(&src) {
                Some(q) => q,
                None => return,
            };
            if queue.is_empty() {
                return;
            }
            let mut items: Vec<_> = queue.drain(..).collect();
            items.sort_by_key(|(seq, _, _)| *seq);
            drop(queue);
            let expected = *self.recv_counters.get(&src).map(|r| *r).get_or_insert(0);
            let mut next_expected = expected;
            let mut leftover = Vec::new();
            for (seq, handler_id, payload) in items.drain(..) {
                if seq == next_expected {
                    self.dispatch(handler_id, src, payload);
                    next_expected = next_expected.wrapping_add(1);
                } else {
                    leftover.push((seq, handler_id, payload));
                }
            }
            self.recv_counters.insert(src, next_expected);
            if leftover.is_empty() {
                return;
            }
            let mut queue = self.parked.entry(src).or_default();
            for item in leftover {
                queue.push_back(item);
            }
            if next_expected == expected {
                // Nothing progressed this pass; stop to avoid spinning.
                return;
            }
        }
    }

    fn dispatch(&self, handler_id: u32, src: usize, payload: Bytes) {
        if let Some(handler) = self.handlers.get(&handler_id) {
            handler(src, payload);
        } else {
            warn!(handler_id, src, "no handler registered; dropping message");
        }
    }

    fn on_huge_control(&self, src: usize, id: u64, nbyte: usize) {
        // Spec.md §4.1: enqueue (src, nbyte), then allocate a buffer and ACK
        // once a slot is free. This reference transport has no bound on
        // concurrent huge transfers, so the FIFO below always drains
        // immediately — it exists to make the rendezvous shape explicit and
        // to give `huge_pending_count` something real to report.
        let transport = Arc::clone(&self.transport);
        let queue = self.huge_queue.clone();
        tokio::spawn(async move {
            {
                let mut q = queue.lock().await;
                q.push_back((src, nbyte));
            }
            let mut ack = BytesMut::with_capacity(8);
            ack.put_u64(id);
            let _ = transport.send(src, RMI_HUGE_ACK_TAG, ack.freeze()).await;
            {
                let mut q = queue.lock().await;
                if let Some(pos) = q.iter().position(|(s, n)| *s == src && *n == nbyte) {
                    q.remove(pos);
                }
            }
        });
    }

    fn on_huge_data(&self, envelope: Envelope) {
        self.stats.nmsg_recv.fetch_add(1, Ordering::Relaxed);
        self.stats
            .nbyte_recv
            .fetch_add(envelope.payload.len() as u64, Ordering::Relaxed);
        let mut buf = envelope.payload;
        let handler_id = buf.get_u32();
        let _attr = buf.get_u32();
        self.dispatch(handler_id, envelope.src, buf);
    }

    fn on_huge_ack(&self, envelope: Envelope) {
        let mut buf = envelope.payload;
        let id = buf.get_u64();
        if let Some((_, slot)) = self.huge_acks.remove(&id) {
            let _ = slot.tx_ack.send(());
        }
    }

    /// Send `(handler_id, attr, payload)` to `dest` (spec.md §4.1).
    ///
    /// Payloads at or below `MAX_MSG_LEN` take the eager path; larger
    /// payloads go through the huge-message rendezvous.
    #[instrument(skip(self, payload))]
    pub async fn send(
        &self,
        dest: usize,
        handler_id: u32,
        ordering: OrderingClass,
        payload: Bytes,
    ) -> Result<(), RmlError> {
        let header_len = 8;
        if payload.len() + header_len <= self.config.max_msg_len {
            self.send_eager(dest, handler_id, ordering, payload).await
        } else {
            self.send_huge(dest, handler_id, payload).await
        }
    }

    async fn send_eager(
        &self,
        dest: usize,
        handler_id: u32,
        ordering: OrderingClass,
        payload: Bytes,
    ) -> Result<(), RmlError> {
        let guard = self.send_mutex.lock().await;
        let attr: u32 = match ordering {
            OrderingClass::Unordered => 0,
            OrderingClass::Ordered => {
                let counter = self
                    .send_counters
                    .entry(dest)
                    .or_insert_with(|| AtomicU16::new(0));
                let seq = counter.fetch_add(1, Ordering::AcqRel);
                ORDERED_BIT | (u32::from(seq) << 16)
            }
        };
        let mut framed = BytesMut::with_capacity(8 + payload.len());
        framed.put_u32(handler_id);
        framed.put_u32(attr);
        framed.put_slice(&payload);
        self.transport
            .send(dest, RMI_TAG, framed.freeze())
            .await
            .map_err(RmlError::from)?;
        drop(guard);
        self.stats.nmsg_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .nbyte_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn send_huge(&self, dest: usize, handler_id: u32, payload: Bytes) -> Result<(), RmlError> {
        let id = self.next_huge_id.fetch_add(1, Ordering::Relaxed);
        let (tx_ack, rx_ack) = oneshot::channel();
        self.huge_acks.insert(id, HugeSlot { tx_ack });

        let mut control = BytesMut::with_capacity(24);
        control.put_u32(HUGE_CONTROL_HANDLER);
        control.put_u32(0);
        control.put_u64(id);
        control.put_u64(payload.len() as u64);
        self.transport
            .send(dest, RMI_TAG, control.freeze())
            .await
            .map_err(RmlError::from)?;

        rx_ack
            .await
            .map_err(|_| RmlError::Transport(crate::error::TransportError::ChannelClosed(dest)))?;

        let mut framed = BytesMut::with_capacity(8 + payload.len());
        framed.put_u32(handler_id);
        framed.put_u32(0);
        framed.put_slice(&payload);
        self.transport
            .send(dest, RMI_HUGE_DAT_TAG, framed.freeze())
            .await
            .map_err(RmlError::from)?;
        self.stats.nmsg_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .nbyte_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Signal the I/O task to exit and briefly yield so it can observe the
    /// flag before this call returns (spec.md §4.1).
    pub async fn end(&self) {
        self.finished.store(true, Ordering::Release);
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::build_world;
    use std::sync::Mutex as StdMutex;

    const ECHO_HANDLER: u32 = 7;

    #[tokio::test]
    async fn ordered_messages_arrive_in_send_order() {
        let world = build_world(2);
        let mut iter = world.into_iter();
        let t0: Arc<dyn Transport> = Arc::new(iter.next().unwrap());
        let t1: Arc<dyn Transport> = Arc::new(iter.next().unwrap());

        let rml0 = Rml::new(Arc::clone(&t0));
        let rml1 = Rml::new(Arc::clone(&t1));
        let _io0 = rml0.spawn_io_task();
        let io1 = rml1.spawn_io_task();

        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        rml1.register_handler(
            ECHO_HANDLER,
            Arc::new(move |_src, payload| {
                let n = u32::from_be_bytes(payload[..4].try_into().unwrap());
                received_clone.lock().unwrap().push(n);
            }),
        );

        const N: u32 = 500;
        for i in 0..N {
            rml0
                .send(1, ECHO_HANDLER, OrderingClass::Ordered, Bytes::copy_from_slice(&i.to_be_bytes()))
                .await
                .unwrap();
        }
        // Give the receiver's I/O loop time to drain everything.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        rml0.end().await;
        rml1.end().await;
        io1.await.unwrap();

        let got = received.lock().unwrap().clone();
        let expected: Vec<u32> = (0..N).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn huge_message_round_trips_byte_for_byte() {
        let world = build_world(2);
        let mut iter = world.into_iter();
        let t0: Arc<dyn Transport> = Arc::new(iter.next().unwrap());
        let t1: Arc<dyn Transport> = Arc::new(iter.next().unwrap());

        let small_cfg = RmlConfig {
            max_msg_len: 64,
            n_recv: 2,
        };
        let rml0 = Rml::with_config(Arc::clone(&t0), small_cfg);
        let rml1 = Rml::with_config(Arc::clone(&t1), small_cfg);
        let _io0 = rml0.spawn_io_task();
        let io1 = rml1.spawn_io_task();

        let received: Arc<StdMutex<Option<Bytes>>> = Arc::new(StdMutex::new(None));
        let received_clone = Arc::clone(&received);
        rml1.register_handler(
            ECHO_HANDLER,
            Arc::new(move |_src, payload| {
                *received_clone.lock().unwrap() = Some(payload);
            }),
        );

        let payload: Bytes = (0..small_cfg.max_msg_len + 1).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
        rml0.send(1, ECHO_HANDLER, OrderingClass::Unordered, payload.clone()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        rml0.end().await;
        rml1.end().await;
        io1.await.unwrap();

        let got = received.lock().unwrap().clone().expect("message not received");
        assert_eq!(got, payload);
    }
}
