// src/transport/memory.rs

//! In-process broker implementation.
//!
//! This file contains the reference implementation of [`MessageChannel`]
//! using in-process data structures only. It simulates the broker behaviors
//! the RPC layer depends on — queues, ack/reject/requeue with redelivery
//! marking, per-channel prefetch, and channel events — without network or
//! timing variability.
//!
//! ## Semantics
//!
//! - Queues are created on first assertion (or first publish).
//! - Deliveries round-robin across consumers of a queue.
//! - A channel with prefetch N receives at most N unacknowledged deliveries.
//! - `reject(requeue: true)` puts the message back at the head of the queue
//!   with `redelivered` set.
//! - Closing a channel requeues its unacknowledged deliveries (redelivered)
//!   and emits `ChannelClosed` on its event stream.
//! - Acking or rejecting an unknown delivery tag is a no-op. A real broker
//!   would fail the channel; the test double stays permissive so fabricated
//!   deliveries can be used in unit tests.
//!
//! ## Test hooks
//!
//! [`MemoryBroker`] exposes `fail_next_publishes`, `block`, `unblock` and
//! `emit_drain` so the suite can exercise the backpressure and state-machine
//! paths that only a live broker would otherwise trigger.
//!
//! ## Non-Goals
//!
//! - Persistence or durability (the `durable` flag is recorded, not honored)
//! - Exact emulation of AMQP edge cases

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transport::{
    //
    BrokerHandle,
    ChannelEvent,
    ConsumeOptions,
    Delivery,
    MessageChannel,
    MessageProperties,
    PublishOutcome,
    QueueOptions,
};
use crate::Result;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is best-effort broker bookkeeping; a panicking task
/// cannot leave it in a state worse than a lost or duplicated delivery, which
/// the at-least-once contract already tolerates.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
struct StoredMessage {
    payload: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    rr_cursor: usize,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    prefetch: u16,
    unacked: HashMap<u64, Unacked>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

struct BrokerCore {
    queues: Mutex<HashMap<String, QueueState>>,
    channels: Mutex<HashMap<u64, ChannelState>>,
    next_tag: AtomicU64,
    next_channel_id: AtomicU64,
    fail_publishes: AtomicUsize,
}

/// In-process broker shared by every channel attached to it.
///
/// Cheap to clone (Arc-backed). A client and a service attached to the same
/// broker exchange messages exactly as they would through a real one.
#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<BrokerCore>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        // ---
        Self {
            core: Arc::new(BrokerCore {
                queues: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(0),
                next_channel_id: AtomicU64::new(0),
                fail_publishes: AtomicUsize::new(0),
            }),
        }
    }

    /// Open a new channel on this broker.
    pub fn attach(&self) -> BrokerHandle {
        // ---
        let channel_id = self.core.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        lock_ignore_poison(&self.core.channels).insert(
            channel_id,
            ChannelState {
                prefetch: 0,
                unacked: HashMap::new(),
                events: events_tx,
            },
        );

        BrokerHandle {
            channel: Arc::new(MemoryChannel {
                core: Arc::clone(&self.core),
                channel_id,
            }),
            events: events_rx,
        }
    }

    /// Make the next `n` publishes report a full send buffer.
    pub fn fail_next_publishes(&self, n: usize) {
        self.core.fail_publishes.fetch_add(n, Ordering::SeqCst);
    }

    /// Broadcast a broker-side block notification to every channel.
    pub fn block(&self) {
        self.core.broadcast(ChannelEvent::Blocked);
    }

    /// Broadcast a broker-side unblock notification to every channel.
    pub fn unblock(&self) {
        self.core.broadcast(ChannelEvent::Unblocked);
    }

    /// Broadcast a drain signal (send buffer has room again).
    pub fn emit_drain(&self) {
        self.core.broadcast(ChannelEvent::Drain);
    }

    /// Number of messages sitting ready in a queue.
    pub fn queue_len(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.core.queues)
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }
}

impl BrokerCore {
    fn broadcast(&self, event: ChannelEvent) {
        // ---
        for state in lock_ignore_poison(&self.channels).values() {
            let _ = state.events.send(event.clone());
        }
    }

    /// Deliver ready messages to eligible consumers of one queue.
    ///
    /// Delivery respects per-channel prefetch: a channel with N unacked
    /// deliveries and prefetch N is skipped until it acks or rejects.
    fn pump(&self, queue_name: &str) {
        // Lock order: queues, then channels.
        let mut queues = lock_ignore_poison(&self.queues);
        let mut channels = lock_ignore_poison(&self.channels);

        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        loop {
            queue.consumers.retain(|c| !c.tx.is_closed());
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                break;
            }

            let count = queue.consumers.len();
            let mut chosen = None;
            for i in 0..count {
                let idx = (queue.rr_cursor + i) % count;
                let slot = &queue.consumers[idx];
                if slot.no_ack {
                    chosen = Some(idx);
                    break;
                }
                let eligible = channels
                    .get(&slot.channel_id)
                    .map(|ch| ch.prefetch == 0 || (ch.unacked.len() as u16) < ch.prefetch)
                    .unwrap_or(false);
                if eligible {
                    chosen = Some(idx);
                    break;
                }
            }

            let Some(idx) = chosen else {
                // Every consumer is at its prefetch limit.
                break;
            };
            queue.rr_cursor = (idx + 1) % count;

            let message = queue.ready.pop_front().expect("ready checked non-empty");
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
            let slot = &queue.consumers[idx];

            if !slot.no_ack {
                if let Some(ch) = channels.get_mut(&slot.channel_id) {
                    ch.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue_name.to_string(),
                            message: message.clone(),
                        },
                    );
                }
            }

            let delivery = Delivery {
                payload: message.payload.clone(),
                properties: message.properties.clone(),
                delivery_tag: tag,
                redelivered: message.redelivered,
                source_queue: queue_name.to_string(),
            };

            if slot.tx.send(delivery).is_err() {
                // Consumer dropped between retain and send; put the message
                // back and let the next retain sweep remove the slot.
                if let Some(ch) = channels.get_mut(&slot.channel_id) {
                    ch.unacked.remove(&tag);
                }
                queue.ready.push_front(message);
            }
        }
    }
}

struct MemoryChannel {
    core: Arc<BrokerCore>,
    channel_id: u64,
}

#[async_trait::async_trait]
impl MessageChannel for MemoryChannel {
    // ---
    async fn assert_queue(&self, name: &str, _opts: &QueueOptions) -> Result<()> {
        // ---
        lock_ignore_poison(&self.core.queues)
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Bytes,
        props: MessageProperties,
    ) -> Result<PublishOutcome> {
        // ---
        let failing = self
            .core
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Ok(PublishOutcome::BufferFull);
        }

        {
            let mut queues = lock_ignore_poison(&self.core.queues);
            queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(StoredMessage {
                    payload,
                    properties: props,
                    redelivered: false,
                });
        }

        self.core.pump(queue);
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut queues = lock_ignore_poison(&self.core.queues);
            queues
                .entry(queue.to_string())
                .or_default()
                .consumers
                .push(ConsumerSlot {
                    channel_id: self.channel_id,
                    no_ack: opts.no_ack,
                    tx,
                });
        }

        self.core.pump(queue);
        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        let queue = {
            let mut channels = lock_ignore_poison(&self.core.channels);
            channels
                .get_mut(&self.channel_id)
                .and_then(|ch| ch.unacked.remove(&delivery_tag))
                .map(|u| u.queue)
        };

        if let Some(queue) = queue {
            self.core.pump(&queue);
        }
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        // ---
        let unacked = {
            let mut channels = lock_ignore_poison(&self.core.channels);
            channels
                .get_mut(&self.channel_id)
                .and_then(|ch| ch.unacked.remove(&delivery_tag))
        };

        let Some(unacked) = unacked else {
            return Ok(());
        };

        if requeue {
            let mut queues = lock_ignore_poison(&self.core.queues);
            queues
                .entry(unacked.queue.clone())
                .or_default()
                .ready
                .push_front(StoredMessage {
                    redelivered: true,
                    ..unacked.message
                });
        }

        self.core.pump(&unacked.queue);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        // ---
        if let Some(ch) = lock_ignore_poison(&self.core.channels).get_mut(&self.channel_id) {
            ch.prefetch = count;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        let mut touched = Vec::new();

        {
            // Lock order: queues, then channels.
            let mut queues = lock_ignore_poison(&self.core.queues);
            let mut channels = lock_ignore_poison(&self.core.channels);

            for (name, queue) in queues.iter_mut() {
                let before = queue.consumers.len();
                queue.consumers.retain(|c| c.channel_id != self.channel_id);
                if queue.consumers.len() != before {
                    touched.push(name.clone());
                }
            }

            if let Some(state) = channels.remove(&self.channel_id) {
                for (_, unacked) in state.unacked {
                    queues
                        .entry(unacked.queue.clone())
                        .or_default()
                        .ready
                        .push_front(StoredMessage {
                            redelivered: true,
                            ..unacked.message
                        });
                    touched.push(unacked.queue);
                }
                let _ = state.events.send(ChannelEvent::ChannelClosed);
            }
        }

        touched.sort();
        touched.dedup();
        for queue in touched {
            self.core.pump(&queue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn props_with_id(id: &str) -> MessageProperties {
        MessageProperties {
            message_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_then_consume_delivers() {
        // ---
        let broker = MemoryBroker::new();
        let handle = broker.attach();

        handle
            .channel
            .assert_queue("q", &QueueOptions::default())
            .await
            .unwrap();
        handle
            .channel
            .publish("q", Bytes::from(json!({"n": 1}).to_string()), props_with_id("m1"))
            .await
            .unwrap();

        let mut rx = handle
            .channel
            .consume("q", &ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = rx.recv().await.unwrap();

        assert_eq!(delivery.properties.message_id.as_deref(), Some("m1"));
        assert!(!delivery.redelivered);
        assert_eq!(delivery.source_queue, "q");
    }

    #[tokio::test]
    async fn prefetch_one_holds_second_delivery_until_ack() {
        // ---
        let broker = MemoryBroker::new();
        let handle = broker.attach();
        let ch = &handle.channel;

        ch.assert_queue("q", &QueueOptions::default()).await.unwrap();
        ch.set_prefetch(1).await.unwrap();

        ch.publish("q", Bytes::from_static(b"{}"), props_with_id("a"))
            .await
            .unwrap();
        ch.publish("q", Bytes::from_static(b"{}"), props_with_id("b"))
            .await
            .unwrap();

        let mut rx = ch.consume("q", &ConsumeOptions::default()).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.properties.message_id.as_deref(), Some("a"));

        // Second message must be held back until the first is acked.
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.queue_len("q"), 1);

        ch.ack(first.delivery_tag).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.properties.message_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn reject_with_requeue_marks_redelivered() {
        // ---
        let broker = MemoryBroker::new();
        let handle = broker.attach();
        let ch = &handle.channel;

        ch.assert_queue("q", &QueueOptions::default()).await.unwrap();
        ch.publish("q", Bytes::from_static(b"{}"), props_with_id("a"))
            .await
            .unwrap();

        let mut rx = ch.consume("q", &ConsumeOptions::default()).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert!(!first.redelivered);

        ch.reject(first.delivery_tag, true).await.unwrap();
        let again = rx.recv().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.properties.message_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn failed_publish_reports_buffer_full_and_drops_message() {
        // ---
        let broker = MemoryBroker::new();
        let handle = broker.attach();
        let ch = &handle.channel;

        broker.fail_next_publishes(1);
        let outcome = ch
            .publish("q", Bytes::from_static(b"{}"), MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::BufferFull);
        assert_eq!(broker.queue_len("q"), 0);

        let outcome = ch
            .publish("q", Bytes::from_static(b"{}"), MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Accepted);
        assert_eq!(broker.queue_len("q"), 1);
    }

    #[tokio::test]
    async fn close_requeues_unacked_and_emits_event() {
        // ---
        let broker = MemoryBroker::new();
        let mut producer = broker.attach();
        let consumer = broker.attach();

        producer
            .channel
            .publish("q", Bytes::from_static(b"{}"), props_with_id("a"))
            .await
            .unwrap();

        let mut rx = consumer
            .channel
            .consume("q", &ConsumeOptions::default())
            .await
            .unwrap();
        let _delivery = rx.recv().await.unwrap();

        consumer.channel.close().await.unwrap();
        assert_eq!(broker.queue_len("q"), 1);

        // Unrelated channels see nothing; drain producer's events to prove it.
        assert!(producer.events.try_recv().is_err());
    }
}
