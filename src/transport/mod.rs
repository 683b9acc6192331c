// src/transport/mod.rs

//! Broker channel abstraction.
//!
//! This module defines the seam between the RPC layer and a concrete message
//! broker: one logical channel over one connection, with durable queues,
//! publish, consume, ack/reject/requeue and prefetch. Transport-level signals
//! (broker block/unblock, drain, closure) arrive out-of-band as
//! [`ChannelEvent`]s so the adapter can drive its connection state machine.
//!
//! Concrete implementations live in this module's submodules:
//! - `amqp` — lapin-backed AMQP channel (feature `amqp`)
//! - `memory` — in-process reference broker used by the test suite
//!
//! The channel itself makes no RPC-level guarantees. Correlation, sealing,
//! retries and timeouts are layered on top by the adapter, client and service.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Result;

/// AMQP-style message properties.
///
/// Only the properties the RPC protocol actually uses are modeled. `kind`
/// maps to the AMQP `type` property and carries the service action name.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub app_id: Option<String>,
    /// Milliseconds since the epoch.
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub persistent: Option<bool>,
    pub headers: HashMap<String, Value>,
}

/// One delivered message, as handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Bytes,
    pub properties: MessageProperties,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Queue this message was consumed from.
    pub source_queue: String,
}

/// Queue assertion options.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Consume options.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// When set, deliveries are auto-acknowledged by the broker and must not
    /// be acked or rejected by the application.
    pub no_ack: bool,
}

/// Result of a publish attempt.
///
/// `BufferFull` is an internal backpressure signal, never surfaced as an
/// error: the adapter transitions to `blocked` and retries after the next
/// unlock signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    BufferFull,
}

/// Transport-level signals driving the adapter's connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Blocked,
    Unblocked,
    Drain,
    ConnectionClosed,
    ChannelClosed,
    ConnectionError(String),
    ChannelError(String),
}

/// One broker channel.
///
/// Implementations must ensure that:
/// - once `consume()` returns, matching deliveries flow into the returned
///   receiver until the channel closes;
/// - `ack`/`reject` address deliveries by tag, exactly once each;
/// - `publish` reports `BufferFull` instead of blocking when the send buffer
///   is saturated.
#[async_trait::async_trait]
pub trait MessageChannel: Send + Sync {
    /// Assert that a queue exists, creating it with the given options.
    async fn assert_queue(&self, name: &str, opts: &QueueOptions) -> Result<()>;

    /// Publish a message to a queue (default exchange semantics).
    async fn publish(
        &self,
        queue: &str,
        payload: Bytes,
        props: MessageProperties,
    ) -> Result<PublishOutcome>;

    /// Start consuming a queue. Deliveries arrive on the returned receiver.
    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject a delivery, optionally requeueing it.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Bound the number of unacknowledged deliveries pushed concurrently.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<()>;
}

/// Shared channel pointer.
pub type ChannelPtr = Arc<dyn MessageChannel>;

/// A freshly opened channel plus its event stream.
///
/// Returned by transport factories; consumed by
/// [`TransportAdapter::new`](crate::TransportAdapter::new), which owns the
/// event stream for the lifetime of the connection.
pub struct BrokerHandle {
    pub channel: ChannelPtr,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}
