// src/transport/amqp.rs

//! AMQP channel implementation using `lapin`.
//!
//! One [`connect`] call maps to one broker connection plus one channel, the
//! unit the adapter expects. Connection failures and broker-side errors are
//! surfaced as [`ChannelEvent`]s on the returned handle; the adapter owns the
//! resulting state machine.
//!
//! ## Backpressure
//!
//! lapin buffers outbound frames internally, so a saturated send buffer shows
//! up as the connection entering the broker-blocked state rather than a
//! failed write. `publish` reports [`PublishOutcome::BufferFull`] whenever
//! the connection is blocked at publish time; the adapter then waits for the
//! unblock notification before retrying.
//!
//! ## Scope
//!
//! Messages are published to the default exchange with the queue name as
//! routing key. Exchanges, bindings and publisher confirms are intentionally
//! outside this module's surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::{
    //
    options::{
        //
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        BasicRejectOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::macros::{log_debug, log_error, log_info};
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
use crate::{ConnectParams, Result, RpcError};

/// Connect to an AMQP broker and open one channel.
///
/// # Errors
///
/// Returns an error if the connection params do not resolve to a URI, the
/// connection fails, or the channel cannot be created.
pub async fn connect(params: &ConnectParams) -> Result<BrokerHandle> {
    // ---
    let uri = ConnectParams::merge(Some(params), None)?.to_uri()?;

    log_info!("Connecting to AMQP broker: {uri}");

    let connection = Connection::connect(&uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            RpcError::Transport(msg)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::Transport(msg)
    })?;

    log_info!("Connected to AMQP broker");

    let (events_tx, events_rx) = mpsc::unbounded_channel();

    {
        let events_tx = events_tx.clone();
        connection.on_error(move |err| {
            let _ = events_tx.send(ChannelEvent::ConnectionError(err.to_string()));
            let _ = events_tx.send(ChannelEvent::ConnectionClosed);
        });
    }

    Ok(BrokerHandle {
        channel: Arc::new(AmqpChannel {
            connection,
            channel,
            events_tx,
            draining: Arc::new(AtomicBool::new(false)),
        }),
        events: events_rx,
    })
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    /// True while a drain poller task is running.
    draining: Arc<AtomicBool>,
}

impl AmqpChannel {
    /// lapin exposes the broker-blocked flag but no unblock callback, so the
    /// first blocked publish starts a poller that emits [`ChannelEvent::Drain`]
    /// once the flag clears.
    fn spawn_drain_poller(&self) {
        // ---
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let status = self.connection.status().clone();
        let events_tx = self.events_tx.clone();
        let draining = Arc::clone(&self.draining);
        tokio::spawn(async move {
            while status.blocked() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            draining.store(false, Ordering::SeqCst);
            let _ = events_tx.send(ChannelEvent::Drain);
        });
    }
}

#[async_trait::async_trait]
impl MessageChannel for AmqpChannel {
    // ---
    async fn assert_queue(&self, name: &str, opts: &QueueOptions) -> Result<()> {
        // ---
        let declare = QueueDeclareOptions {
            durable: opts.durable,
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            ..QueueDeclareOptions::default()
        };

        self.channel
            .queue_declare(name, declare, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        log_debug!("Declared queue: {name}");
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Bytes,
        props: MessageProperties,
    ) -> Result<PublishOutcome> {
        // ---
        if self.connection.status().blocked() {
            self.spawn_drain_poller();
            return Ok(PublishOutcome::BufferFull);
        }

        self.channel
            .basic_publish(
                "", // default exchange
                queue,
                BasicPublishOptions::default(),
                &payload,
                to_amqp_properties(&props),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!("Published to queue: {queue}");
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        // ---
        let consume = BasicConsumeOptions {
            no_ack: opts.no_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("{queue}-consumer"),
                consume,
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let events_tx = self.events_tx.clone();
        let queue = queue.to_string();

        tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        if tx.send(from_amqp_delivery(delivery)).is_err() {
                            // Local consumer dropped; stop pulling.
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("amqp: consumer error on {queue}: {e}");
                        let _ = events_tx.send(ChannelEvent::ChannelError(e.to_string()));
                        break;
                    }
                }
            }

            log_debug!("amqp: consumer task ended for queue: {queue}");
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        self.channel
            .basic_ack(delivery_tag, Default::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        // ---
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: reject failed: {e}")))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: basic_qos failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        // ---
        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;
        Ok(())
    }
}

fn to_amqp_properties(props: &MessageProperties) -> BasicProperties {
    // ---
    let mut bp = BasicProperties::default();

    if let Some(v) = &props.message_id {
        bp = bp.with_message_id(v.as_str().into());
    }
    if let Some(v) = &props.correlation_id {
        bp = bp.with_correlation_id(v.as_str().into());
    }
    if let Some(v) = &props.reply_to {
        bp = bp.with_reply_to(v.as_str().into());
    }
    if let Some(v) = &props.kind {
        bp = bp.with_kind(v.as_str().into());
    }
    if let Some(v) = &props.app_id {
        bp = bp.with_app_id(v.as_str().into());
    }
    if let Some(v) = props.timestamp {
        bp = bp.with_timestamp(v);
    }
    if let Some(v) = &props.content_type {
        bp = bp.with_content_type(v.as_str().into());
    }
    if let Some(v) = &props.content_encoding {
        bp = bp.with_content_encoding(v.as_str().into());
    }
    if let Some(v) = &props.expiration {
        bp = bp.with_expiration(v.as_str().into());
    }
    if let Some(v) = props.priority {
        bp = bp.with_priority(v);
    }
    if let Some(persistent) = props.persistent {
        bp = bp.with_delivery_mode(if persistent { 2 } else { 1 });
    }
    if !props.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &props.headers {
            table.insert(key.as_str().into(), to_amqp_value(value));
        }
        bp = bp.with_headers(table);
    }

    bp
}

fn from_amqp_delivery(delivery: lapin::message::Delivery) -> Delivery {
    // ---
    let props = &delivery.properties;

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), from_amqp_value(v)))
                .collect()
        })
        .unwrap_or_default();

    let properties = MessageProperties {
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
        kind: props.kind().as_ref().map(|s| s.as_str().to_string()),
        app_id: props.app_id().as_ref().map(|s| s.as_str().to_string()),
        timestamp: *props.timestamp(),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        content_encoding: props.content_encoding().as_ref().map(|s| s.as_str().to_string()),
        expiration: props.expiration().as_ref().map(|s| s.as_str().to_string()),
        priority: *props.priority(),
        persistent: props.delivery_mode().map(|mode| mode == 2),
        headers,
    };

    Delivery {
        source_queue: delivery.routing_key.as_str().to_string(),
        payload: Bytes::from(delivery.data),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        properties,
    }
}

/// Header values the protocol uses are strings, integers and booleans;
/// anything richer is carried as its JSON text.
fn to_amqp_value(value: &Value) -> AMQPValue {
    // ---
    match value {
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) if n.is_i64() => AMQPValue::LongLongInt(n.as_i64().unwrap_or_default()),
        Value::Number(n) => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        Value::Null => AMQPValue::Void,
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    // ---
    match value {
        AMQPValue::LongString(s) => {
            Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::Double(n) => Value::from(*n),
        AMQPValue::Float(n) => Value::from(*n as f64),
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{other:?}")),
    }
}
