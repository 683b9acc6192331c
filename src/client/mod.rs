// src/client/mod.rs

//! RPC client: correlated requests over a private reply queue.
//!
//! Each [`RpcClient`] targets one service queue (`"{service}-v{version}"`)
//! and consumes its own exclusive, non-durable reply queue
//! (`"{service}-v{version}-reply-{uuid}"`) with no-ack semantics. Requests
//! carry a fresh message id, which the service mirrors into the reply; a
//! pending-call table maps that id to the waiting caller, and the matching
//! reply resolves it. Replies are matched purely by id, so out-of-order
//! replies are fine; a reply with no pending entry is silently dropped.
//!
//! A timed-out call removes its pending entry immediately. The service-side
//! processing is unaffected (at-least-once semantics); its late reply finds
//! no entry and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, OnceCell};
use uuid::Uuid;

use crate::adapter::{message_handler, TransportAdapter, DEFAULT_DISCONNECT_TIMEOUT};
use crate::envelope::{MessageEnvelope, RETRY_LIMIT_HEADER};
use crate::macros::log_debug;
use crate::reply::{ErrorObject, ReplyEnvelope};
use crate::service::service_queue_name;
use crate::transport::{BrokerHandle, ConsumeOptions, MessageProperties, QueueOptions};
use crate::{ConnectParams, ErrorObserver, Result, RpcError};

/// Client configuration.
#[derive(Clone)]
pub struct RpcClientOptions {
    /// Target service name.
    pub service: String,
    pub version: String,
    /// Must match the service's queue declaration.
    pub durable: bool,
    pub connect_params: ConnectParams,
    /// Default bound on waiting for a reply; `None` waits indefinitely.
    pub default_wait_response_timeout: Option<Duration>,
    /// When set, every request carries this retry budget unless the call
    /// overrides it.
    pub default_retry_limit: Option<i64>,
    pub graceful_stop_timeout: Duration,
}

impl RpcClientOptions {
    pub fn new(service: impl Into<String>) -> Self {
        // ---
        Self {
            service: service.into(),
            version: "1".to_string(),
            durable: true,
            connect_params: ConnectParams::default(),
            default_wait_response_timeout: Some(Duration::from_secs(30)),
            default_retry_limit: None,
            graceful_stop_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Overrides the client-wide reply timeout for this call.
    pub wait_response_timeout: Option<Duration>,
    /// Application-level retry budget for this request.
    pub retry_limit: Option<i64>,
    pub correlation_id: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub persistent: Option<bool>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: HashMap<String, Value>,
}

type PendingReply = oneshot::Sender<std::result::Result<Value, ErrorObject>>;

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn now_millis() -> u64 {
    // ---
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct ClientInner {
    options: RpcClientOptions,
    observer: ErrorObserver,
    adapter: OnceCell<TransportAdapter>,
    reply_queue: String,
    pending: Mutex<HashMap<String, PendingReply>>,
}

impl ClientInner {
    fn take_pending(&self, id: &str) -> Option<PendingReply> {
        lock_ignore_poison(&self.pending).remove(id)
    }

    /// Resolve the pending call a reply belongs to.
    ///
    /// The service mirrors the request's `messageId` into the reply;
    /// anything that does not match a pending entry is dropped.
    fn handle_reply(&self, envelope: &MessageEnvelope) -> Result<()> {
        // ---
        let reply: ReplyEnvelope = serde_json::from_slice(&envelope.payload_as_bytes())?;

        let Some(id) = envelope.id() else {
            log_debug!("dropping reply without a message id");
            return Ok(());
        };
        let Some(tx) = self.take_pending(id) else {
            log_debug!("dropping reply for unknown call: {id}");
            return Ok(());
        };

        let outcome = match reply.error {
            Some(error) => Err(error),
            None => Ok(reply.payload),
        };
        // The caller may have timed out between lookup and send.
        let _ = tx.send(outcome);
        Ok(())
    }
}

/// RPC client for one service queue.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(options: RpcClientOptions, observer: ErrorObserver) -> Self {
        // ---
        let reply_queue = format!(
            "{}-reply-{}",
            service_queue_name(&options.service, &options.version),
            Uuid::new_v4()
        );

        Self {
            inner: Arc::new(ClientInner {
                options,
                observer,
                adapter: OnceCell::new(),
                reply_queue,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Target service queue.
    pub fn queue_name(&self) -> String {
        service_queue_name(&self.inner.options.service, &self.inner.options.version)
    }

    /// This client's private reply queue.
    pub fn reply_queue_name(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Adopt an already-opened broker handle instead of connecting.
    ///
    /// Spawns the adapter's event loop, so this must be called from within a
    /// tokio runtime.
    pub fn connect_with(&self, handle: BrokerHandle) -> Result<()> {
        // ---
        let adapter = TransportAdapter::new(handle, Arc::clone(&self.inner.observer));
        self.inner
            .adapter
            .set(adapter)
            .map_err(|_| RpcError::Config("broker connection already established".to_string()))
    }

    #[cfg(feature = "amqp")]
    async fn adapter(&self) -> Result<TransportAdapter> {
        // ---
        let inner = &self.inner;
        inner
            .adapter
            .get_or_try_init(|| async {
                let handle = crate::transport::amqp::connect(&inner.options.connect_params).await?;
                Ok(TransportAdapter::new(handle, Arc::clone(&inner.observer)))
            })
            .await
            .cloned()
    }

    #[cfg(not(feature = "amqp"))]
    async fn adapter(&self) -> Result<TransportAdapter> {
        // ---
        self.inner.adapter.get().cloned().ok_or_else(|| {
            RpcError::Config("no broker connection; call connect_with first".to_string())
        })
    }

    /// Declare the service and reply queues and start consuming replies.
    pub async fn start(&self) -> Result<()> {
        // ---
        let adapter = self.adapter().await?;

        adapter
            .assert_queue(
                &self.queue_name(),
                &QueueOptions {
                    durable: self.inner.options.durable,
                    ..Default::default()
                },
            )
            .await?;
        adapter
            .assert_queue(
                &self.inner.reply_queue,
                &QueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                },
            )
            .await?;

        // Replies are consumed with no-ack semantics; they are never
        // application-acknowledged.
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let on_reply = message_handler(move |envelope| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                inner.handle_reply(&envelope)
            }
        });

        adapter
            .subscribe(
                &self.inner.reply_queue,
                &ConsumeOptions { no_ack: true },
                on_reply,
            )
            .await
    }

    /// Send a request and wait for its reply.
    pub async fn send(&self, payload: Value, opts: SendOptions) -> Result<Value> {
        self.send_inner(payload, opts, None).await
    }

    /// Send a request addressed to a named service action and wait for its
    /// reply.
    pub async fn call(&self, action: &str, payload: Value, opts: SendOptions) -> Result<Value> {
        self.send_inner(payload, opts, Some(action)).await
    }

    /// Fire-and-forget send: publishes the request without registering a
    /// pending call; any reply for it is dropped.
    pub async fn send_without_wait_response(
        &self,
        payload: Value,
        opts: SendOptions,
    ) -> Result<()> {
        self.publish(payload, &opts, None, Uuid::new_v4().to_string())
            .await
    }

    /// Fire-and-forget [`RpcClient::call`].
    pub async fn call_without_wait_response(
        &self,
        action: &str,
        payload: Value,
        opts: SendOptions,
    ) -> Result<()> {
        self.publish(payload, &opts, Some(action), Uuid::new_v4().to_string())
            .await
    }

    async fn send_inner(
        &self,
        payload: Value,
        opts: SendOptions,
        action: Option<&str>,
    ) -> Result<Value> {
        // ---
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock_ignore_poison(&self.inner.pending).insert(id.clone(), tx);

        // A failed publish must not leave a pending entry that can never be
        // resolved.
        if let Err(e) = self.publish(payload, &opts, action, id.clone()).await {
            self.inner.take_pending(&id);
            return Err(e);
        }

        let timeout = opts
            .wait_response_timeout
            .or(self.inner.options.default_wait_response_timeout);

        let received = match timeout {
            Some(bound) => match tokio::time::timeout(bound, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Entry removed now; a late reply is silently dropped.
                    self.inner.take_pending(&id);
                    return Err(RpcError::Timeout);
                }
            },
            None => rx.await,
        };

        match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(RpcError::Remote(error)),
            Err(_) => Err(RpcError::Transport(
                "reply channel closed before a reply arrived".to_string(),
            )),
        }
    }

    async fn publish(
        &self,
        payload: Value,
        opts: &SendOptions,
        action: Option<&str>,
        id: String,
    ) -> Result<()> {
        // ---
        let adapter = self.adapter().await?;

        let mut headers = opts.headers.clone();
        if let Some(limit) = opts.retry_limit.or(self.inner.options.default_retry_limit) {
            headers.insert(
                RETRY_LIMIT_HEADER.to_string(),
                Value::String(limit.to_string()),
            );
        }

        let props = MessageProperties {
            message_id: Some(id),
            correlation_id: opts.correlation_id.clone(),
            reply_to: Some(self.inner.reply_queue.clone()),
            kind: action.map(str::to_string),
            app_id: Some(self.queue_name()),
            timestamp: Some(now_millis()),
            content_type: Some(
                opts.content_type
                    .clone()
                    .unwrap_or_else(|| "application/json".to_string()),
            ),
            content_encoding: opts.content_encoding.clone(),
            expiration: opts.expiration.clone(),
            priority: opts.priority,
            persistent: opts.persistent,
            headers,
        };

        let body = serde_json::to_vec(&payload)?;
        adapter.send(&self.queue_name(), body.into(), props).await
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    /// Gracefully disconnect.
    pub async fn stop(&self) -> Result<()> {
        // ---
        match self.inner.adapter.get() {
            Some(adapter) => {
                adapter
                    .disconnect(self.inner.options.graceful_stop_timeout)
                    .await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use serde_json::json;

    fn client(broker: &MemoryBroker, timeout: Option<Duration>) -> RpcClient {
        // ---
        let mut options = RpcClientOptions::new("billing");
        options.version = "2".to_string();
        options.default_wait_response_timeout = timeout;
        let client = RpcClient::new(options, Arc::new(|_| {}));
        client.connect_with(broker.attach()).unwrap();
        client
    }

    #[tokio::test]
    async fn queue_names_follow_the_convention() {
        // ---
        let broker = MemoryBroker::new();
        let client = client(&broker, None);

        assert_eq!(client.queue_name(), "billing-v2");
        assert!(client.reply_queue_name().starts_with("billing-v2-reply-"));
    }

    #[tokio::test]
    async fn timed_out_call_removes_its_pending_entry() {
        // ---
        let broker = MemoryBroker::new();
        let client = client(&broker, Some(Duration::from_millis(50)));
        client.start().await.unwrap();

        let result = client.send(json!({"q": 1}), SendOptions::default()).await;
        assert!(matches!(result, Err(RpcError::Timeout)));
        assert_eq!(client.pending_calls(), 0);

        // The request itself was published.
        assert_eq!(broker.queue_len("billing-v2"), 1);
    }

    #[tokio::test]
    async fn fire_and_forget_registers_no_pending_call() {
        // ---
        let broker = MemoryBroker::new();
        let client = client(&broker, None);
        client.start().await.unwrap();

        client
            .send_without_wait_response(json!({"q": 1}), SendOptions::default())
            .await
            .unwrap();

        assert_eq!(client.pending_calls(), 0);
        assert_eq!(broker.queue_len("billing-v2"), 1);
    }

    #[tokio::test]
    async fn default_retry_limit_is_stamped_on_requests() {
        // ---
        let broker = MemoryBroker::new();
        let mut options = RpcClientOptions::new("jobs");
        options.default_retry_limit = Some(3);
        let client = RpcClient::new(options, Arc::new(|_| {}));
        client.connect_with(broker.attach()).unwrap();
        client.start().await.unwrap();

        client
            .call_without_wait_response("work", json!({}), SendOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.queue_len("jobs-v1"), 1);
    }
}
