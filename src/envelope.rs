// src/envelope.rs

//! In-process view over one delivered broker message.
//!
//! A [`MessageEnvelope`] is created once per delivery and shared (cheap
//! clone, Arc-backed) between the dispatch machinery and handler code. It
//! carries the payload, the broker properties, and the *seal*: the one-shot
//! guarantee that the delivery is acknowledged or rejected exactly once.
//!
//! The seal is an atomic flag. [`MessageEnvelope::claim_seal`] wins at most
//! once per envelope; every later claim fails with
//! [`RpcError::AlreadySealed`], so concurrent ack/reject attempts cannot
//! both reach the broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde_json::Value;

use crate::transport::{ChannelPtr, Delivery, MessageProperties};
use crate::{Result, RpcError};

/// Header carrying the application-level retry budget, string-encoded.
pub const RETRY_LIMIT_HEADER: &str = "X-Retry-Limit";

/// Header state is a single map with no cross-field invariants, so a
/// poisoned lock is still usable.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct EnvelopeInner {
    payload: Bytes,
    properties: MessageProperties,
    /// Headers live apart from the rest of the properties because the retry
    /// budget is decremented in place by the handler pipeline.
    headers: Mutex<HashMap<String, Value>>,
    delivery_tag: u64,
    redelivered: bool,
    source_queue: String,
    sealed: AtomicBool,
    channel: ChannelPtr,
}

/// One delivered message plus its seal state.
#[derive(Clone)]
pub struct MessageEnvelope {
    inner: Arc<EnvelopeInner>,
}

impl MessageEnvelope {
    pub(crate) fn from_delivery(delivery: Delivery, channel: ChannelPtr) -> Self {
        // ---
        let Delivery {
            payload,
            mut properties,
            delivery_tag,
            redelivered,
            source_queue,
        } = delivery;

        let headers = std::mem::take(&mut properties.headers);

        Self {
            inner: Arc::new(EnvelopeInner {
                payload,
                properties,
                headers: Mutex::new(headers),
                delivery_tag,
                redelivered,
                source_queue,
                sealed: AtomicBool::new(false),
                channel,
            }),
        }
    }

    /// Message id, set by the sender (`messageId` property).
    pub fn id(&self) -> Option<&str> {
        self.inner.properties.message_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.inner.properties.correlation_id.as_deref()
    }

    /// Reply queue address; `None` disables replies for this message.
    pub fn reply_to(&self) -> Option<&str> {
        self.inner.properties.reply_to.as_deref()
    }

    /// Service action name (the AMQP `type` property).
    pub fn action(&self) -> Option<&str> {
        self.inner.properties.kind.as_deref()
    }

    pub fn is_answer_queue_enabled(&self) -> bool {
        self.inner.properties.reply_to.is_some()
    }

    pub fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    pub fn source_queue(&self) -> &str {
        &self.inner.source_queue
    }

    /// Full message properties with the current (possibly mutated) headers.
    pub fn properties(&self) -> MessageProperties {
        // ---
        let mut props = self.inner.properties.clone();
        props.headers = self.headers();
        props
    }

    pub fn headers(&self) -> HashMap<String, Value> {
        lock_ignore_poison(&self.inner.headers).clone()
    }

    pub fn payload_as_bytes(&self) -> Bytes {
        self.inner.payload.clone()
    }

    pub fn payload_as_str(&self) -> Result<String> {
        // ---
        String::from_utf8(self.inner.payload.to_vec())
            .map_err(|e| RpcError::Transport(format!("payload is not valid utf-8: {e}")))
    }

    pub fn payload_as_value(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.inner.payload)?)
    }

    /// Application-level retry budget, `None` when the sender did not opt in.
    ///
    /// The header is string-encoded on the wire; a bare integer is accepted
    /// too.
    pub fn retry_limit(&self) -> Option<i64> {
        // ---
        let headers = lock_ignore_poison(&self.inner.headers);
        match headers.get(RETRY_LIMIT_HEADER)? {
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn set_retry_limit(&self, limit: i64) {
        // ---
        lock_ignore_poison(&self.inner.headers)
            .insert(RETRY_LIMIT_HEADER.to_string(), Value::String(limit.to_string()));
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Fail if the envelope was already acked or rejected.
    pub fn check_sealed(&self) -> Result<()> {
        // ---
        if self.is_sealed() {
            return Err(RpcError::AlreadySealed);
        }
        Ok(())
    }

    /// Atomically claim the seal. The first caller wins; everyone else gets
    /// [`RpcError::AlreadySealed`]. Check-then-seal as one step, so two tasks
    /// racing an ack and a reject cannot both perform the broker action.
    pub fn claim_seal(&self) -> Result<()> {
        // ---
        self.inner
            .sealed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RpcError::AlreadySealed)?;
        Ok(())
    }

    pub(crate) fn channel(&self) -> &ChannelPtr {
        &self.inner.channel
    }

    pub(crate) fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }
}

impl std::fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("MessageEnvelope")
            .field("id", &self.id())
            .field("source_queue", &self.source_queue())
            .field("redelivered", &self.redelivered())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
