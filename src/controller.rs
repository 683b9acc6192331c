// src/controller.rs

//! Per-message control surface handed to service handlers.
//!
//! A [`MessageController`] pairs one [`MessageEnvelope`] with the adapter it
//! arrived on and exposes the legal outcomes for that delivery: ack, reject,
//! requeue, reply, and resend-as-retry. The envelope's seal makes ack/reject
//! one-shot; replying and resending publish new messages and are not gated by
//! the seal.

use serde_json::Value;

use crate::adapter::TransportAdapter;
use crate::envelope::MessageEnvelope;
use crate::reply::{ErrorObject, ReplyEnvelope};
use crate::transport::MessageProperties;
use crate::{Result, RpcError};

fn now_millis() -> u64 {
    // ---
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Controls the outcome of one delivered message.
#[derive(Clone)]
pub struct MessageController {
    envelope: MessageEnvelope,
    adapter: TransportAdapter,
}

impl MessageController {
    pub(crate) fn new(envelope: MessageEnvelope, adapter: TransportAdapter) -> Self {
        Self { envelope, adapter }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    /// Acknowledge the delivery. Fails with [`RpcError::AlreadySealed`] when
    /// the message was already acked or rejected.
    pub async fn ack(&self) -> Result<()> {
        // ---
        self.envelope.claim_seal()?;
        self.envelope
            .channel()
            .ack(self.envelope.delivery_tag())
            .await
    }

    /// Reject the delivery without requeueing; the broker drops it (or
    /// dead-letters it, where configured).
    pub async fn reject(&self) -> Result<()> {
        self.reject_inner(false).await
    }

    /// Reject the delivery and put it back on its queue for redelivery.
    pub async fn reject_and_requeue(&self) -> Result<()> {
        self.reject_inner(true).await
    }

    async fn reject_inner(&self, requeue: bool) -> Result<()> {
        // ---
        self.envelope.claim_seal()?;
        self.envelope
            .channel()
            .reject(self.envelope.delivery_tag(), requeue)
            .await
    }

    /// Send a successful reply carrying `payload`.
    pub async fn reply(&self, payload: Option<Value>) -> Result<()> {
        self.reply_envelope(ReplyEnvelope::success(payload)).await
    }

    /// Send an error reply.
    pub async fn reply_with_error(&self, error: ErrorObject) -> Result<()> {
        self.reply_envelope(ReplyEnvelope::failure(error)).await
    }

    /// Publish a reply to the sender's reply queue.
    ///
    /// A message without `replyTo` did not ask for an answer; replying to it
    /// is a silent no-op. The reply mirrors the request's `messageId`, which
    /// is how the caller matches it to its pending call; `correlationId`
    /// passes through untouched.
    pub async fn reply_envelope(&self, reply: ReplyEnvelope) -> Result<()> {
        // ---
        let Some(reply_to) = self.envelope.reply_to().map(str::to_string) else {
            return Ok(());
        };

        let props = MessageProperties {
            message_id: self.envelope.id().map(str::to_string),
            correlation_id: self.envelope.correlation_id().map(str::to_string),
            content_type: Some("application/json".to_string()),
            timestamp: Some(now_millis()),
            ..Default::default()
        };

        let payload = serde_json::to_vec(&reply)?;
        self.adapter.send(&reply_to, payload.into(), props).await
    }

    /// Republish the message to its source queue as an application-level
    /// retry.
    ///
    /// Requires the message to carry a retry budget header; the caller is
    /// expected to have decremented it via
    /// [`MessageEnvelope::set_retry_limit`] first. Properties (including the
    /// updated budget) are carried over verbatim.
    pub async fn resend_as_retry(&self) -> Result<()> {
        // ---
        if self.envelope.retry_limit().is_none() {
            return Err(RpcError::RetryDisabled);
        }

        self.adapter
            .send(
                self.envelope.source_queue(),
                self.envelope.payload_as_bytes(),
                self.envelope.properties(),
            )
            .await
    }
}
