use std::sync::Arc;

use thiserror::Error;

use crate::reply::ErrorObject;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Waiting for a reply (or for channel readiness) exceeded its bound.
    #[error("wait response from service is timed out")]
    Timeout,

    /// A second ack/reject was attempted on an already-sealed message.
    #[error("message is already sealed")]
    AlreadySealed,

    /// `resend_as_retry` was called on a message without a retry budget.
    #[error("retry disabled")]
    RetryDisabled,

    /// The application-level retry budget reached zero before the handler ran.
    #[error("retry limit exceeded")]
    RetryLimitExceeded,

    /// No handler registered for the requested action.
    #[error("handler for action not found: {0}")]
    HandlerNotFound(String),

    /// A handler for this action was already registered.
    #[error("handler for this action already set: {0}")]
    HandlerAlreadySet(String),

    /// The service dispatch mode (functional vs registry) is already fixed.
    #[error("dispatch mode already configured")]
    DispatchModeLocked,

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-level failure (connection, channel, publish, consume).
    #[error("transport error: {0}")]
    Transport(String),

    /// Structured error reconstructed from a service reply.
    #[error("{0}")]
    Remote(ErrorObject),

    /// Invalid connection parameters.
    #[error("connect params error: {0}")]
    Config(String),

    /// AMQP client error.
    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Process-wide error sink for failures that must not crash long-lived
/// consume loops: handler errors, ack/reject failures, shutdown failures,
/// transport events.
///
/// There is no default observer. Every entry point that can swallow an error
/// requires one at construction, so failures are never dropped unnoticed.
pub type ErrorObserver = Arc<dyn Fn(RpcError) + Send + Sync>;
