//! RPC semantics over an AMQP-style message broker
//!
//! This library lets a client call a named service by publishing a correlated
//! request and awaiting the reply on a private reply queue, and lets a
//! service dispatch inbound requests to per-action handlers with structured
//! success/failure replies and an application-level retry budget. It handles
//! request/reply correlation, one-shot message sealing, publish backpressure,
//! and graceful shutdown coordination.
//!

// Import all sub modules once...
mod adapter;
mod client;
mod connect_params;
mod controller;
mod envelope;
mod error;
mod reply;
mod service;
mod macros;
mod shutdown;
mod transport;

// Re-export main types
pub use client::{RpcClient, RpcClientOptions, SendOptions};
pub use service::{RpcService, RpcServiceOptions};

pub use connect_params::ConnectParams;
pub use error::{ErrorObserver, Result, RpcError};

pub use adapter::{
    //
    message_handler,
    ConnectionState,
    MessageHandler,
    TransportAdapter,
    DEFAULT_DISCONNECT_TIMEOUT,
    DEFAULT_READY_TIMEOUT,
    MAX_PUBLISH_ATTEMPTS,
};

pub use controller::MessageController;
pub use envelope::{MessageEnvelope, RETRY_LIMIT_HEADER};
pub use reply::{ErrorObject, ReplyEnvelope};

pub use service::handler::{
    //
    handler_fn,
    ActionHandler,
    Handler,
    HandlerContext,
    HandlerFn,
    HandlerResult,
};

pub use shutdown::exit_on_stop_signal;

// --- transport seam
pub use transport::{
    //
    BrokerHandle,
    ChannelEvent,
    ChannelPtr,
    ConsumeOptions,
    Delivery,
    MessageChannel,
    MessageProperties,
    PublishOutcome,
    QueueOptions,
};

pub use transport::memory::MemoryBroker;

#[cfg(feature = "amqp")]
pub use transport::amqp::connect as connect_amqp;
