// src/service/handler.rs

//! Handler traits and the action registry.
//!
//! Two ways to serve messages:
//!
//! - a bare async closure ([`HandlerFn`]) with the lifecycle hooks left at
//!   their defaults; used for functional dispatch and for
//!   [`crate::RpcService::add_action_handler`];
//! - a full [`ActionHandler`] type, which adds lifecycle hooks around
//!   `handle` and a per-message constructor. A fresh handler instance is
//!   built for every delivery.
//!
//! Hook failures are [`ErrorObject`]s rather than transport errors: they
//! describe the application-level outcome that flows back to the caller in
//! the reply envelope.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::envelope::MessageEnvelope;
use crate::reply::ErrorObject;
use crate::{Result, RpcError};

/// Outcome of a handler step.
pub type HandlerResult<T> = std::result::Result<T, ErrorObject>;

/// Everything a handler sees about one delivery.
#[derive(Clone)]
pub struct HandlerContext {
    pub envelope: MessageEnvelope,
    /// Message payload, already parsed as JSON.
    pub payload: Value,
}

impl HandlerContext {
    /// Service action this message addresses (the `type` property).
    pub fn action(&self) -> Option<&str> {
        self.envelope.action()
    }

    /// Remaining application-level retry budget, if the sender opted in.
    pub fn retry_limit(&self) -> Option<i64> {
        self.envelope.retry_limit()
    }
}

/// Per-message handler with lifecycle hooks.
///
/// Only `handle` is required. The default hooks do nothing; `after_handle`
/// runs unconditionally, success or fail.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn before_handle(&self, _ctx: &HandlerContext) -> HandlerResult<()> {
        Ok(())
    }

    /// Process the message; the returned payload goes into the reply.
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult<Option<Value>>;

    async fn on_success(
        &self,
        _ctx: &HandlerContext,
        _payload: &Option<Value>,
    ) -> HandlerResult<()> {
        Ok(())
    }

    /// Called when `before_handle` or `handle` failed, before the failure is
    /// resolved into a retry or a terminal reply.
    async fn on_fail(&self, _ctx: &HandlerContext, _error: &ErrorObject) -> HandlerResult<()> {
        Ok(())
    }

    /// Runs last in every case, with the reply payload (on success) or the
    /// terminal error (on a non-retried failure).
    async fn after_handle(
        &self,
        _ctx: &HandlerContext,
        _payload: Option<&Value>,
        _error: Option<&ErrorObject>,
    ) {
    }
}

/// A [`Handler`] type that can be registered by action name.
pub trait ActionHandler: Handler {
    /// Action name this handler serves.
    fn action() -> &'static str
    where
        Self: Sized;

    /// Build a handler instance for one delivery.
    fn from_context(ctx: &HandlerContext) -> HandlerResult<Self>
    where
        Self: Sized;
}

/// Async closure serving one action in functional mode.
pub type HandlerFn = Arc<
    dyn Fn(HandlerContext) -> Pin<Box<dyn Future<Output = HandlerResult<Option<Value>>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure into a [`HandlerFn`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Option<Value>>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Closure-backed [`Handler`]; the lifecycle hooks stay at their defaults.
struct FnHandler {
    f: HandlerFn,
}

#[async_trait::async_trait]
impl Handler for FnHandler {
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult<Option<Value>> {
        (self.f)(ctx.clone()).await
    }
}

/// Builds a handler instance for one delivery.
pub(crate) type HandlerFactory =
    Arc<dyn Fn(&HandlerContext) -> HandlerResult<Box<dyn Handler>> + Send + Sync>;

/// Factory serving a closure regardless of context (functional dispatch).
pub(crate) fn factory_from_fn(f: HandlerFn) -> HandlerFactory {
    Arc::new(move |_ctx| Ok(Box::new(FnHandler { f: Arc::clone(&f) }) as Box<dyn Handler>))
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Action-name to handler-factory registry.
#[derive(Default)]
pub(crate) struct HandlerMap {
    factories: Mutex<HashMap<String, HandlerFactory>>,
}

impl HandlerMap {
    /// Register an [`ActionHandler`] type under its action name.
    pub(crate) fn register<H>(&self) -> Result<()>
    where
        H: ActionHandler + 'static,
    {
        // ---
        let factory: HandlerFactory =
            Arc::new(|ctx| H::from_context(ctx).map(|h| Box::new(h) as Box<dyn Handler>));
        self.insert(H::action(), factory)
    }

    /// Register a closure under an action name.
    pub(crate) fn register_fn(&self, action: &str, f: HandlerFn) -> Result<()> {
        self.insert(action, factory_from_fn(f))
    }

    fn insert(&self, action: &str, factory: HandlerFactory) -> Result<()> {
        // ---
        let mut factories = lock_ignore_poison(&self.factories);
        if factories.contains_key(action) {
            return Err(RpcError::HandlerAlreadySet(action.to_string()));
        }
        factories.insert(action.to_string(), factory);
        Ok(())
    }

    pub(crate) fn get(&self, action: &str) -> Option<HandlerFactory> {
        lock_ignore_poison(&self.factories).get(action).cloned()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::{Delivery, MessageProperties};
    use bytes::Bytes;
    use serde_json::json;

    fn context(action: &str) -> HandlerContext {
        // ---
        let broker = MemoryBroker::new();
        let handle = broker.attach();
        let envelope = MessageEnvelope::from_delivery(
            Delivery {
                payload: Bytes::from(json!({"x": 1}).to_string()),
                properties: MessageProperties {
                    kind: Some(action.to_string()),
                    ..Default::default()
                },
                delivery_tag: 1,
                redelivered: false,
                source_queue: "q".to_string(),
            },
            handle.channel,
        );
        let payload = envelope.payload_as_value().unwrap();
        HandlerContext { envelope, payload }
    }

    struct Doubler {
        x: i64,
    }

    #[async_trait::async_trait]
    impl Handler for Doubler {
        async fn handle(&self, _ctx: &HandlerContext) -> HandlerResult<Option<Value>> {
            Ok(Some(json!({"doubled": self.x * 2})))
        }
    }

    impl ActionHandler for Doubler {
        fn action() -> &'static str {
            "double"
        }

        fn from_context(ctx: &HandlerContext) -> HandlerResult<Self> {
            // ---
            let x = ctx.payload["x"]
                .as_i64()
                .ok_or_else(|| ErrorObject::new("BadRequest", "x must be an integer"))?;
            Ok(Self { x })
        }
    }

    #[tokio::test]
    async fn registered_handler_is_built_per_message() {
        // ---
        let map = HandlerMap::default();
        map.register::<Doubler>().unwrap();

        let ctx = context("double");
        let handler = map.get("double").unwrap()(&ctx).unwrap();
        let out = handler.handle(&ctx).await.unwrap();
        assert_eq!(out, Some(json!({"doubled": 2})));

        assert!(map.get("missing").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        // ---
        let map = HandlerMap::default();
        map.register::<Doubler>().unwrap();

        match map.register::<Doubler>() {
            Err(RpcError::HandlerAlreadySet(action)) => assert_eq!(action, "double"),
            other => panic!("expected HandlerAlreadySet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn functional_registration_runs_the_closure() {
        // ---
        let map = HandlerMap::default();
        map.register_fn(
            "echo",
            handler_fn(|ctx: HandlerContext| async move { Ok(Some(ctx.payload)) }),
        )
        .unwrap();

        let ctx = context("echo");
        let handler = map.get("echo").unwrap()(&ctx).unwrap();
        let out = handler.handle(&ctx).await.unwrap();
        assert_eq!(out, Some(json!({"x": 1})));
    }
}
