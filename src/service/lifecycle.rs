// src/service/lifecycle.rs

//! Execution pipeline for one delivered message.
//!
//! The pipeline resolves every delivery into exactly one broker outcome:
//!
//! 1. parse the payload; a malformed payload is answered and rejected;
//! 2. charge the retry budget for a broker-level redelivery and skip the
//!    handler entirely when the budget is spent;
//! 3. build the handler instance; a construction failure is answered and
//!    rejected;
//! 4. run `before_handle` -> `handle`, reply with the payload, ack, then run
//!    `on_success`;
//! 5. on an application failure, either resend the message as a retry (budget
//!    remaining) or send a terminal error reply and reject;
//! 6. `after_handle` runs last in every case, seeing the reply payload or the
//!    terminal error.
//!
//! Application failures ([`ErrorObject`]) flow back to the caller. Failures
//! of the hooks themselves go to the error observer and never propagate
//! further; transport failures bubble up to the adapter's observer.

use serde_json::Value;

use crate::controller::MessageController;
use crate::reply::ErrorObject;
use crate::service::handler::{Handler, HandlerContext, HandlerFactory};
use crate::{ErrorObserver, Result, RpcError};

pub(crate) struct HandlerLifecycle {
    controller: MessageController,
    observer: ErrorObserver,
}

impl HandlerLifecycle {
    pub(crate) fn new(controller: MessageController, observer: ErrorObserver) -> Self {
        Self {
            controller,
            observer,
        }
    }

    pub(crate) async fn execute(&self, factory: &HandlerFactory) -> Result<()> {
        // ---
        let envelope = self.controller.envelope().clone();

        let payload = match envelope.payload_as_value() {
            Ok(payload) => payload,
            Err(e) => {
                let error = ErrorObject::new("PayloadParseError", e.to_string());
                self.controller.reply_with_error(error).await?;
                self.controller.reject().await?;
                return Ok(());
            }
        };

        let ctx = HandlerContext { envelope, payload };

        // A broker-level redelivery consumed one attempt that was never
        // charged against the budget (the handler crashed or the connection
        // dropped mid-flight).
        if let Some(limit) = ctx.retry_limit() {
            let effective = if ctx.envelope.redelivered() {
                let effective = limit - 1;
                ctx.envelope.set_retry_limit(effective);
                effective
            } else {
                limit
            };

            if effective <= 0 {
                self.controller
                    .reply_with_error(ErrorObject::retry_limit_exceeded())
                    .await?;
                self.controller.reject().await?;
                return Ok(());
            }
        }

        let handler = match factory(&ctx) {
            Ok(handler) => handler,
            Err(cause) => {
                let action = ctx.action().unwrap_or("<unknown>").to_string();
                self.controller
                    .reply_with_error(ErrorObject::handler_construction(&action, cause))
                    .await?;
                self.controller.reject().await?;
                return Ok(());
            }
        };

        let mut reply_payload: Option<Value> = None;
        let mut terminal_error: Option<ErrorObject> = None;

        let handled = match handler.before_handle(&ctx).await {
            Ok(()) => handler.handle(&ctx).await,
            Err(error) => Err(error),
        };

        let result = match handled {
            Ok(payload) => {
                reply_payload = payload.clone();
                self.finish_success(handler.as_ref(), &ctx, payload).await
            }
            Err(error) => match self.handle_fail(handler.as_ref(), &ctx, error).await {
                Ok(terminal) => {
                    terminal_error = terminal;
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        handler
            .after_handle(&ctx, reply_payload.as_ref(), terminal_error.as_ref())
            .await;
        result
    }

    async fn finish_success(
        &self,
        handler: &dyn Handler,
        ctx: &HandlerContext,
        payload: Option<Value>,
    ) -> Result<()> {
        // ---
        self.controller.reply(payload.clone()).await?;
        self.controller.ack().await?;

        // The delivery is already settled; a failing hook cannot change the
        // outcome anymore.
        if let Err(hook_error) = handler.on_success(ctx, &payload).await {
            (self.observer)(RpcError::Remote(hook_error));
        }
        Ok(())
    }

    /// Resolve an application failure into a retry or a terminal reply.
    ///
    /// Without a retry budget every failure is terminal. With one, the budget
    /// is decremented and the message republished until it runs out; the last
    /// failure is the one the caller sees. Returns the terminal error when
    /// the failure was not retried.
    async fn handle_fail(
        &self,
        handler: &dyn Handler,
        ctx: &HandlerContext,
        error: ErrorObject,
    ) -> Result<Option<ErrorObject>> {
        // ---
        if let Err(hook_error) = handler.on_fail(ctx, &error).await {
            (self.observer)(RpcError::Remote(hook_error));
        }

        let remaining = match ctx.retry_limit() {
            Some(limit) => limit - 1,
            None => {
                self.controller.reply_with_error(error.clone()).await?;
                self.controller.reject().await?;
                return Ok(Some(error));
            }
        };

        if remaining <= 0 {
            self.controller.reply_with_error(error.clone()).await?;
            self.controller.reject().await?;
            return Ok(Some(error));
        }

        ctx.envelope.set_retry_limit(remaining);
        self.controller.ack().await?;
        self.controller.resend_as_retry().await?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::adapter::TransportAdapter;
    use crate::envelope::{MessageEnvelope, RETRY_LIMIT_HEADER};
    use crate::service::handler::{handler_fn, HandlerMap};
    use crate::transport::memory::MemoryBroker;
    use crate::transport::{Delivery, MessageProperties, QueueOptions};
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Fixture {
        broker: MemoryBroker,
        lifecycle: HandlerLifecycle,
        map: HandlerMap,
    }

    async fn fixture(redelivered: bool, retry_limit: Option<&str>) -> Fixture {
        // ---
        let broker = MemoryBroker::new();
        let handle = broker.attach();
        let channel = Arc::clone(&handle.channel);
        let adapter = TransportAdapter::new(handle, Arc::new(|_| {}));

        adapter
            .assert_queue("jobs", &QueueOptions::default())
            .await
            .unwrap();
        adapter
            .assert_queue("answers", &QueueOptions::default())
            .await
            .unwrap();

        let mut headers = HashMap::new();
        if let Some(limit) = retry_limit {
            headers.insert(RETRY_LIMIT_HEADER.to_string(), json!(limit));
        }

        let envelope = MessageEnvelope::from_delivery(
            Delivery {
                payload: Bytes::from(json!({"n": 7}).to_string()),
                properties: MessageProperties {
                    message_id: Some("m1".to_string()),
                    reply_to: Some("answers".to_string()),
                    kind: Some("work".to_string()),
                    headers,
                    ..Default::default()
                },
                delivery_tag: 1,
                redelivered,
                source_queue: "jobs".to_string(),
            },
            channel,
        );

        Fixture {
            broker,
            lifecycle: HandlerLifecycle::new(
                MessageController::new(envelope, adapter),
                Arc::new(|_| {}),
            ),
            map: HandlerMap::default(),
        }
    }

    #[tokio::test]
    async fn success_replies_and_acks() {
        // ---
        let fx = fixture(false, None).await;
        fx.map
            .register_fn(
                "work",
                handler_fn(|ctx| async move { Ok(Some(json!({"got": ctx.payload["n"]}))) }),
            )
            .unwrap();

        let factory = fx.map.get("work").unwrap();
        fx.lifecycle.execute(&factory).await.unwrap();

        assert_eq!(fx.broker.queue_len("answers"), 1);
        assert!(fx.lifecycle.controller.envelope().is_sealed());
    }

    #[tokio::test]
    async fn failure_without_budget_is_terminal() {
        // ---
        let fx = fixture(false, None).await;
        fx.map
            .register_fn(
                "work",
                handler_fn(|_ctx| async move {
                    Err(ErrorObject::new("WorkError", "cannot do the thing"))
                }),
            )
            .unwrap();

        let factory = fx.map.get("work").unwrap();
        fx.lifecycle.execute(&factory).await.unwrap();

        // Error reply sent, nothing resent to the work queue.
        assert_eq!(fx.broker.queue_len("answers"), 1);
        assert_eq!(fx.broker.queue_len("jobs"), 0);
    }

    #[tokio::test]
    async fn failure_with_budget_resends_with_decremented_limit() {
        // ---
        let fx = fixture(false, Some("3")).await;
        fx.map
            .register_fn(
                "work",
                handler_fn(|_ctx| async move { Err(ErrorObject::new("WorkError", "try again")) }),
            )
            .unwrap();

        let factory = fx.map.get("work").unwrap();
        fx.lifecycle.execute(&factory).await.unwrap();

        // No reply; the message went back to its source queue with one
        // attempt spent.
        assert_eq!(fx.broker.queue_len("answers"), 0);
        assert_eq!(fx.broker.queue_len("jobs"), 1);
        assert_eq!(fx.lifecycle.controller.envelope().retry_limit(), Some(2));
    }

    #[tokio::test]
    async fn exhausted_budget_on_redelivery_skips_the_handler() {
        // ---
        let fx = fixture(true, Some("1")).await;
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        fx.map
            .register_fn(
                "work",
                handler_fn(move |_ctx| {
                    let ran_flag = Arc::clone(&ran_flag);
                    async move {
                        ran_flag.store(true, Ordering::SeqCst);
                        Ok(None)
                    }
                }),
            )
            .unwrap();

        let factory = fx.map.get("work").unwrap();
        fx.lifecycle.execute(&factory).await.unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(fx.broker.queue_len("answers"), 1);
        assert_eq!(fx.broker.queue_len("jobs"), 0);
    }

    #[tokio::test]
    async fn after_handle_sees_the_terminal_error() {
        // ---
        struct Failing {
            saw_error: Arc<AtomicBool>,
        }

        #[async_trait::async_trait]
        impl Handler for Failing {
            async fn handle(
                &self,
                _ctx: &HandlerContext,
            ) -> std::result::Result<Option<Value>, ErrorObject> {
                Err(ErrorObject::new("WorkError", "nope"))
            }

            async fn after_handle(
                &self,
                _ctx: &HandlerContext,
                payload: Option<&Value>,
                error: Option<&ErrorObject>,
            ) {
                // ---
                assert!(payload.is_none());
                self.saw_error
                    .store(error.is_some_and(|e| e.name == "WorkError"), Ordering::SeqCst);
            }
        }

        let fx = fixture(false, None).await;
        let saw_error = Arc::new(AtomicBool::new(false));
        let saw = Arc::clone(&saw_error);
        let factory: HandlerFactory = Arc::new(move |_ctx| {
            Ok(Box::new(Failing {
                saw_error: Arc::clone(&saw),
            }) as Box<dyn Handler>)
        });

        fx.lifecycle.execute(&factory).await.unwrap();
        assert!(saw_error.load(Ordering::SeqCst));
    }
}
