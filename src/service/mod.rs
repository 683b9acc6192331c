// src/service/mod.rs

//! RPC service: queue binding, dispatch and the handler registry.
//!
//! An [`RpcService`] binds the queue `"{service}-v{version}"` and dispatches
//! each inbound message through the handler lifecycle. Dispatch runs in one
//! of two mutually exclusive modes, chosen by whichever is configured first
//! and locked thereafter:
//!
//! - **functional** — one closure ([`RpcService::set_handler`]) serves every
//!   message on the queue;
//! - **registry** — messages carry an action name (the `type` property) and
//!   the registry resolves it to a handler
//!   ([`RpcService::register_handler`] for [`ActionHandler`] types,
//!   [`RpcService::add_action_handler`] for closures).
//!
//! An action with no registered handler is answered with a structured
//! "Handler for action not found" reply; the first delivery is rejected
//! without requeue, a redelivery with requeue.

pub mod handler;
pub(crate) mod lifecycle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::adapter::{message_handler, TransportAdapter, DEFAULT_DISCONNECT_TIMEOUT};
use crate::controller::MessageController;
use crate::envelope::MessageEnvelope;
use crate::reply::ErrorObject;
use crate::transport::{BrokerHandle, ConsumeOptions, QueueOptions};
use crate::{ConnectParams, ErrorObserver, Result, RpcError};

use handler::{factory_from_fn, ActionHandler, HandlerFactory, HandlerFn, HandlerMap};
use lifecycle::HandlerLifecycle;

/// Queue name for a service/version pair.
pub(crate) fn service_queue_name(service: &str, version: &str) -> String {
    format!("{service}-v{version}")
}

/// Service configuration.
#[derive(Clone)]
pub struct RpcServiceOptions {
    pub service: String,
    pub version: String,
    /// Declare the service queue as durable.
    pub durable: bool,
    /// Broker-side bound on unacknowledged deliveries pushed concurrently.
    pub prefetch: u16,
    pub connect_params: ConnectParams,
    /// Bound on waiting for in-flight handlers during [`RpcService::stop`].
    pub graceful_stop_timeout: Duration,
}

impl RpcServiceOptions {
    pub fn new(service: impl Into<String>) -> Self {
        // ---
        Self {
            service: service.into(),
            version: "1".to_string(),
            durable: true,
            prefetch: 1,
            connect_params: ConnectParams::default(),
            graceful_stop_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

enum DispatchMode {
    Unset,
    Functional(HandlerFactory),
    Registry,
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct ServiceInner {
    options: RpcServiceOptions,
    observer: ErrorObserver,
    adapter: OnceCell<TransportAdapter>,
    handlers: HandlerMap,
    mode: Mutex<DispatchMode>,
    started: AtomicBool,
}

impl ServiceInner {
    async fn dispatch(&self, envelope: MessageEnvelope, adapter: TransportAdapter) -> Result<()> {
        // ---
        let controller = MessageController::new(envelope.clone(), adapter);

        let factory = {
            let mode = lock_ignore_poison(&self.mode);
            match &*mode {
                DispatchMode::Functional(factory) => Some(Arc::clone(factory)),
                DispatchMode::Registry => envelope.action().and_then(|a| self.handlers.get(a)),
                DispatchMode::Unset => None,
            }
        };

        match factory {
            Some(factory) => {
                HandlerLifecycle::new(controller, Arc::clone(&self.observer))
                    .execute(&factory)
                    .await
            }
            None => {
                // First delivery is dropped outright; a redelivery gets one
                // more chance on the queue in case registration is racing
                // startup elsewhere.
                let action = envelope.action().unwrap_or("<unknown>");
                controller
                    .reply_with_error(ErrorObject::handler_not_found(action, envelope.id()))
                    .await?;
                if envelope.redelivered() {
                    controller.reject_and_requeue().await
                } else {
                    controller.reject().await
                }
            }
        }
    }
}

/// RPC service bound to one queue.
#[derive(Clone)]
pub struct RpcService {
    inner: Arc<ServiceInner>,
}

impl RpcService {
    pub fn new(options: RpcServiceOptions, observer: ErrorObserver) -> Self {
        // ---
        Self {
            inner: Arc::new(ServiceInner {
                options,
                observer,
                adapter: OnceCell::new(),
                handlers: HandlerMap::default(),
                mode: Mutex::new(DispatchMode::Unset),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn queue_name(&self) -> String {
        service_queue_name(&self.inner.options.service, &self.inner.options.version)
    }

    /// Configure functional dispatch: one closure serving every message.
    pub fn set_handler(&self, f: HandlerFn) -> Result<()> {
        // ---
        self.check_not_started()?;
        let mut mode = lock_ignore_poison(&self.inner.mode);
        match &*mode {
            DispatchMode::Unset => {
                *mode = DispatchMode::Functional(factory_from_fn(f));
                Ok(())
            }
            DispatchMode::Functional(_) => {
                Err(RpcError::HandlerAlreadySet("<functional>".to_string()))
            }
            DispatchMode::Registry => Err(RpcError::DispatchModeLocked),
        }
    }

    /// Register an [`ActionHandler`] type under its action name (registry
    /// dispatch).
    pub fn register_handler<H>(&self) -> Result<()>
    where
        H: ActionHandler + 'static,
    {
        // ---
        self.check_not_started()?;
        self.enter_registry_mode()?;
        self.inner.handlers.register::<H>()
    }

    /// Register a closure under an action name (registry dispatch).
    pub fn add_action_handler(&self, action: &str, f: HandlerFn) -> Result<()> {
        // ---
        self.check_not_started()?;
        self.enter_registry_mode()?;
        self.inner.handlers.register_fn(action, f)
    }

    fn enter_registry_mode(&self) -> Result<()> {
        // ---
        let mut mode = lock_ignore_poison(&self.inner.mode);
        match &*mode {
            DispatchMode::Unset => {
                *mode = DispatchMode::Registry;
                Ok(())
            }
            DispatchMode::Registry => Ok(()),
            DispatchMode::Functional(_) => Err(RpcError::DispatchModeLocked),
        }
    }

    fn check_not_started(&self) -> Result<()> {
        // ---
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(RpcError::DispatchModeLocked);
        }
        Ok(())
    }

    /// Adopt an already-opened broker handle instead of connecting.
    ///
    /// Used with embedded brokers (and the in-memory one in tests). Spawns
    /// the adapter's event loop, so this must be called from within a tokio
    /// runtime.
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
        self.inner
            .adapter
            .get()
            .cloned()
            .ok_or_else(|| {
                RpcError::Config("no broker connection; call connect_with first".to_string())
            })
    }

    /// Declare the service queue, apply prefetch and start consuming.
    ///
    /// Locks the dispatch mode; registrations after `start` fail.
    pub async fn start(&self) -> Result<()> {
        // ---
        let adapter = self.adapter().await?;
        self.inner.started.store(true, Ordering::SeqCst);

        let queue = self.queue_name();
        adapter
            .assert_queue(
                &queue,
                &QueueOptions {
                    durable: self.inner.options.durable,
                    ..Default::default()
                },
            )
            .await?;
        adapter.set_prefetch(self.inner.options.prefetch).await?;

        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        let dispatch_adapter = adapter.clone();
        let on_delivery = message_handler(move |envelope| {
            let weak = weak.clone();
            let adapter = dispatch_adapter.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                inner.dispatch(envelope, adapter).await
            }
        });

        adapter
            .subscribe(&queue, &ConsumeOptions::default(), on_delivery)
            .await
    }

    /// Gracefully disconnect, waiting (bounded) for in-flight handlers.
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
    use crate::service::handler::handler_fn;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::{ChannelPtr, MessageProperties};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn service(name: &str, version: &str) -> RpcService {
        // ---
        let mut options = RpcServiceOptions::new(name);
        options.version = version.to_string();
        RpcService::new(options, Arc::new(|_| {}))
    }

    #[test]
    fn queue_name_is_service_dash_v_version() {
        assert_eq!(service("billing", "2").queue_name(), "billing-v2");
    }

    #[test]
    fn dispatch_modes_are_mutually_exclusive() {
        // ---
        let svc = service("billing", "1");
        svc.add_action_handler("pay", handler_fn(|_| async { Ok(None) }))
            .unwrap();

        // Registry mode is set; functional registration must fail.
        assert!(matches!(
            svc.set_handler(handler_fn(|_| async { Ok(None) })),
            Err(RpcError::DispatchModeLocked)
        ));

        // More registry registrations are fine, duplicates are not.
        svc.add_action_handler("refund", handler_fn(|_| async { Ok(None) }))
            .unwrap();
        assert!(matches!(
            svc.add_action_handler("pay", handler_fn(|_| async { Ok(None) })),
            Err(RpcError::HandlerAlreadySet(_))
        ));
    }

    #[test]
    fn functional_mode_locks_out_registry() {
        // ---
        let svc = service("billing", "1");
        svc.set_handler(handler_fn(|ctx| async move { Ok(Some(ctx.payload)) }))
            .unwrap();

        assert!(matches!(
            svc.add_action_handler("pay", handler_fn(|_| async { Ok(None) })),
            Err(RpcError::DispatchModeLocked)
        ));
        assert!(matches!(
            svc.set_handler(handler_fn(|_| async { Ok(None) })),
            Err(RpcError::HandlerAlreadySet(_))
        ));
    }

    struct DispatchFixture {
        broker: MemoryBroker,
        channel: ChannelPtr,
        adapter: TransportAdapter,
        deliveries: mpsc::UnboundedReceiver<crate::transport::Delivery>,
    }

    /// Publish one unroutable request to `billing-v1` and start consuming it
    /// manually, so dispatch can be fed real deliveries with real tags.
    async fn dispatch_fixture() -> DispatchFixture {
        // ---
        let broker = MemoryBroker::new();
        let handle = broker.attach();
        let channel = Arc::clone(&handle.channel);
        let adapter = TransportAdapter::new(handle, Arc::new(|_| {}));

        adapter
            .assert_queue("billing-v1", &QueueOptions::default())
            .await
            .unwrap();
        adapter
            .assert_queue("answers", &QueueOptions::default())
            .await
            .unwrap();

        channel
            .publish(
                "billing-v1",
                Bytes::from_static(b"{}"),
                MessageProperties {
                    message_id: Some("m1".to_string()),
                    reply_to: Some("answers".to_string()),
                    kind: Some("refund".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let deliveries = channel
            .consume("billing-v1", &ConsumeOptions::default())
            .await
            .unwrap();

        DispatchFixture {
            broker,
            channel,
            adapter,
            deliveries,
        }
    }

    #[tokio::test]
    async fn unknown_action_first_delivery_is_dropped() {
        // ---
        let mut fx = dispatch_fixture().await;
        let svc = service("billing", "1");
        svc.add_action_handler("pay", handler_fn(|_| async { Ok(None) }))
            .unwrap();

        let delivery = fx.deliveries.recv().await.unwrap();
        assert!(!delivery.redelivered);

        let envelope = MessageEnvelope::from_delivery(delivery, Arc::clone(&fx.channel));
        svc.inner.dispatch(envelope, fx.adapter).await.unwrap();

        // Structured reply sent; the message is gone for good.
        assert_eq!(fx.broker.queue_len("answers"), 1);
        assert!(fx.deliveries.try_recv().is_err());
        assert_eq!(fx.broker.queue_len("billing-v1"), 0);
    }

    #[tokio::test]
    async fn unknown_action_redelivery_is_requeued() {
        // ---
        let mut fx = dispatch_fixture().await;
        let svc = service("billing", "1");
        svc.add_action_handler("pay", handler_fn(|_| async { Ok(None) }))
            .unwrap();

        let first = fx.deliveries.recv().await.unwrap();
        fx.channel.reject(first.delivery_tag, true).await.unwrap();
        let redelivery = fx.deliveries.recv().await.unwrap();
        assert!(redelivery.redelivered);

        let envelope = MessageEnvelope::from_delivery(redelivery, Arc::clone(&fx.channel));
        svc.inner.dispatch(envelope, fx.adapter).await.unwrap();

        // Reply sent and the message went back to the queue, reaching our
        // consumer once more.
        assert_eq!(fx.broker.queue_len("answers"), 1);
        let back = fx.deliveries.recv().await.unwrap();
        assert!(back.redelivered);
    }
}
