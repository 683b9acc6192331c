// src/adapter.rs

//! Connection state machine over one broker channel.
//!
//! The [`TransportAdapter`] wraps a [`BrokerHandle`] and layers three things
//! on top of the raw channel:
//!
//! - a connection state machine driven by [`ChannelEvent`]s (blocked,
//!   unblocked, drain, closure), with [`TransportAdapter::wait_ready`] as the
//!   gate every publish goes through;
//! - backpressure handling: a publish that reports
//!   [`PublishOutcome::BufferFull`] moves the adapter to `Blocked` and is
//!   retried after the next unlock signal, bounded by
//!   [`MAX_PUBLISH_ATTEMPTS`];
//! - graceful disconnect: in-flight handler tasks are counted, and
//!   [`TransportAdapter::disconnect`] waits (bounded) for them to finish
//!   before closing the channel.
//!
//! Handler failures never tear down the adapter. Each delivery is handled in
//! its own task and errors are routed to the error observer, so one failing
//! message cannot starve its neighbours.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::envelope::MessageEnvelope;
use crate::macros::{log_debug, log_warn};
use crate::transport::{
    //
    BrokerHandle,
    ChannelEvent,
    ChannelPtr,
    ConsumeOptions,
    MessageProperties,
    PublishOutcome,
    QueueOptions,
};
use crate::{ErrorObserver, Result, RpcError};

/// Upper bound on publish retries after buffer overflows.
pub const MAX_PUBLISH_ATTEMPTS: usize = 5;

/// Default bound on waiting for the connection to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on waiting for in-flight handlers during disconnect.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Broker applied backpressure; publishes wait for the unlock signal.
    Blocked,
    /// Graceful shutdown in progress. Publishing is still allowed so that
    /// replies for in-flight messages can go out.
    Disconnecting,
    Disconnected,
}

/// Pure state transition for one transport event.
///
/// Error events carry no transition of their own; they are reported to the
/// observer and, for connection errors, followed by a closure event from the
/// transport.
pub(crate) fn apply_event(state: ConnectionState, event: &ChannelEvent) -> ConnectionState {
    // ---
    use ConnectionState::*;

    match event {
        ChannelEvent::Blocked => match state {
            Connected => Blocked,
            other => other,
        },
        ChannelEvent::Unblocked | ChannelEvent::Drain => match state {
            Blocked => Connected,
            other => other,
        },
        ChannelEvent::ConnectionClosed | ChannelEvent::ChannelClosed => Disconnected,
        ChannelEvent::ConnectionError(_) | ChannelEvent::ChannelError(_) => state,
    }
}

/// Async handler invoked once per delivery.
pub type MessageHandler =
    Arc<dyn Fn(MessageEnvelope) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(f(envelope)))
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Inner {
    channel: ChannelPtr,
    state: Mutex<ConnectionState>,
    observer: ErrorObserver,
    /// Bumped on every state change; `wait_ready` waiters re-check after each
    /// bump.
    unlock_tx: watch::Sender<u64>,
    /// Bumped whenever an in-flight handler finishes.
    end_handle_tx: watch::Sender<u64>,
    inflight: AtomicUsize,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *lock_ignore_poison(&self.state)
    }

    fn set_state(&self, next: ConnectionState) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if *state != next {
            log_debug!("transport state: {:?} -> {next:?}", *state);
            *state = next;
            drop(state);
            self.unlock_tx.send_modify(|n| *n += 1);
        }
    }

    fn handle_event(&self, event: ChannelEvent) {
        // ---
        match &event {
            ChannelEvent::ConnectionError(msg) => {
                (self.observer)(RpcError::Transport(format!("connection error: {msg}")));
            }
            ChannelEvent::ChannelError(msg) => {
                (self.observer)(RpcError::Transport(format!("channel error: {msg}")));
            }
            _ => {}
        }

        let current = self.state();
        self.set_state(apply_event(current, &event));
    }
}

/// Drop guard keeping the in-flight count accurate even when a handler task
/// panics.
struct InflightGuard {
    inner: Arc<Inner>,
}

impl InflightGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.inflight.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        // ---
        self.inner.inflight.fetch_sub(1, Ordering::SeqCst);
        self.inner.end_handle_tx.send_modify(|n| *n += 1);
    }
}

/// State-aware wrapper around one broker channel.
#[derive(Clone)]
pub struct TransportAdapter {
    inner: Arc<Inner>,
}

impl TransportAdapter {
    /// Take ownership of a freshly opened channel and start tracking its
    /// event stream. The adapter starts out `Connected`.
    pub fn new(handle: BrokerHandle, observer: ErrorObserver) -> Self {
        // ---
        let BrokerHandle {
            channel,
            mut events,
        } = handle;

        let (unlock_tx, _) = watch::channel(0u64);
        let (end_handle_tx, _) = watch::channel(0u64);

        let inner = Arc::new(Inner {
            channel,
            state: Mutex::new(ConnectionState::Connected),
            observer,
            unlock_tx,
            end_handle_tx,
            inflight: AtomicUsize::new(0),
        });

        // The event loop holds a weak reference so dropping the last adapter
        // clone ends the task.
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_event(event);
            }
        });

        Self { inner }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub(crate) fn channel(&self) -> &ChannelPtr {
        &self.inner.channel
    }

    /// Number of handler tasks currently running.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    pub async fn assert_queue(&self, name: &str, opts: &QueueOptions) -> Result<()> {
        // ---
        self.wait_ready().await?;
        self.inner.channel.assert_queue(name, opts).await
    }

    pub async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner.channel.set_prefetch(count).await
    }

    /// Wait until the connection is ready to publish, bounded by
    /// [`DEFAULT_READY_TIMEOUT`].
    ///
    /// Returns while `Connected` and also while `Disconnecting`, so replies
    /// for in-flight messages can still go out during a graceful shutdown.
    pub async fn wait_ready(&self) -> Result<()> {
        self.wait_ready_for(DEFAULT_READY_TIMEOUT).await
    }

    pub async fn wait_ready_for(&self, timeout: Duration) -> Result<()> {
        // ---
        let deadline = Instant::now() + timeout;
        // Subscribe before the first state check so a concurrent transition
        // cannot slip between check and wait.
        let mut unlock = self.inner.unlock_tx.subscribe();

        loop {
            match self.inner.state() {
                ConnectionState::Connected | ConnectionState::Disconnecting => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(RpcError::Transport("connection is closed".to_string()));
                }
                _ => {}
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(RpcError::Transport(
                    "wait for transport readiness timed out".to_string(),
                ));
            };

            match tokio::time::timeout(remaining, unlock.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(RpcError::Transport(
                        "transport event loop terminated".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(RpcError::Transport(
                        "wait for transport readiness timed out".to_string(),
                    ));
                }
            }
        }
    }

    /// Publish one message, honoring backpressure.
    ///
    /// Each attempt first waits for readiness. A `BufferFull` outcome locks
    /// the adapter and retries after the next unlock signal, at most
    /// [`MAX_PUBLISH_ATTEMPTS`] times in total.
    pub async fn send(
        &self,
        queue: &str,
        payload: Bytes,
        props: MessageProperties,
    ) -> Result<()> {
        // ---
        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            self.wait_ready().await?;

            match self
                .inner
                .channel
                .publish(queue, payload.clone(), props.clone())
                .await?
            {
                PublishOutcome::Accepted => return Ok(()),
                PublishOutcome::BufferFull => {
                    log_warn!(
                        "send buffer overflow on queue {queue} (attempt {attempt}/{MAX_PUBLISH_ATTEMPTS})"
                    );
                    self.note_buffer_overflow();
                }
            }
        }

        Err(RpcError::Transport(format!(
            "publish to {queue} failed after {MAX_PUBLISH_ATTEMPTS} buffer overflows"
        )))
    }

    /// Record local backpressure: the channel refused a publish, so hold
    /// further publishes until the transport signals drain or unblock.
    fn note_buffer_overflow(&self) {
        // ---
        if self.inner.state() == ConnectionState::Connected {
            self.inner.set_state(ConnectionState::Blocked);
        }
    }

    /// Consume a queue, running `handler` once per delivery in its own task.
    ///
    /// A handler error is reported to the observer; it never stops the
    /// consumer loop. Deliveries arriving during shutdown are rejected back
    /// to the queue.
    pub async fn subscribe(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
        handler: MessageHandler,
    ) -> Result<()> {
        // ---
        let mut deliveries = self.inner.channel.consume(queue, opts).await?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let queue = queue.to_string();

        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };

                match inner.state() {
                    ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                        let _ = inner.channel.reject(delivery.delivery_tag, true).await;
                        continue;
                    }
                    _ => {}
                }

                let guard = InflightGuard::new(Arc::clone(&inner));
                let envelope =
                    MessageEnvelope::from_delivery(delivery, Arc::clone(&inner.channel));
                let handler = Arc::clone(&handler);

                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = handler(envelope).await {
                        (inner.observer)(e);
                    }
                });
            }

            log_debug!("consumer loop ended for queue: {queue}");
        });

        Ok(())
    }

    /// Gracefully shut the connection down.
    ///
    /// Moves to `Disconnecting`, waits (bounded by `timeout`) for in-flight
    /// handlers to finish, then closes the channel unconditionally. A timeout
    /// while waiting is reported to the observer but does not prevent the
    /// close.
    pub async fn disconnect(&self, timeout: Duration) -> Result<()> {
        // ---
        if self.inner.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.inner.set_state(ConnectionState::Disconnecting);
        self.wait_for_inflight(timeout).await;

        let close_result = self.inner.channel.close().await;
        self.inner.set_state(ConnectionState::Disconnected);

        close_result
    }

    async fn wait_for_inflight(&self, timeout: Duration) {
        // ---
        let deadline = Instant::now() + timeout;
        let mut end_handle = self.inner.end_handle_tx.subscribe();

        loop {
            let pending = self.inner.inflight.load(Ordering::SeqCst);
            if pending == 0 {
                return;
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                (self.inner.observer)(RpcError::Transport(format!(
                    "graceful disconnect timed out with {pending} handler(s) in flight"
                )));
                return;
            };

            match tokio::time::timeout(remaining, end_handle.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => {
                    (self.inner.observer)(RpcError::Transport(format!(
                        "graceful disconnect timed out with {pending} handler(s) in flight"
                    )));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transport::memory::MemoryBroker;

    fn silent_observer() -> ErrorObserver {
        Arc::new(|_| {})
    }

    #[test]
    fn transition_table() {
        // ---
        use ChannelEvent::{
            //
            ChannelClosed,
            ChannelError,
            ConnectionClosed,
            ConnectionError,
            Drain,
            Unblocked,
        };
        use ConnectionState::{Connected, Disconnected, Disconnecting};

        assert_eq!(
            apply_event(Connected, &ChannelEvent::Blocked),
            ConnectionState::Blocked
        );
        assert_eq!(apply_event(ConnectionState::Blocked, &Unblocked), Connected);
        assert_eq!(apply_event(ConnectionState::Blocked, &Drain), Connected);

        // Unlock signals are ignored outside the blocked state.
        assert_eq!(apply_event(Connected, &Unblocked), Connected);
        assert_eq!(apply_event(Disconnecting, &Drain), Disconnecting);

        assert_eq!(apply_event(Connected, &ConnectionClosed), Disconnected);
        assert_eq!(apply_event(ConnectionState::Blocked, &ChannelClosed), Disconnected);
        assert_eq!(apply_event(Disconnecting, &ConnectionClosed), Disconnected);

        // Errors alone do not change state.
        assert_eq!(
            apply_event(Connected, &ConnectionError("boom".to_string())),
            Connected
        );
        assert_eq!(
            apply_event(ConnectionState::Blocked, &ChannelError("boom".to_string())),
            ConnectionState::Blocked
        );
    }

    #[tokio::test]
    async fn wait_ready_is_immediate_when_connected() {
        // ---
        let broker = MemoryBroker::new();
        let adapter = TransportAdapter::new(broker.attach(), silent_observer());

        assert_eq!(adapter.state(), ConnectionState::Connected);
        adapter.wait_ready_for(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn buffer_overflow_locks_then_drain_unlocks() {
        // ---
        let broker = MemoryBroker::new();
        let adapter = TransportAdapter::new(broker.attach(), silent_observer());
        adapter
            .assert_queue("q", &QueueOptions::default())
            .await
            .unwrap();

        broker.fail_next_publishes(1);

        let send = {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                adapter
                    .send("q", Bytes::from_static(b"{}"), MessageProperties::default())
                    .await
            })
        };

        // Give the first attempt time to overflow and lock the adapter.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(adapter.state(), ConnectionState::Blocked);

        broker.emit_drain();
        send.await.unwrap().unwrap();

        assert_eq!(adapter.state(), ConnectionState::Connected);
        assert_eq!(broker.queue_len("q"), 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_closes_channel() {
        // ---
        let broker = MemoryBroker::new();
        let adapter = TransportAdapter::new(broker.attach(), silent_observer());

        adapter.disconnect(Duration::from_millis(100)).await.unwrap();
        assert_eq!(adapter.state(), ConnectionState::Disconnected);

        adapter.disconnect(Duration::from_millis(100)).await.unwrap();
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
    }
}
