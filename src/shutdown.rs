// src/shutdown.rs

//! Process stop-signal wiring.
//!
//! [`exit_on_stop_signal`] runs a teardown future on the first SIGINT or
//! SIGTERM (ctrl-c on non-unix targets) and then exits the process: status 0
//! when teardown succeeded, status 1 when it failed. Further signals while
//! teardown is running are no-ops, so a second ctrl-c cannot interrupt a
//! graceful disconnect half-way.
//!
//! ```no_run
//! # use amqp_rpc::{RpcService, RpcServiceOptions};
//! # use std::sync::Arc;
//! # async fn demo() {
//! let service = RpcService::new(RpcServiceOptions::new("billing"), Arc::new(|_| {}));
//! let stopper = service.clone();
//! amqp_rpc::exit_on_stop_signal(move || async move { stopper.stop().await });
//! # }
//! ```

use std::future::Future;

use crate::macros::{log_error, log_info};
use crate::Result;

/// Install the stop-signal hook. Must be called from within a tokio runtime.
pub fn exit_on_stop_signal<F, Fut>(destroy: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    // ---
    tokio::spawn(async move {
        // Taking the closure doubles as the re-entrancy guard: once teardown
        // has started, later signals find nothing to run.
        let mut destroy = Some(destroy);

        loop {
            if wait_stop_signal().await.is_err() {
                log_error!("failed to listen for stop signals");
                return;
            }

            let Some(destroy) = destroy.take() else {
                log_info!("stop signal received again; shutdown already in progress");
                continue;
            };

            tokio::spawn(async move {
                log_info!("stop signal received; disconnecting");
                match destroy().await {
                    Ok(()) => std::process::exit(0),
                    Err(e) => {
                        log_error!("graceful shutdown failed: {e}");
                        std::process::exit(1);
                    }
                }
            });
        }
    });
}

#[cfg(unix)]
async fn wait_stop_signal() -> std::io::Result<()> {
    // ---
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_stop_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
