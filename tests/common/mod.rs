// tests/common/mod.rs

//! Shared fixtures for the integration suite.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use amqp_rpc::{ErrorObserver, RpcError};

/// Observer that swallows everything; for tests where errors are not the
/// point.
pub fn silent_observer() -> ErrorObserver {
    Arc::new(|_| {})
}

/// Observer that records every reported error.
pub fn collecting_observer() -> (ErrorObserver, Arc<Mutex<Vec<RpcError>>>) {
    // ---
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer: ErrorObserver = Arc::new(move |e| {
        sink.lock().expect("observer sink poisoned").push(e);
    });
    (observer, seen)
}

pub fn errors_reported(seen: &Arc<Mutex<Vec<RpcError>>>) -> usize {
    seen.lock().expect("observer sink poisoned").len()
}
