//! Pending-request table: correlation id → one-shot completion signal.
//!
//! An entry is created exactly when a request is registered and removed
//! exactly once, by whichever comes first of: the matching response
//! ([`PendingTable::complete`]), the caller giving up ([`PendingTable::remove`]
//! on timeout or cancellation), or session termination
//! ([`PendingTable::drain`]). Removal and delivery happen under the same
//! lock, so the outcomes are mutually exclusive. The deadline itself is
//! owned by the waiting caller.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{AppError, Result};

/// Receiving half handed to the caller that registered a request.
pub(crate) type Completion = oneshot::Receiver<Result<Value>>;

#[derive(Debug)]
struct PendingRequest {
    tx: oneshot::Sender<Result<Value>>,
    method: String,
}

/// In-flight requests of one session, keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
}

impl PendingTable {
    /// Register `id`; the caller must have checked [`contains`](Self::contains).
    pub(crate) fn insert(&mut self, id: u64, method: &str) -> Completion {
        debug_assert!(!self.entries.contains_key(&id), "correlation id reused");
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingRequest {
                tx,
                method: method.to_owned(),
            },
        );
        rx
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Deliver `outcome` to the waiter registered under `id`.
    ///
    /// Returns the request's method when an entry was found, `None` for
    /// unknown (stale, duplicate, or timed-out) ids.
    pub(crate) fn complete(&mut self, id: u64, outcome: Result<Value>) -> Option<String> {
        let entry = self.entries.remove(&id)?;
        // The waiter may have been dropped without unregistering; that is fine.
        let _ = entry.tx.send(outcome);
        Some(entry.method)
    }

    /// Unregister `id` without delivering anything.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Resolve every entry with an error built by `err`; returns how many.
    pub(crate) fn drain(&mut self, err: impl Fn() -> AppError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(err()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
