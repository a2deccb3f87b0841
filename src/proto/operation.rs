// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Operation: a future resolving an outgoing request by sequence number.
// Grounded on original_source/src/core/inc/iincstream.cpp's async
// completion-callback pattern; the deadline sweep is driven by the owning
// Connection's event loop (proto::connection) via tokio::time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::IncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Done,
    Failed,
    Timeout,
    Cancelled,
}

/// The terminal outcome handed to a completion callback, invoked exactly
/// once per Operation.
#[derive(Debug, Clone)]
pub enum Outcome {
    Done(Bytes),
    Failed(IncError),
    Timeout,
    Cancelled,
}

type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

struct Inner {
    state: OperationState,
    callback: Option<Callback>,
}

/// A single outstanding request, keyed by sequence number within its
/// owning Connection.
pub struct Operation {
    seq: u32,
    deadline: Instant,
    inner: Mutex<Inner>,
}

impl Operation {
    fn new(seq: u32, deadline: Instant, callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            seq,
            deadline,
            inner: Mutex::new(Inner { state: OperationState::Pending, callback: Some(callback) }),
        })
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().unwrap().state
    }

    /// Resolve with `outcome`. A no-op if already resolved — the callback
    /// fires exactly once.
    fn complete(&self, state: OperationState, outcome: Outcome) {
        let cb = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != OperationState::Pending {
                return;
            }
            inner.state = state;
            inner.callback.take()
        };
        if let Some(cb) = cb {
            cb(outcome);
        }
    }
}

/// Per-connection map of outstanding operations, keyed by sequence number.
/// Sequence numbers are monotonic per connection; 0 is reserved and never
/// issued.
pub struct OperationTable {
    next_seq: Mutex<u32>,
    ops: Mutex<HashMap<u32, Arc<Operation>>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self { next_seq: Mutex::new(1), ops: Mutex::new(HashMap::new()) }
    }

    /// Allocate the next sequence number (never 0, wraps past `u32::MAX`
    /// back to 1).
    pub fn next_seq(&self) -> u32 {
        let mut seq = self.next_seq.lock().unwrap();
        let v = *seq;
        *seq = if v == u32::MAX { 1 } else { v + 1 };
        v
    }

    /// Register a new pending operation with the given timeout, returning
    /// its sequence number.
    pub fn create(&self, timeout: Duration, callback: Callback) -> u32 {
        let seq = self.next_seq();
        let op = Operation::new(seq, Instant::now() + timeout, callback);
        self.ops.lock().unwrap().insert(seq, op);
        seq
    }

    /// Resolve the operation for `seq` with a successful reply body.
    pub fn complete(&self, seq: u32, body: Bytes) {
        if let Some(op) = self.ops.lock().unwrap().remove(&seq) {
            op.complete(OperationState::Done, Outcome::Done(body));
        }
    }

    /// Resolve the operation for `seq` with a transport/protocol failure.
    pub fn fail(&self, seq: u32, err: IncError) {
        if let Some(op) = self.ops.lock().unwrap().remove(&seq) {
            op.complete(OperationState::Failed, Outcome::Failed(err));
        }
    }

    /// User-initiated cancel. Idempotent: cancelling twice, or cancelling
    /// an already-resolved operation, is a no-op.
    pub fn cancel(&self, seq: u32) {
        if let Some(op) = self.ops.lock().unwrap().remove(&seq) {
            op.complete(OperationState::Cancelled, Outcome::Cancelled);
        }
    }

    /// Move every operation whose deadline has passed to TIMEOUT, firing
    /// its callback. Called periodically from the Connection's event loop.
    pub fn sweep_timeouts(&self, now: Instant) {
        let expired: Vec<Arc<Operation>> = {
            let mut ops = self.ops.lock().unwrap();
            let expired_seqs: Vec<u32> = ops
                .iter()
                .filter(|(_, op)| op.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();
            expired_seqs.into_iter().filter_map(|seq| ops.remove(&seq)).collect()
        };
        for op in expired {
            op.complete(OperationState::Timeout, Outcome::Timeout);
        }
    }

    /// The nearest deadline among pending operations, if any — used to
    /// re-arm the event loop's sweep timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.ops.lock().unwrap().values().map(|op| op.deadline).min()
    }

    pub fn pending_count(&self) -> usize {
        self.ops.lock().unwrap().len()
    }
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn complete_fires_callback_exactly_once() {
        let table = OperationTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let seq = table.create(Duration::from_secs(5), Box::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        table.complete(seq, Bytes::from_static(b"42"));
        table.complete(seq, Bytes::from_static(b"43")); // no-op, already removed
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn sweep_moves_expired_operations_to_timeout() {
        let table = OperationTable::new();
        let fired = Arc::new(Mutex::new(None));
        let fired2 = Arc::clone(&fired);
        let seq = table.create(Duration::from_millis(0), Box::new(move |o| {
            *fired2.lock().unwrap() = Some(matches!(o, Outcome::Timeout));
        }));
        std::thread::sleep(Duration::from_millis(5));
        table.sweep_timeouts(Instant::now());
        assert_eq!(*fired.lock().unwrap(), Some(true));
        assert_eq!(table.pending_count(), 0);
        let _ = seq;
    }

    #[test]
    fn cancel_is_idempotent() {
        let table = OperationTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let seq = table.create(Duration::from_secs(5), Box::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        table.cancel(seq);
        table.cancel(seq);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequence_numbers_never_issue_zero() {
        let table = OperationTable::new();
        for _ in 0..5 {
            assert_ne!(table.next_seq(), 0);
        }
    }
}
