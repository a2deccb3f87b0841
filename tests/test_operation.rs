// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// OperationTable integration tests: mixed deadlines swept together, and
// next_deadline tracking the nearest pending operation for the event loop's
// sweep timer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use inc_runtime::proto::{OperationTable, Outcome};

#[test]
fn sweep_only_times_out_operations_past_their_own_deadline() {
    let table = OperationTable::new();
    let outcomes: Arc<Mutex<Vec<(u32, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&outcomes);
    let short = table.create(Duration::from_millis(0), Box::new(move |out| {
        o.lock().unwrap().push((1, matches!(out, Outcome::Timeout)));
    }));

    let o = Arc::clone(&outcomes);
    let long = table.create(Duration::from_secs(60), Box::new(move |out| {
        o.lock().unwrap().push((2, matches!(out, Outcome::Timeout)));
    }));

    std::thread::sleep(Duration::from_millis(5));
    table.sweep_timeouts(Instant::now());

    let fired = outcomes.lock().unwrap().clone();
    assert_eq!(fired, vec![(1, true)]);
    assert_eq!(table.pending_count(), 1);

    table.complete(long, bytes::Bytes::new());
    assert_eq!(table.pending_count(), 0);
    let _ = short;
}

#[test]
fn next_deadline_tracks_the_nearest_pending_operation() {
    let table = OperationTable::new();
    assert_eq!(table.next_deadline(), None);

    let _far = table.create(Duration::from_secs(10), Box::new(|_| {}));
    let near_deadline_before = Instant::now() + Duration::from_millis(50);
    let _near = table.create(Duration::from_millis(50), Box::new(|_| {}));

    let nearest = table.next_deadline().expect("an operation is pending");
    assert!(nearest <= near_deadline_before + Duration::from_millis(20));
}

#[test]
fn cancel_does_not_affect_sibling_operations_on_the_same_table() {
    let table = OperationTable::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let c1 = Arc::clone(&calls);
    let cancelled = table.create(Duration::from_secs(5), Box::new(move |_| {
        c1.fetch_add(1, Ordering::SeqCst);
    }));
    let c2 = Arc::clone(&calls);
    let survivor = table.create(Duration::from_secs(5), Box::new(move |_| {
        c2.fetch_add(10, Ordering::SeqCst);
    }));

    table.cancel(cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(table.pending_count(), 1);

    table.complete(survivor, bytes::Bytes::new());
    assert_eq!(calls.load(Ordering::SeqCst), 11);
}
