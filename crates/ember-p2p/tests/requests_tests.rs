//! RequestTable correlation semantics: completion, timeouts, expiry.

use std::time::{Duration, Instant};

use ember_p2p::error::P2pError;
use ember_p2p::requests::RequestTable;
use ember_p2p::types::NodeId;
use ember_p2p::wire::codec;
use ember_p2p::wire::{CommandKind, RequestId};

#[tokio::test]
async fn complete_before_wait_returns_the_answer() {
    let table = RequestTable::new();
    let id = RequestId::random();
    let target = NodeId::random();
    let rx = table.begin(id, CommandKind::Ping, target).unwrap();

    let answer = codec::ping_answer(id);
    assert!(table.complete(id, &target, answer.clone()));

    let got = table.wait_for(id, rx, Duration::from_secs(1)).await.unwrap();
    assert_eq!(got.raw(), answer.raw());
    assert!(table.is_empty());
}

#[tokio::test]
async fn wait_then_complete_wakes_the_waiter() {
    let table = std::sync::Arc::new(RequestTable::new());
    let id = RequestId::random();
    let target = NodeId::random();
    let rx = table.begin(id, CommandKind::RequestNodes, target).unwrap();

    let completer = {
        let table = std::sync::Arc::clone(&table);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            table.complete(id, &target, codec::ping_answer(id))
        })
    };

    let got = table.wait_for(id, rx, Duration::from_secs(2)).await;
    assert!(got.is_ok());
    assert!(completer.await.unwrap());
}

#[tokio::test]
async fn timeout_reaps_the_record() {
    let table = RequestTable::new();
    let id = RequestId::random();
    let target = NodeId::random();
    let rx = table.begin(id, CommandKind::Ping, target).unwrap();

    let started = Instant::now();
    let result = table.wait_for(id, rx, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(P2pError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(table.is_empty(), "timed-out record must be reaped");

    // A late answer for the reaped id is simply discarded.
    assert!(!table.complete(id, &target, codec::ping_answer(id)));
}

#[tokio::test]
async fn completion_fires_at_most_once() {
    let table = RequestTable::new();
    let id = RequestId::random();
    let target = NodeId::random();
    let _rx = table.begin(id, CommandKind::Ping, target).unwrap();

    assert!(table.complete(id, &target, codec::ping_answer(id)));
    for _ in 0..3 {
        assert!(!table.complete(id, &target, codec::ping_answer(id)));
    }
}

#[tokio::test]
async fn answers_from_the_wrong_node_are_dropped() {
    let table = RequestTable::new();
    let id = RequestId::random();
    let target = NodeId::random();
    let rx = table.begin(id, CommandKind::Ping, target).unwrap();

    assert!(!table.complete(id, &NodeId::random(), codec::ping_answer(id)));
    let result = table.wait_for(id, rx, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(P2pError::Timeout)), "spoofed answer must not complete");
}

#[tokio::test]
async fn expiry_sweep_reaps_old_records_and_wakes_waiters() {
    let table = RequestTable::new();
    let target = NodeId::random();

    let old_id = RequestId::random();
    let old_rx = table.begin(old_id, CommandKind::Ping, target).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let young_id = RequestId::random();
    let _young_rx = table.begin(young_id, CommandKind::Ping, target).unwrap();

    // A record at exactly the age boundary counts as expired.
    assert_eq!(table.expire_older_than(Duration::from_millis(60)), 1);
    assert_eq!(table.len(), 1);

    // The expired record's waiter observes a timeout, not a hang.
    let result = table.wait_for(old_id, old_rx, Duration::from_secs(5)).await;
    assert!(matches!(result, Err(P2pError::Timeout)));
}

#[tokio::test]
async fn clear_wakes_every_waiter() {
    let table = std::sync::Arc::new(RequestTable::new());
    let target = NodeId::random();
    let pending: Vec<_> = (0..4)
        .map(|_| {
            let id = RequestId::random();
            (id, table.begin(id, CommandKind::Ping, target).unwrap())
        })
        .collect();

    table.clear();
    for (id, rx) in pending {
        let result = table.wait_for(id, rx, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(P2pError::Timeout)));
    }
}
