//! Integration tests for push/pull replication
//!
//! These tests cover:
//! - Push and pull between two datastores
//! - Conflicting edits converging on the same winner
//! - Push filters and checkpoint advancement
//! - Stop between batches and resume from the checkpoint
//! - Transport retries and giving up
//! - Lifecycle events
//! - Push and pull running at once against one datastore


use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tandem_core::{
    Attachments, Datastore, DocumentRevision, LocalDatabase, ReplicationError, ReplicationEvent,
    ReplicatorBuilder, ReplicatorState, Sequence,
};
use test_helper::{FaultyRemote, body, create, datastore, doc, test_config, wait_terminal};

async fn next_event(stream: &mut tandem_core::replication::EventStream) -> ReplicationEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("no event received")
        .expect("event stream closed")
}

/// Run a push to `remote` and return its terminal event
async fn push_once(source: &Arc<Datastore>, remote: &FaultyRemote) -> ReplicationEvent {
    let replicator = ReplicatorBuilder::push()
        .from(Arc::clone(source))
        .to(remote.clone())
        .config(test_config())
        .build()
        .unwrap();
    let mut events = replicator.subscribe();
    replicator.start().unwrap();
    wait_terminal(&replicator).await;

    loop {
        let event = next_event(&mut events).await;
        if event.is_terminal() {
            return event;
        }
    }
}

#[tokio::test]
async fn test_push_single_document() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    create(&local, "mydoc", json!({ "animal": "cat" }));

    let replicator = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(LocalDatabase::new(Arc::clone(&remote_store)))
        .build()
        .unwrap();
    replicator.start().unwrap();

    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
    assert_eq!(replicator.document_counter(), 1);
    assert_eq!(remote_store.document_count().unwrap(), 1);

    let copied = remote_store.get_document("mydoc").unwrap();
    assert_eq!(copied.body.get("animal"), Some(&json!("cat")));
    assert_eq!(
        remote_store
            .read_checkpoint(replicator.replication_id())
            .unwrap(),
        Some(Sequence::from(1))
    );
}

#[tokio::test]
async fn test_pull_from_remote() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    for i in 0..4 {
        create(&remote_store, &format!("doc{}", i), doc(i));
    }
    let remote = FaultyRemote::new(Arc::clone(&remote_store));

    let replicator = ReplicatorBuilder::pull()
        .from(remote.clone())
        .to(Arc::clone(&local))
        .config(test_config().with_changes_limit(3))
        .build()
        .unwrap();
    replicator.start().unwrap();

    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
    assert_eq!(replicator.document_counter(), 4);
    assert_eq!(replicator.batch_counter(), 2);
    assert_eq!(local.document_count().unwrap(), 4);
    assert!(remote.calls() > 0);

    // Pull checkpoints live on the target, which is the local datastore
    assert_eq!(
        local.read_checkpoint(replicator.replication_id()).unwrap(),
        Some(Sequence::from(4))
    );
}

#[tokio::test]
async fn test_conflicting_edits_converge() {
    let (alice, _) = datastore("alice");
    let (bob, _) = datastore("bob");
    for store in [&alice, &bob] {
        store
            .insert("shared", "1-x", None, body(json!({ "v": 1 })), false)
            .unwrap();
    }
    alice
        .insert("shared", "2-a", Some("1-x"), body(json!({ "v": "alice" })), false)
        .unwrap();
    bob.insert("shared", "2-b", Some("1-x"), body(json!({ "v": "bob" })), false)
        .unwrap();

    let bob_remote = FaultyRemote::new(Arc::clone(&bob));
    assert!(matches!(
        push_once(&alice, &bob_remote).await,
        ReplicationEvent::Completed(_)
    ));

    let pull = ReplicatorBuilder::pull()
        .from(bob_remote)
        .to(Arc::clone(&alice))
        .config(test_config())
        .build()
        .unwrap();
    pull.start().unwrap();
    assert_eq!(wait_terminal(&pull).await, ReplicatorState::Complete);

    for store in [&alice, &bob] {
        let winner = store.get_document("shared").unwrap();
        assert_eq!(winner.rev_id, "2-b");
        assert_eq!(winner.body.get("v"), Some(&json!("bob")));
        assert!(store.is_conflicted("shared").unwrap());

        let mut leaves: Vec<String> = store
            .get_leafs("shared")
            .unwrap()
            .into_iter()
            .map(|r| r.rev_id)
            .collect();
        leaves.sort();
        assert_eq!(leaves, vec!["2-a", "2-b"]);
    }
}

#[tokio::test]
async fn test_resolved_conflict_replicates() {
    let (alice, _) = datastore("alice");
    let (bob, _) = datastore("bob");
    alice
        .insert("shared", "1-x", None, body(json!({ "v": 1 })), false)
        .unwrap();
    alice
        .insert_with_history(
            "shared",
            &["1-x".to_string(), "2-a".to_string()],
            body(json!({ "v": "a" })),
            false,
            Attachments::new(),
        )
        .unwrap();
    alice
        .insert_with_history(
            "shared",
            &["1-x".to_string(), "2-b".to_string()],
            body(json!({ "v": "b" })),
            false,
            Attachments::new(),
        )
        .unwrap();
    assert!(alice.is_conflicted("shared").unwrap());

    // Keep the losing branch; the current winner gets tombstoned
    let kept = alice
        .resolve_conflicts("shared", |leaves| {
            leaves
                .iter()
                .find(|leaf| leaf.rev_id == "2-a")
                .map(|leaf| leaf.rev_id.clone())
        })
        .unwrap();
    assert_eq!(kept.rev_id, "2-a");
    assert!(!alice.is_conflicted("shared").unwrap());

    let remote = FaultyRemote::new(Arc::clone(&bob));
    push_once(&alice, &remote).await;

    let winner = bob.get_document("shared").unwrap();
    assert_eq!(winner.rev_id, "2-a");
    assert!(!bob.is_conflicted("shared").unwrap());
}

#[tokio::test]
async fn test_filter_rejecting_everything_still_checkpoints() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    create(&local, "tom", json!({ "name": "Tom" }));
    create(&local, "jerry", json!({ "name": "Jerry" }));

    let filtered = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(LocalDatabase::new(Arc::clone(&remote_store)))
        .filter(|_: &DocumentRevision| false)
        .build()
        .unwrap();
    let mut events = filtered.subscribe();
    filtered.start().unwrap();

    assert_eq!(wait_terminal(&filtered).await, ReplicatorState::Complete);
    assert_eq!(filtered.document_counter(), 0);
    assert_eq!(remote_store.document_count().unwrap(), 0);
    assert_eq!(
        remote_store
            .read_checkpoint(filtered.replication_id())
            .unwrap(),
        Some(Sequence::from(2))
    );

    next_event(&mut events).await;
    let terminal = next_event(&mut events).await;
    assert_eq!(terminal.summary().stats.documents_filtered, 2);

    // Same source and target share the checkpoint, so nothing is left to push
    let unfiltered = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(LocalDatabase::new(Arc::clone(&remote_store)))
        .build()
        .unwrap();
    assert_eq!(unfiltered.replication_id(), filtered.replication_id());
    unfiltered.start().unwrap();
    assert_eq!(wait_terminal(&unfiltered).await, ReplicatorState::Complete);
    assert_eq!(unfiltered.document_counter(), 0);
    assert_eq!(remote_store.document_count().unwrap(), 0);
}

#[tokio::test]
async fn test_filter_selects_documents() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    create(&local, "tom", json!({ "name": "Tom" }));
    create(&local, "jerry", json!({ "name": "Jerry" }));
    create(&local, "spike", json!({ "name": "Spike" }));

    let replicator = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(LocalDatabase::new(Arc::clone(&remote_store)))
        .filter(|revision: &DocumentRevision| {
            revision.body.get("name") == Some(&json!("Tom"))
        })
        .build()
        .unwrap();
    replicator.start().unwrap();

    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
    assert_eq!(replicator.document_counter(), 1);
    assert_eq!(remote_store.all_document_ids().unwrap(), vec!["tom"]);
}

#[tokio::test]
async fn test_restart_resets_counters() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    create(&local, "a", doc(0));
    create(&local, "b", doc(1));

    let replicator = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(LocalDatabase::new(Arc::clone(&remote_store)))
        .build()
        .unwrap();

    replicator.start().unwrap();
    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
    assert_eq!(replicator.document_counter(), 2);

    create(&local, "c", doc(2));
    replicator.start().unwrap();
    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
    assert_eq!(replicator.document_counter(), 1);
    assert_eq!(remote_store.document_count().unwrap(), 3);
}

#[tokio::test]
async fn test_stop_between_batches_and_resume() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    for i in 0..5 {
        create(&local, &format!("doc{}", i), doc(i));
    }
    let remote = FaultyRemote::new(Arc::clone(&remote_store));

    let replicator = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(remote.clone())
        .config(test_config().with_changes_limit(1))
        .build()
        .unwrap();
    remote.stop_at_checkpoint(&replicator, 2);

    replicator.start().unwrap();
    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Stopped);
    assert_eq!(replicator.batch_counter(), 2);
    assert_eq!(remote_store.document_count().unwrap(), 2);

    replicator.start().unwrap();
    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
    assert_eq!(replicator.document_counter(), 3);
    assert_eq!(remote_store.document_count().unwrap(), 5);
}

#[tokio::test]
async fn test_failed_checkpoint_is_safe_to_retry() {
    let (local, _) = datastore("local");
    let (remote_store, remote_rows) = datastore("remote");
    for i in 0..3 {
        create(&local, &format!("doc{}", i), doc(i));
    }
    let remote = FaultyRemote::new(Arc::clone(&remote_store));
    remote.faults.checkpoint_failures.store(1, Ordering::SeqCst);

    let replicator = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(remote.clone())
        .config(test_config())
        .build()
        .unwrap();

    replicator.start().unwrap();
    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Error);
    assert_eq!(remote_rows.revision_count(), 3);
    assert_eq!(
        remote_store
            .read_checkpoint(replicator.replication_id())
            .unwrap(),
        None
    );

    replicator.start().unwrap();
    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
    assert_eq!(replicator.document_counter(), 0);
    assert_eq!(remote_rows.revision_count(), 3);
    assert_eq!(
        remote_store
            .read_checkpoint(replicator.replication_id())
            .unwrap(),
        Some(Sequence::from(3))
    );
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    create(&local, "a", doc(0));
    let remote = FaultyRemote::new(Arc::clone(&remote_store));
    remote.faults.diff_failures.store(2, Ordering::SeqCst);

    match push_once(&local, &remote).await {
        ReplicationEvent::Completed(summary) => {
            assert_eq!(summary.stats.transport_retries, 2);
            assert_eq!(summary.document_counter, 1);
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(remote_store.document_count().unwrap(), 1);
}

#[tokio::test]
async fn test_too_many_transport_failures_end_in_error() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    create(&local, "a", doc(0));
    let remote = FaultyRemote::new(Arc::clone(&remote_store));
    remote.faults.diff_failures.store(3, Ordering::SeqCst);

    match push_once(&local, &remote).await {
        ReplicationEvent::Errored { summary, cause } => {
            assert_eq!(summary.state, ReplicatorState::Error);
            assert!(matches!(
                cause.as_ref(),
                ReplicationError::TransportExhausted { attempts: 3, .. }
            ));
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(remote_store.document_count().unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_history_fails_document_only() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    create(&local, "a", doc(0));

    // Pull, so the corrupted bulk_get answers come from the remote source
    let remote = FaultyRemote::new(Arc::clone(&remote_store));
    create(&remote_store, "broken", doc(1));
    remote.faults.corrupt_histories.store(true, Ordering::SeqCst);

    let replicator = ReplicatorBuilder::pull()
        .from(remote)
        .to(Arc::clone(&local))
        .config(test_config())
        .build()
        .unwrap();
    let mut events = replicator.subscribe();
    replicator.start().unwrap();

    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
    next_event(&mut events).await;
    let terminal = next_event(&mut events).await;
    assert_eq!(terminal.summary().stats.documents_failed, 1);
    assert!(local.get_document("broken").is_err());
}

#[tokio::test]
async fn test_exactly_one_terminal_event_per_run() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    create(&local, "a", doc(0));

    let replicator = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(LocalDatabase::new(remote_store))
        .build()
        .unwrap();
    let mut events = replicator.subscribe();
    replicator.start().unwrap();
    wait_terminal(&replicator).await;

    let started = next_event(&mut events).await;
    assert!(matches!(started, ReplicationEvent::Started(_)));
    assert_eq!(started.summary().state, ReplicatorState::Started);

    let completed = next_event(&mut events).await;
    assert!(matches!(completed, ReplicationEvent::Completed(_)));
    assert!(completed.summary().finished_at.is_some());

    let extra = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn test_stop_before_start() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");

    let replicator = ReplicatorBuilder::push()
        .from(local)
        .to(LocalDatabase::new(remote_store))
        .build()
        .unwrap();
    replicator.stop();
    assert_eq!(replicator.state(), ReplicatorState::Stopped);

    // A stopped replicator can be started again
    replicator.start().unwrap();
    assert_eq!(wait_terminal(&replicator).await, ReplicatorState::Complete);
}

#[tokio::test]
async fn test_winner_independent_of_arrival_order() {
    let history = |leaf: &str| vec!["1-x".to_string(), leaf.to_string()];
    let (first, _) = datastore("first");
    let (second, _) = datastore("second");

    for (store, order) in [(&first, ["2-a", "2-b"]), (&second, ["2-b", "2-a"])] {
        for leaf in order {
            store
                .insert_with_history(
                    "doc",
                    &history(leaf),
                    body(json!({ "leaf": leaf })),
                    false,
                    Attachments::new(),
                )
                .unwrap();
        }
        // A deeper tombstone never beats a live leaf
        store
            .insert_with_history(
                "doc",
                &["1-x".to_string(), "2-a".to_string(), "3-d".to_string()],
                body(json!({})),
                true,
                Attachments::new(),
            )
            .unwrap();
    }

    assert_eq!(first.get_document("doc").unwrap().rev_id, "2-b");
    assert_eq!(second.get_document("doc").unwrap().rev_id, "2-b");
    assert!(!first.is_conflicted("doc").unwrap());
}

/// Leaf revision ids of every document, for whole-store comparisons
fn leaf_sets(datastore: &Datastore) -> Vec<(String, String, Vec<String>)> {
    let mut ids = datastore.all_document_ids().unwrap();
    ids.sort();
    ids.into_iter()
        .map(|id| {
            let winner = datastore.get_document(&id).unwrap().rev_id;
            let mut leaves: Vec<String> = datastore
                .get_leafs(&id)
                .unwrap()
                .into_iter()
                .map(|rev| rev.rev_id)
                .collect();
            leaves.sort();
            (id, winner, leaves)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_push_and_pull_share_one_datastore() {
    let (local, _) = datastore("local");
    let (remote_store, _) = datastore("remote");
    for i in 0..20 {
        create(&local, &format!("local{}", i), doc(i));
        create(&remote_store, &format!("remote{}", i), doc(i));
    }
    for (store, leaf) in [(&local, "2-l"), (&remote_store, "2-r")] {
        store
            .insert("shared", "1-s", None, body(json!({ "v": 1 })), false)
            .unwrap();
        store
            .insert("shared", leaf, Some("1-s"), body(json!({ "v": leaf })), false)
            .unwrap();
    }

    let remote = LocalDatabase::new(Arc::clone(&remote_store));
    let push = ReplicatorBuilder::push()
        .from(Arc::clone(&local))
        .to(remote.clone())
        .config(test_config().with_changes_limit(4))
        .build()
        .unwrap();
    let pull = ReplicatorBuilder::pull()
        .from(remote)
        .to(Arc::clone(&local))
        .config(test_config().with_changes_limit(4))
        .build()
        .unwrap();

    push.start().unwrap();
    pull.start().unwrap();
    assert_eq!(wait_terminal(&push).await, ReplicatorState::Complete);
    assert_eq!(wait_terminal(&pull).await, ReplicatorState::Complete);

    assert_eq!(local.document_count().unwrap(), 41);
    assert_eq!(leaf_sets(&local), leaf_sets(&remote_store));
    assert!(local.is_conflicted("shared").unwrap());
    assert_eq!(local.get_leafs("shared").unwrap().len(), 2);
    for id in local.all_document_ids().unwrap() {
        for leaf in local.get_leafs(&id).unwrap() {
            let history = local.revision_history(&id, &leaf.rev_id).unwrap();
            assert_eq!(history.len() as u64, leaf.generation());
        }
    }
}
