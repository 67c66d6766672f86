//! Two or more replicas syncing through a shared in-memory peer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use opsync_core::{ConflictId, Timestamp};
use opsync_events::{CounterIncremented, EventPayload, EventType, PersonAssigned, RegisterSet, RegisterValue};
use opsync_infra::event_store::{EventStore, InMemoryEventStore, OutboxStatus, RetryPolicy};
use opsync_infra::projections::{ConflictsProjection, CountersProjection, RegistersProjection, RosterProjection};
use opsync_sync::{
    ConflictError, ConflictPolicies, ConflictPolicy, InMemoryRemote, ManualResolution, Replica, RoleUnionResolver,
    SkipReason, SyncError,
};

fn increment(key: &str, amount: i64) -> EventPayload {
    EventPayload::CounterIncremented(CounterIncremented {
        key: key.to_string(),
        amount,
    })
}

fn set(key: &str, value: i64) -> EventPayload {
    EventPayload::RegisterSet(RegisterSet {
        key: key.to_string(),
        value: RegisterValue::Int(value),
    })
}

fn assign(person: &str, roles: &[&str], assignment: &str) -> EventPayload {
    EventPayload::PersonAssigned(PersonAssigned {
        person_id: person.to_string(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        assignment: assignment.to_string(),
    })
}

async fn replica(remote: &Arc<InMemoryRemote>, policies: ConflictPolicies) -> Replica {
    opsync_observability::init_for_tests();
    Replica::builder(remote.clone())
        .with_policies(policies)
        .build()
        .await
        .unwrap()
}

fn counter(replica: &Replica, key: &str) -> Option<i64> {
    replica
        .state::<CountersProjection>(CountersProjection::NAME)
        .unwrap()
        .get(key)
        .copied()
}

fn register(replica: &Replica, key: &str) -> Option<RegisterValue> {
    replica
        .state::<RegistersProjection>(RegistersProjection::NAME)
        .unwrap()
        .get(key)
        .map(|entry| entry.value.clone())
}

async fn local_resolutions(replica: &Replica) -> usize {
    let resolved = replica.store().by_type(EventType::ConflictResolved, 100).await.unwrap();
    resolved.iter().filter(|stored| stored.local).count()
}

async fn sync_all(replicas: &[&Replica]) {
    for replica in replicas {
        let report = replica.sync_now().await.unwrap();
        assert_eq!(report.skipped, None);
        assert_eq!(report.inbox_failed, 0);
    }
}

#[tokio::test]
async fn concurrent_increments_sum_on_every_replica() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = replica(&remote, ConflictPolicies::default()).await;
    let b = replica(&remote, ConflictPolicies::default()).await;

    a.emit(increment("cots", 5)).await.unwrap();
    b.emit(increment("cots", 3)).await.unwrap();

    sync_all(&[&a, &b, &a]).await;

    assert_eq!(counter(&a, "cots"), Some(8));
    assert_eq!(counter(&b, "cots"), Some(8));
}

#[tokio::test]
async fn later_register_write_wins_regardless_of_arrival() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = replica(&remote, ConflictPolicies::default()).await;
    let b = replica(&remote, ConflictPolicies::default()).await;

    a.emit_at(set("generators", 10), Timestamp::from_millis(100)).await.unwrap();
    b.emit_at(set("generators", 7), Timestamp::from_millis(90)).await.unwrap();

    sync_all(&[&a, &b, &a]).await;

    assert_eq!(register(&a, "generators"), Some(RegisterValue::Int(10)));
    assert_eq!(register(&b, "generators"), Some(RegisterValue::Int(10)));

    // each side recorded how it settled the conflict
    for replica in [&a, &b] {
        assert_eq!(local_resolutions(replica).await, 1);
    }
}

#[tokio::test]
async fn outbox_item_fails_permanently_after_max_retries() {
    let remote = Arc::new(InMemoryRemote::new());
    let retry = RetryPolicy {
        base_delay: Duration::ZERO,
        ..RetryPolicy::default()
    };
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::with_retry_policy(retry));
    let a = Replica::builder(remote.clone())
        .with_store(store.clone())
        .build()
        .await
        .unwrap();

    let id = a.emit(set("fuel", 1)).await.unwrap();
    remote.fail_next_sends(5);

    for attempt in 1..=5u32 {
        let report = a.sync_now().await.unwrap();
        assert_eq!(report.failed, 1, "attempt {attempt}");
        let item = store.outbox_item(id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, attempt);
        let expected = if attempt < 5 { OutboxStatus::Pending } else { OutboxStatus::Failed };
        assert_eq!(item.status, expected);
    }

    // permanently failed items are no longer attempted
    let report = a.sync_now().await.unwrap();
    assert_eq!(report.sent + report.failed, 0);
    assert_eq!(store.failed_outbox().await.unwrap().len(), 1);
    assert!(remote.events().is_empty());

    store.retry_outbox(id, Timestamp::now()).await.unwrap();
    assert_eq!(a.sync_now().await.unwrap().sent, 1);
    assert_eq!(remote.events().len(), 1);
}

#[tokio::test]
async fn concurrent_assignments_union_roles() {
    let remote = Arc::new(InMemoryRemote::new());
    let policies = ConflictPolicies::default()
        .with_policy(EventType::PersonAssigned, ConflictPolicy::domain_specific(RoleUnionResolver));
    let a = replica(&remote, policies.clone()).await;
    let b = replica(&remote, policies).await;

    a.emit_at(assign("p-17", &["medic"], "shelter-north"), Timestamp::from_millis(1_000))
        .await
        .unwrap();
    b.emit_at(assign("p-17", &["driver"], "depot"), Timestamp::from_millis(1_005))
        .await
        .unwrap();

    sync_all(&[&a, &b, &a, &b, &a]).await;

    let expected: BTreeSet<String> = ["driver", "medic"].iter().map(|r| r.to_string()).collect();
    for replica in [&a, &b] {
        let roster = replica.state::<RosterProjection>(RosterProjection::NAME).unwrap();
        let entry = &roster["p-17"];
        assert_eq!(entry.roles, expected);
        assert_eq!(entry.assignment.as_deref(), Some("depot"));

        assert_eq!(local_resolutions(replica).await, 1);
    }
}

#[tokio::test]
async fn manual_policy_escalates_once_and_applies_nothing() {
    let remote = Arc::new(InMemoryRemote::new());
    let policies = ConflictPolicies::default().with_policy(EventType::RegisterSet, ConflictPolicy::Manual);
    let a = replica(&remote, policies.clone()).await;
    let b = replica(&remote, policies).await;

    let first = a.emit_at(set("water", 1), Timestamp::from_millis(2_000)).await.unwrap();
    let second = b.emit_at(set("water", 2), Timestamp::from_millis(2_010)).await.unwrap();
    let conflict_id = ConflictId::for_pair(first.id, second.id);

    sync_all(&[&a, &b, &a, &b, &a, &b]).await;

    for replica in [&a, &b] {
        let detected = replica.store().by_type(EventType::ConflictDetected, 10).await.unwrap();
        assert_eq!(detected.len(), 1);
        let conflicts = replica.state::<ConflictsProjection>(ConflictsProjection::NAME).unwrap();
        assert_eq!(conflicts.open.len(), 1);
        assert!(conflicts.is_open(&conflict_id.to_string()));
    }
    // neither side applied the other's write
    assert_eq!(register(&a, "water"), Some(RegisterValue::Int(1)));
    assert_eq!(register(&b, "water"), Some(RegisterValue::Int(2)));
    assert!(a.store().get(second.id).await.unwrap().is_none());
    assert!(b.store().get(first.id).await.unwrap().is_none());

    // a did not raise the detection, but keeping "local" still means its own value
    a.resolve_conflict(conflict_id, ManualResolution::KeepLocal).await.unwrap();
    sync_all(&[&a, &b, &a]).await;

    for replica in [&a, &b] {
        assert_eq!(register(replica, "water"), Some(RegisterValue::Int(1)));
        let conflicts = replica.state::<ConflictsProjection>(ConflictsProjection::NAME).unwrap();
        assert!(conflicts.open.is_empty());
    }
    let again = b.resolve_conflict(conflict_id, ManualResolution::TakeRemote).await;
    assert!(matches!(again, Err(SyncError::Conflict(ConflictError::AlreadyResolved(_)))));
}

#[tokio::test]
async fn conflict_follow_ups_reach_the_peer() {
    let remote = Arc::new(InMemoryRemote::new());
    let policies =
        ConflictPolicies::default().with_policy(EventType::RegisterSet, ConflictPolicy::FirstWriteWins);
    let a = replica(&remote, policies.clone()).await;
    let b = replica(&remote, policies).await;

    let later = a.emit_at(set("generators", 10), Timestamp::from_millis(100)).await.unwrap();
    b.emit_at(set("generators", 7), Timestamp::from_millis(90)).await.unwrap();

    sync_all(&[&a, &b, &a, &b, &a]).await;

    // b re-asserted its earlier write in reaction to a's; a must have received it
    let reasserted = remote
        .events()
        .into_iter()
        .find(|event| event.causation_id == Some(later.id) && event.event_type == EventType::RegisterSet)
        .expect("re-assertion delivered to the peer");
    assert_ne!(reasserted.correlation_id, later.correlation_id);
    assert!(a.store().get(reasserted.id).await.unwrap().is_some());
    assert_eq!(remote.replayed_batches(), 0);

    assert_eq!(register(&a, "generators"), Some(RegisterValue::Int(7)));
    assert_eq!(register(&b, "generators"), Some(RegisterValue::Int(7)));
}

#[tokio::test]
async fn offline_replica_queues_and_delivers_on_reconnect() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = replica(&remote, ConflictPolicies::default()).await;
    let b = replica(&remote, ConflictPolicies::default()).await;

    sync_all(&[&a]).await;
    b.go_offline();
    b.emit(increment("blankets", 40)).await.unwrap();

    let report = b.sync_now().await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::Offline));
    assert!(remote.events().is_empty());

    a.emit(increment("blankets", 2)).await.unwrap();
    sync_all(&[&a]).await;

    b.go_online();
    sync_all(&[&b, &a]).await;

    // b's event reached the peer after a's cursor but is still delivered
    assert_eq!(counter(&a, "blankets"), Some(42));
    assert_eq!(counter(&b, "blankets"), Some(42));
}

#[tokio::test]
async fn repeated_syncs_are_idempotent() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = replica(&remote, ConflictPolicies::default()).await;
    let b = replica(&remote, ConflictPolicies::default()).await;

    a.emit(increment("radios", 4)).await.unwrap();
    for _ in 0..3 {
        sync_all(&[&a, &b]).await;
    }

    assert_eq!(remote.events().len(), 1);
    assert_eq!(counter(&b, "radios"), Some(4));
    assert_eq!(b.store().stats().await.unwrap().events, 1);
}

#[tokio::test]
async fn reopened_replica_rebuilds_projections() {
    let remote = Arc::new(InMemoryRemote::new());
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let first = Replica::builder(remote.clone())
        .with_store(store.clone())
        .build()
        .await
        .unwrap();
    first.emit(increment("meals", 120)).await.unwrap();
    first.snapshot().await.unwrap();
    first.emit(increment("meals", 30)).await.unwrap();
    let last = first.bus().clock().last();
    drop(first);

    let reopened = Replica::builder(remote).with_store(store).build().await.unwrap();
    assert_eq!(counter(&reopened, "meals"), Some(150));
    assert!(reopened.bus().clock().last() >= last);
}

#[tokio::test]
async fn projection_listeners_see_synced_changes() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = replica(&remote, ConflictPolicies::default()).await;
    let b = replica(&remote, ConflictPolicies::default()).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = b
        .subscribe_to_projection(CountersProjection::NAME, move |state| {
            let _ = tx.send(state["tarps"].as_i64());
        })
        .unwrap();

    a.emit(increment("tarps", 9)).await.unwrap();
    sync_all(&[&a, &b]).await;

    assert_eq!(rx.recv().await.unwrap(), Some(9));
    assert_eq!(b.get_projection(CountersProjection::NAME).unwrap()["tarps"], 9);
}
