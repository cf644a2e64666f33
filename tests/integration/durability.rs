#![allow(missing_docs)]

//! End-to-end durability scenarios driven through the vbucket surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use riptide::{
    DocKey, DurabilityLevel, DurabilityRequirement, Engine, EngineConfig, Item, Status,
    VBucket, VBucketState, Vbid,
};

fn active_vb() -> (Arc<Engine>, Arc<VBucket>) {
    let engine = Engine::new(EngineConfig::small()).expect("engine");
    engine
        .set_vbucket_state(Vbid(0), VBucketState::Active)
        .expect("state");
    let vb = engine.vbucket(Vbid(0)).expect("vbucket");
    (engine, vb)
}

fn requirement(level: DurabilityLevel, timeout: Option<Duration>) -> DurabilityRequirement {
    DurabilityRequirement {
        level,
        timeout,
        cookie: 0,
    }
}

fn durable_write(vb: &VBucket, name: &str, level: DurabilityLevel) -> u64 {
    let out = vb.set_durable(
        Item::new(DocKey::in_default(name.to_owned()), "payload"),
        0,
        requirement(level, None),
    );
    assert_eq!(out.status, Status::Success);
    out.seqno
}

#[test]
fn majority_commit_over_three_node_chain() {
    let (_engine, vb) = active_vb();
    vb.set_replication_topology(&["active", "r1", "r2"])
        .expect("topology");
    let seqno = durable_write(&vb, "k", DurabilityLevel::Majority);
    assert_eq!(seqno, 1);
    assert_eq!(vb.num_tracked_sync_writes(), 1);

    let committed = vb.seqno_ack_received("r1", 1, 0).expect("ack");
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].seqno, 1);
    assert_eq!(vb.num_tracked_sync_writes(), 0);
}

#[test]
fn persist_to_majority_waits_for_local_persistence() {
    let (_engine, vb) = active_vb();
    vb.set_replication_topology(&["active", "r"]).expect("topology");
    for name in ["a", "b", "c"] {
        durable_write(&vb, name, DurabilityLevel::PersistToMajority);
    }
    assert_eq!(vb.num_tracked_sync_writes(), 3);

    // The replica is fully persisted, but the active is not.
    let committed = vb.seqno_ack_received("r", 10, 10).expect("ack");
    assert!(committed.is_empty());
    assert_eq!(vb.num_tracked_sync_writes(), 3);

    while !vb.drain_for_persistence(100).is_empty() {}
    assert_eq!(vb.persistence_seqno(), 3);
    let committed = vb.notify_local_persistence();
    assert_eq!(committed.len(), 3);
    assert_eq!(vb.num_tracked_sync_writes(), 0);

    let stats = vb.durability_stats();
    let active = &stats.nodes[0];
    assert_eq!(active.disk_write_seqno, 3, "position covers the last write");
    assert_eq!(active.disk_ack_seqno, 3);
    let replica = &stats.nodes[1];
    assert_eq!(replica.disk_ack_seqno, 10, "raw acks are retained");
}

#[test]
fn out_of_order_commit_leaves_monitor_usable() {
    let (_engine, vb) = active_vb();
    vb.set_replication_topology(&["active", "r"]).expect("topology");
    let first = durable_write(&vb, "first", DurabilityLevel::PersistToMajority);
    let second = durable_write(&vb, "second", DurabilityLevel::Majority);
    assert_eq!((first, second), (1, 2));

    // Memory ack covers both writes: only the Majority one commits.
    let committed = vb.seqno_ack_received("r", 2, 0).expect("ack");
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].seqno, 2);
    assert_eq!(vb.num_tracked_sync_writes(), 1);

    while !vb.drain_for_persistence(100).is_empty() {}
    vb.notify_local_persistence();
    let committed = vb.seqno_ack_received("r", 2, 1).expect("ack");
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].seqno, 1);
    assert_eq!(vb.num_tracked_sync_writes(), 0);

    // Subsequent tracked writes must not trip over stale positions.
    let third = durable_write(&vb, "third", DurabilityLevel::Majority);
    let committed = vb.seqno_ack_received("r", third, 1).expect("ack");
    assert_eq!(committed.len(), 1);
}

#[test]
fn timeouts_abort_in_any_order() {
    let (_engine, vb) = active_vb();
    vb.set_replication_topology(&["active", "r"]).expect("topology");
    let start = Instant::now();
    let writes = [
        ("t20", Some(Duration::from_millis(20))),
        ("t1", Some(Duration::from_millis(1))),
        ("t50000", Some(Duration::from_millis(50_000))),
    ];
    for (name, timeout) in writes {
        let out = vb.set_durable(
            Item::new(DocKey::in_default(name.to_owned()), "v"),
            0,
            requirement(DurabilityLevel::PersistToMajority, timeout),
        );
        assert_eq!(out.status, Status::Success);
    }
    assert_eq!(vb.num_tracked_sync_writes(), 3);

    let aborted = vb.process_durability_timeout(start + Duration::from_millis(10_000));
    assert_eq!(aborted.len(), 2, "20ms and 1ms writes expire");
    assert_eq!(vb.num_tracked_sync_writes(), 1);

    let aborted = vb.process_durability_timeout(start + Duration::from_millis(100_000));
    assert_eq!(aborted.len(), 1);
    assert_eq!(vb.num_tracked_sync_writes(), 0);
}

#[test]
fn untimed_writes_survive_any_scan() {
    let (_engine, vb) = active_vb();
    vb.set_replication_topology(&["active", "r"]).expect("topology");
    durable_write(&vb, "forever", DurabilityLevel::PersistToMajority);
    let aborted = vb.process_durability_timeout(Instant::now() + Duration::from_secs(86_400));
    assert!(aborted.is_empty());
    assert_eq!(vb.num_tracked_sync_writes(), 1);
}

#[test]
fn durable_write_without_topology_is_not_stored() {
    let (_engine, vb) = active_vb();
    let out = vb.set_durable(
        Item::new(DocKey::in_default("k"), "v"),
        0,
        requirement(DurabilityLevel::Majority, None),
    );
    assert_eq!(out.status, Status::NotStored);
    assert_eq!(vb.num_tracked_sync_writes(), 0);
}

#[test]
fn topology_validation_rejects_bad_chains() {
    let (_engine, vb) = active_vb();
    assert!(vb.set_replication_topology(&[]).is_err());
    assert!(vb
        .set_replication_topology(&["a", "b", "c", "d", "e"])
        .is_err());
    assert!(vb.set_replication_topology(&["a", "b", "a"]).is_err());
    assert!(vb.set_replication_topology(&["a", "b", "c", "d"]).is_ok());
}

#[test]
fn acks_from_unknown_nodes_are_rejected() {
    let (_engine, vb) = active_vb();
    vb.set_replication_topology(&["active", "r"]).expect("topology");
    durable_write(&vb, "k", DurabilityLevel::Majority);
    assert!(vb.seqno_ack_received("stranger", 1, 0).is_err());
    assert_eq!(vb.num_tracked_sync_writes(), 1);
}

#[test]
fn commit_cookies_round_trip_to_the_caller() {
    let (_engine, vb) = active_vb();
    vb.set_replication_topology(&["active", "r"]).expect("topology");
    let out = vb.set_durable(
        Item::new(DocKey::in_default("k"), "v"),
        0,
        DurabilityRequirement {
            level: DurabilityLevel::Majority,
            timeout: None,
            cookie: 0xdead_beef,
        },
    );
    assert_eq!(out.status, Status::Success);
    let committed = vb.seqno_ack_received("r", out.seqno, 0).expect("ack");
    assert_eq!(committed[0].cookie, 0xdead_beef);
}
