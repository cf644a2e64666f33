#![allow(missing_docs)]

//! The stored-value state machine, exercised through the vbucket
//! mutation surface.

use std::sync::Arc;

use riptide::types::datatype;
use riptide::vbucket::xattr::{self, XattrPair};
use riptide::{
    ConflictResolutionMode, DocKey, Engine, EngineConfig, Item, QueueExpired, Status, VBucket,
    VBucketState, Vbid,
};

fn engine_with(config: EngineConfig) -> (Arc<Engine>, Arc<VBucket>) {
    let engine = Engine::new(config).expect("engine");
    engine
        .set_vbucket_state(Vbid(0), VBucketState::Active)
        .expect("state");
    let vb = engine.vbucket(Vbid(0)).expect("vbucket");
    (engine, vb)
}

fn active_vb() -> (Arc<Engine>, Arc<VBucket>) {
    engine_with(EngineConfig::small())
}

fn key(name: &str) -> DocKey {
    DocKey::in_default(name.to_owned())
}

fn item(name: &str, value: &str) -> Item {
    Item::new(key(name), value.to_owned())
}

#[test]
fn cas_over_expired_value_returns_not_found_and_leaves_it() {
    let (_engine, vb) = active_vb();
    let stored = vb.set(item("k", "v").with_exptime(1), 0);
    assert_eq!(stored.status, Status::Success);

    let retry = vb.set(item("k", "v2"), stored.cas);
    assert_eq!(retry.status, Status::KeyNotFound, "cas over expired");

    // The failed write must not have touched the slot.
    let (status, meta) = vb.get_meta_data(&key("k"));
    assert_eq!(status, Status::Success);
    let meta = meta.unwrap();
    assert!(!meta.deleted, "value unchanged by the failed cas set");
    assert_eq!(meta.cas, stored.cas);
}

#[test]
fn unconditional_set_revives_an_expired_value() {
    let (_engine, vb) = active_vb();
    vb.set(item("k", "v").with_exptime(1), 0);
    let out = vb.set(item("k", "fresh"), 0);
    assert_eq!(out.status, Status::Success);
    let got = vb.get(&key("k"), QueueExpired::Yes);
    assert_eq!(got.status, Status::Success);
}

#[test]
fn add_semantics() {
    let (_engine, vb) = active_vb();
    assert_eq!(vb.add(item("k", "v")).status, Status::Success);
    assert_eq!(vb.add(item("k", "again")).status, Status::NotStored);
    vb.delete_item(&key("k"), 0);
    assert_eq!(vb.add(item("k", "reborn")).status, Status::Success);
    // Add over an expired value is allowed.
    vb.set(item("e", "v").with_exptime(1), 0);
    assert_eq!(vb.add(item("e", "new")).status, Status::Success);
}

#[test]
fn replace_semantics() {
    let (_engine, vb) = active_vb();
    assert_eq!(vb.replace(item("k", "v"), 0).status, Status::KeyNotFound);
    vb.set(item("k", "v"), 0);
    assert_eq!(vb.replace(item("k", "v2"), 0).status, Status::Success);
    vb.delete_item(&key("k"), 0);
    assert_eq!(
        vb.replace(item("k", "v3"), 0).status,
        Status::KeyNotFound,
        "live replace over a tombstone is forbidden"
    );
    // The deleted-to-deleted transition stays permitted.
    let tombstone = item("k", "").into_deleted();
    assert_eq!(vb.replace(tombstone, 0).status, Status::Success);
}

#[test]
fn delete_with_wrong_cas_fails() {
    let (_engine, vb) = active_vb();
    let stored = vb.set(item("k", "v"), 0);
    assert_eq!(
        vb.delete_item(&key("k"), stored.cas + 1).status,
        Status::KeyExists
    );
    assert_eq!(vb.delete_item(&key("k"), stored.cas).status, Status::Success);
    assert_eq!(vb.delete_item(&key("k"), 0).status, Status::KeyNotFound);
}

#[test]
fn lock_rejects_other_cas_until_expiry() {
    let (_engine, vb) = active_vb();
    vb.set(item("k", "v"), 0);
    let locked = vb.get_locked(&key("k"), Some(1));
    assert_eq!(locked.status, Status::Success);
    let lock_cas = locked.item.unwrap().cas;

    assert_eq!(vb.set(item("k", "w"), 0).status, Status::Locked);
    assert_eq!(vb.set(item("k", "w"), lock_cas + 1).status, Status::Locked);
    assert_eq!(
        vb.get_locked(&key("k"), Some(1)).status,
        Status::LockedTmpFail
    );

    std::thread::sleep(std::time::Duration::from_millis(2100));
    let out = vb.set(item("k", "after-expiry"), 0);
    assert_eq!(out.status, Status::Success, "lock lapsed with time");
}

#[test]
fn lock_holder_cas_writes_and_unlocks() {
    let (_engine, vb) = active_vb();
    vb.set(item("k", "v"), 0);
    let lock_cas = vb.get_locked(&key("k"), Some(15)).item.unwrap().cas;
    assert_eq!(vb.set(item("k", "mine"), lock_cas).status, Status::Success);
    // The write released the lock.
    assert_eq!(vb.set(item("k", "next"), 0).status, Status::Success);
}

#[test]
fn revision_seqno_conflict_resolution() {
    let (_engine, vb) = active_vb();
    let local = vb.set(item("k", "local"), 0);

    let mut stale = item("k", "stale");
    stale.rev_seqno = 0;
    stale.cas = 1;
    assert_eq!(vb.set_with_meta(stale, 0, true).status, Status::KeyExists);

    let mut tie_loser = item("k", "tie");
    tie_loser.rev_seqno = 1;
    tie_loser.cas = local.cas - 1;
    assert_eq!(
        vb.set_with_meta(tie_loser, 0, true).status,
        Status::KeyExists,
        "equal revisions tie-break on cas"
    );

    let mut winner = item("k", "winner");
    winner.rev_seqno = 9;
    winner.cas = 42;
    assert_eq!(vb.set_with_meta(winner, 0, true).status, Status::Success);
    let meta = vb.get_meta_data(&key("k")).1.unwrap();
    assert_eq!(meta.rev_seqno, 9);
    assert_eq!(meta.cas, 42, "remote metadata applied verbatim");
    assert_eq!(vb.op_counters().conflict_resolution_losses, 2);
}

#[test]
fn last_write_wins_conflict_resolution() {
    let mut config = EngineConfig::small();
    config.conflict_resolution = ConflictResolutionMode::LastWriteWins;
    let (_engine, vb) = engine_with(config);
    let local = vb.set(item("k", "local"), 0);

    let mut high_rev_low_cas = item("k", "remote");
    high_rev_low_cas.rev_seqno = 100;
    high_rev_low_cas.cas = local.cas - 1;
    assert_eq!(
        vb.set_with_meta(high_rev_low_cas, 0, true).status,
        Status::KeyExists,
        "lww ignores revisions"
    );

    let mut newer = item("k", "newer");
    newer.rev_seqno = 1;
    newer.cas = local.cas + 1;
    assert_eq!(vb.set_with_meta(newer, 0, true).status, Status::Success);
}

#[test]
fn delete_with_meta_preserves_supplied_system_xattrs() {
    let (_engine, vb) = active_vb();
    vb.set(item("k", "v"), 0);

    let sync_xattr = vec![XattrPair {
        key: b"_sync".to_vec(),
        value: b"{\"rev\":\"1-abc\"}".to_vec(),
    }];
    let tombstone_body = xattr::build(&sync_xattr, &[]);
    let mut tombstone = Item::new(key("k"), tombstone_body)
        .with_datatype(datatype::XATTR)
        .into_deleted();
    tombstone.rev_seqno = 99;
    tombstone.cas = u64::MAX - 5;

    let out = vb.delete_with_meta(tombstone, 0);
    assert_eq!(out.status, Status::Success);
    let meta = vb.get_meta_data(&key("k")).1.unwrap();
    assert!(meta.deleted);
    assert!(
        datatype::is_xattr(meta.datatype),
        "tombstone keeps its xattr payload"
    );
    assert_eq!(meta.rev_seqno, 99);
}

#[test]
fn local_delete_prunes_user_xattrs() {
    let (_engine, vb) = active_vb();
    let pairs = vec![
        XattrPair {
            key: b"_sys".to_vec(),
            value: b"keep".to_vec(),
        },
        XattrPair {
            key: b"user".to_vec(),
            value: b"drop".to_vec(),
        },
    ];
    let body = xattr::build(&pairs, b"document-body");
    vb.set(
        Item::new(key("k"), body).with_datatype(datatype::XATTR | datatype::JSON),
        0,
    );
    assert_eq!(vb.delete_item(&key("k"), 0).status, Status::Success);
    let meta = vb.get_meta_data(&key("k")).1.unwrap();
    assert!(meta.deleted);
    assert!(
        datatype::is_xattr(meta.datatype),
        "system xattrs survive the soft delete"
    );
}

#[test]
fn delete_of_plain_value_leaves_bare_tombstone() {
    let (_engine, vb) = active_vb();
    vb.set(item("k", "plain"), 0);
    vb.delete_item(&key("k"), 0);
    let meta = vb.get_meta_data(&key("k")).1.unwrap();
    assert!(meta.deleted);
    assert_eq!(meta.datatype, datatype::RAW);
}

#[test]
fn expired_read_is_a_soft_delete_on_active_only() {
    let (_engine, vb) = active_vb();
    vb.set(item("k", "v").with_exptime(1), 0);

    // A read-only site opts out and mutates nothing.
    assert_eq!(vb.get(&key("k"), QueueExpired::No).status, Status::KeyNotFound);
    assert_eq!(vb.op_counters().num_expired, 0);

    assert_eq!(vb.get(&key("k"), QueueExpired::Yes).status, Status::KeyNotFound);
    assert_eq!(vb.op_counters().num_expired, 1);
}

#[test]
fn get_and_update_ttl_persists_the_new_deadline() {
    let (_engine, vb) = active_vb();
    vb.set(item("k", "v"), 0);
    let far = riptide::hlc::now_secs() + 1000;
    let got = vb.get_and_update_ttl(&key("k"), far);
    assert_eq!(got.status, Status::Success);
    let meta = vb.get_meta_data(&key("k")).1.unwrap();
    assert_eq!(meta.exptime, far);
    assert_eq!(vb.high_seqno(), 2, "ttl update queues a mutation");
}

#[test]
fn get_key_stats_reports_residency_and_state() {
    let (_engine, vb) = active_vb();
    vb.set(item("k", "v").with_flags(7), 0);
    let (status, stats) = vb.get_key_stats(&key("k"));
    assert_eq!(status, Status::Success);
    let stats = stats.unwrap();
    assert!(!stats.deleted);
    assert!(stats.resident);
    assert_eq!(stats.flags, 7);
    assert_eq!(stats.state, VBucketState::Active);
    assert!(!stats.logically_deleted);
}

#[test]
fn backfill_items_flow_into_replica_checkpoints() {
    let (_engine, vb) = active_vb();
    vb.set_state(VBucketState::Replica);
    for (seqno, name) in [(3u64, "a"), (5, "b"), (9, "c")] {
        let mut incoming = item(name, "replicated");
        incoming.by_seqno = seqno;
        incoming.cas = 1000 + seqno;
        incoming.rev_seqno = 1;
        assert_eq!(vb.add_backfill_item(incoming).status, Status::Success);
    }
    assert_eq!(vb.high_seqno(), 9);
    let drained = vb.drain_for_persistence(100);
    let seqnos: Vec<u64> = drained.iter().map(|i| i.by_seqno).collect();
    assert_eq!(seqnos, vec![3, 5, 9], "log order matches arrival order");
}

#[test]
fn memory_pressure_rejects_front_end_writes_first() {
    let mut config = EngineConfig::small();
    config.mem_quota = 64 * 1024;
    let (_engine, vb) = engine_with(config);
    let big = "x".repeat(1024);
    let mut rejected = false;
    for i in 0..200 {
        let out = vb.set(item(&format!("k{i}"), &big), 0);
        if out.status == Status::NoMem {
            rejected = true;
            break;
        }
    }
    assert!(rejected, "quota must eventually reject writes");
    assert!(vb.op_counters().ops_reject > 0);
}

#[test]
fn fire_all_ops_drains_pending_keys() {
    let mut config = EngineConfig::small();
    config.eviction_policy = riptide::EvictionPolicy::FullEviction;
    let (_engine, vb) = engine_with(config);
    // A miss that the bloom filter can't rule out parks the op.
    vb.set(item("seed", "v"), 0);
    vb.note_evicted_key(&key("ghost"));
    assert_eq!(vb.get(&key("ghost"), QueueExpired::Yes).status, Status::WouldBlock);
    let fired = vb.fire_all_ops();
    assert_eq!(fired.len(), 1);
    assert!(vb.fire_all_ops().is_empty());
}

#[test]
fn bg_fetch_resolves_temp_slots() {
    let mut config = EngineConfig::small();
    config.eviction_policy = riptide::EvictionPolicy::FullEviction;
    let (_engine, vb) = engine_with(config);
    vb.note_evicted_key(&key("disk-only"));
    vb.note_evicted_key(&key("nothing"));
    vb.note_evicted_key(&key("tombstoned"));

    assert_eq!(
        vb.get(&key("disk-only"), QueueExpired::Yes).status,
        Status::WouldBlock
    );
    let mut on_disk = item("disk-only", "from-disk");
    on_disk.cas = 77;
    on_disk.rev_seqno = 3;
    on_disk.by_seqno = 12;
    vb.complete_bg_fetch(&key("disk-only"), riptide::BgFetchResult::Found(on_disk));
    let got = vb.get(&key("disk-only"), QueueExpired::Yes);
    assert_eq!(got.status, Status::Success);
    assert_eq!(got.item.unwrap().cas, 77);

    assert_eq!(
        vb.get(&key("nothing"), QueueExpired::Yes).status,
        Status::WouldBlock
    );
    vb.complete_bg_fetch(&key("nothing"), riptide::BgFetchResult::NotFound);
    assert_eq!(
        vb.get(&key("nothing"), QueueExpired::Yes).status,
        Status::KeyNotFound,
        "negative probe is cached in a temp slot"
    );

    // A probe that finds a tombstone on disk caches it as temp-deleted.
    assert_eq!(
        vb.get(&key("tombstoned"), QueueExpired::Yes).status,
        Status::WouldBlock
    );
    let mut grave = item("tombstoned", "").into_deleted();
    grave.cas = 88;
    grave.rev_seqno = 4;
    vb.complete_bg_fetch(&key("tombstoned"), riptide::BgFetchResult::Found(grave));
    assert_eq!(
        vb.get(&key("tombstoned"), QueueExpired::Yes).status,
        Status::KeyNotFound,
        "a cached tombstone answers without another probe"
    );
    assert_eq!(
        vb.get(&key("tombstoned"), QueueExpired::Yes).status,
        Status::KeyNotFound
    );
    let (status, meta) = vb.get_meta_data(&key("tombstoned"));
    assert_eq!(status, Status::Success);
    let meta = meta.unwrap();
    assert!(meta.deleted);
    assert_eq!(meta.cas, 88);
    assert_eq!(
        vb.ht.num_temp_items(),
        2,
        "repeated reads must not duplicate the temp-deleted slot"
    );
}
