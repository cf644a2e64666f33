#![allow(missing_docs)]

//! Collection lifecycle: manifest updates, event sequencing, and the
//! logical-deletion gate.

use std::sync::Arc;

use riptide::checkpoint::QueueOp;
use riptide::collections::{Manifest, ManifestCollection, VbucketManifest};
use riptide::{
    CollectionId, DocKey, Engine, EngineConfig, Item, ManifestUid, Status, VBucket,
    VBucketState, Vbid,
};

fn active_vb() -> (Arc<Engine>, Arc<VBucket>) {
    let engine = Engine::new(EngineConfig::small()).expect("engine");
    engine
        .set_vbucket_state(Vbid(0), VBucketState::Active)
        .expect("state");
    let vb = engine.vbucket(Vbid(0)).expect("vbucket");
    (engine, vb)
}

fn declaration(uid: u64, cids: &[u32]) -> Manifest {
    let mut collections = vec![ManifestCollection {
        name: "_default".to_owned(),
        uid: CollectionId::DEFAULT,
    }];
    collections.extend(cids.iter().map(|&c| ManifestCollection {
        name: format!("c{c}"),
        uid: CollectionId(c),
    }));
    Manifest {
        uid: ManifestUid(uid),
        collections,
    }
}

#[test]
fn logical_deletion_gate_follows_the_collection_lifecycle() {
    let (_engine, vb) = active_vb();
    let beers = CollectionId(8);

    assert!(vb.update_collections(&declaration(1, &[8])).unwrap());
    let begin_seqno = vb.high_seqno();

    // Writes into the open collection.
    let mut seqnos = Vec::new();
    for name in ["a", "b", "c"] {
        let out = vb.set(Item::new(DocKey::new(beers, name.to_owned()), "v"), 0);
        assert_eq!(out.status, Status::Success);
        seqnos.push(out.seqno);
    }
    assert!(seqnos.iter().all(|&s| s > begin_seqno));

    // Begin deleting: every key of the collection is logically dead.
    assert!(vb.update_collections(&declaration(2, &[])).unwrap());
    let key = DocKey::new(beers, "a");
    assert!(vb.is_logically_deleted(&key, seqnos[0]));
    assert!(
        vb.is_logically_deleted(&key, vb.high_seqno() + 5),
        "items past the end event stay gated until the purge completes"
    );
    assert!(!vb.does_key_contain_valid_collection(&key));
    assert_eq!(
        vb.set(Item::new(key.clone(), "late"), 0).status,
        Status::KeyNotFound,
        "writes into a deleting collection are rejected"
    );

    vb.complete_collection_deletion(beers).unwrap();
    assert!(!vb.is_logically_deleted(&key, seqnos[0]));
    assert!(!vb.is_logically_deleted(&key, vb.high_seqno() + 5));
    vb.with_manifest(|m| {
        assert_eq!(m.n_deleting(), 0);
        assert_eq!(m.greatest_end_seqno(), riptide::collections::END_SEQNO_OPEN);
    });
    assert!(vb.purge_seqno() > 0);
}

#[test]
fn update_emits_deletions_before_additions_with_uid_on_final_events() {
    let (_engine, vb) = active_vb();
    assert!(vb.update_collections(&declaration(1, &[8, 9])).unwrap());
    // Drain the two begin events.
    let _ = vb.drain_for_persistence(100);

    // Drop 8 and 9, add 10 and 11 in one declaration.
    assert!(vb.update_collections(&declaration(2, &[10, 11])).unwrap());
    let events = vb.drain_for_persistence(100);
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e.op == QueueOp::SystemEvent));

    let decoded: Vec<(ManifestUid, CollectionId, u64)> = events
        .iter()
        .map(|e| {
            let blob = e.payload.as_ref().expect("system event payload");
            let (uid, _, changed) = VbucketManifest::decode_event_blob(blob).unwrap();
            (uid, changed.0, changed.1.end_seqno)
        })
        .collect();

    // Deletions first: the changed entries of the first two events are
    // closed (finite end seqno), the last two open.
    assert!(decoded[0].2 != riptide::collections::END_SEQNO_OPEN);
    assert!(decoded[1].2 != riptide::collections::END_SEQNO_OPEN);
    assert_eq!(decoded[2].2, riptide::collections::END_SEQNO_OPEN);
    assert_eq!(decoded[3].2, riptide::collections::END_SEQNO_OPEN);

    // The final event of each pass carries the new uid; earlier events
    // the old one.
    assert_eq!(decoded[0].0, ManifestUid(1));
    assert_eq!(decoded[1].0, ManifestUid(2));
    assert_eq!(decoded[2].0, ManifestUid(1));
    assert_eq!(decoded[3].0, ManifestUid(2));

    vb.with_manifest(|m| assert_eq!(m.uid(), ManifestUid(2)));
}

#[test]
fn addition_of_deleting_collection_fails_the_update() {
    let (_engine, vb) = active_vb();
    vb.update_collections(&declaration(1, &[8])).unwrap();
    vb.update_collections(&declaration(2, &[])).unwrap();
    // 8 is deleting; re-adding it must fail wholesale.
    assert!(vb.update_collections(&declaration(3, &[8])).is_err());
    vb.with_manifest(|m| assert_eq!(m.uid(), ManifestUid(2)));
}

#[test]
fn noop_update_bumps_only_the_uid() {
    let (_engine, vb) = active_vb();
    let before = vb.high_seqno();
    assert!(!vb.update_collections(&declaration(5, &[])).unwrap());
    assert_eq!(vb.high_seqno(), before, "no events queued");
    vb.with_manifest(|m| assert_eq!(m.uid(), ManifestUid(5)));
}

#[test]
fn manifest_json_round_trips_through_the_state_record() {
    let (_engine, vb) = active_vb();
    vb.update_collections(&declaration(1, &[8, 9])).unwrap();
    vb.update_collections(&declaration(2, &[8])).unwrap();

    let record = vb.snapshot_state().unwrap();
    let restored = VbucketManifest::from_json(&record.collections_blob).unwrap();
    vb.with_manifest(|m| {
        assert_eq!(restored.uid(), m.uid());
        assert_eq!(restored.n_deleting(), m.n_deleting());
        assert_eq!(restored.greatest_end_seqno(), m.greatest_end_seqno());
        assert_eq!(
            restored.entry(CollectionId(8)),
            m.entry(CollectionId(8))
        );
        assert_eq!(
            restored.entry(CollectionId(9)),
            m.entry(CollectionId(9))
        );
    });
}

#[test]
fn reopened_collection_gates_items_from_the_previous_generation() {
    let (_engine, vb) = active_vb();
    vb.update_collections(&declaration(1, &[8])).unwrap();
    let cid = CollectionId(8);
    let old = vb.set(Item::new(DocKey::new(cid, "k"), "gen1"), 0);
    vb.update_collections(&declaration(2, &[])).unwrap();
    vb.complete_collection_deletion(cid).unwrap();
    vb.update_collections(&declaration(3, &[8])).unwrap();

    let key = DocKey::new(cid, "k");
    assert!(
        vb.is_logically_deleted(&key, old.seqno),
        "generation-one seqno predates the new begin event"
    );
    assert!(!vb.is_logically_deleted(&key, vb.high_seqno() + 1));
    assert!(vb.does_key_contain_valid_collection(&key));
}

#[test]
fn system_events_use_the_collection_scoped_key() {
    let (_engine, vb) = active_vb();
    vb.update_collections(&declaration(1, &[8])).unwrap();
    let events = vb.drain_for_persistence(100);
    let event = events.last().unwrap();
    let key = event.key.as_ref().unwrap();
    assert_eq!(key.collection, CollectionId(8));
    assert_eq!(&key.name[..], b"_collection");
}
