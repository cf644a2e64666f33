#![allow(missing_docs)]

//! Control-surface commands over a live engine, plus the persisted
//! state record handoff.

use std::fs;
use std::sync::Arc;

use riptide::vbucket::VbucketStateRecord;
use riptide::{admin, DocKey, Engine, EngineConfig, Item, Status, VBucketState, Vbid};

fn engine() -> Arc<Engine> {
    let engine = Engine::new(EngineConfig::small()).expect("engine");
    for vbid in 0..2 {
        engine
            .set_vbucket_state(Vbid(vbid), VBucketState::Active)
            .expect("state");
    }
    for n in 0..50 {
        let out = engine.set(
            Vbid(n % 2),
            Item::new(DocKey::in_default(format!("key-{n}")), format!("value-{n}")),
            0,
        );
        assert_eq!(out.status, Status::Success);
    }
    engine
}

#[test]
fn memory_section_tracks_usage() {
    let engine = engine();
    let out = admin::execute(&engine, &["memory"]).unwrap();
    let used: usize = out.get("mem_used").unwrap().parse().unwrap();
    assert!(used > 0);
    let quota: usize = out.get("ep_max_size").unwrap().parse().unwrap();
    assert_eq!(quota, engine.config().mem_quota);
}

#[test]
fn vbucket_details_renders_every_vbucket() {
    let engine = engine();
    let out = admin::execute(&engine, &["vbucket-details"]).unwrap();
    assert_eq!(out.get("vb_0:state").map(String::as_str), Some("active"));
    assert_eq!(out.get("vb_1:state").map(String::as_str), Some("active"));
    assert!(out.contains_key("vb_0:max_cas"));
    assert!(out.contains_key("vb_1:uuid"));
}

#[test]
fn vbucket_seqno_reflects_writes_and_persistence() {
    let engine = engine();
    let vb = engine.vbucket(Vbid(0)).unwrap();
    while !vb.drain_for_persistence(100).is_empty() {}
    let out = admin::execute(&engine, &["vbucket-seqno", "0"]).unwrap();
    let high: u64 = out.get("vb_0:high_seqno").unwrap().parse().unwrap();
    let persisted: u64 = out.get("vb_0:persistence_seqno").unwrap().parse().unwrap();
    assert_eq!(high, 25);
    assert_eq!(persisted, high);
}

#[test]
fn durability_monitor_command_shows_chain_positions() {
    let engine = engine();
    let vb = engine.vbucket(Vbid(0)).unwrap();
    vb.set_replication_topology(&["active", "r1"]).unwrap();
    let out = admin::execute(&engine, &["durability-monitor", "0"]).unwrap();
    assert_eq!(out.get("vb_0:num_tracked").map(String::as_str), Some("0"));
    assert!(out.contains_key("vb_0:replication:active:memory_write_seqno"));
    assert!(out.contains_key("vb_0:replication:r1:disk_ack_seqno"));
}

#[test]
fn checkpoint_command_reports_the_open_checkpoint() {
    let engine = engine();
    let out = admin::execute(&engine, &["checkpoint", "0"]).unwrap();
    let open_id: u64 = out
        .get("vb_0:open_checkpoint_id")
        .unwrap()
        .parse()
        .unwrap();
    assert!(open_id >= 1);
    let items: u64 = out
        .get("vb_0:num_open_checkpoint_items")
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(items, 25);
}

#[test]
fn errors_for_unknown_commands_and_external_surfaces() {
    let engine = engine();
    assert!(admin::execute(&engine, &["nonsense"]).is_err());
    assert!(admin::execute(&engine, &["dcp"]).is_err());
    assert!(admin::execute(&engine, &["checkpoint", "notanumber"]).is_err());
}

#[test]
fn stats_render_as_json() {
    let engine = engine();
    let out = admin::execute(&engine, &["memory"]).unwrap();
    let json = serde_json::to_string_pretty(&out).unwrap();
    let back: std::collections::BTreeMap<String, String> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, out);
}

#[test]
fn state_record_survives_a_file_round_trip() {
    let engine = engine();
    let vb = engine.vbucket(Vbid(0)).unwrap();
    let record = vb.snapshot_state().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vb_0.state.json");
    fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

    let loaded: VbucketStateRecord =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(loaded.state, VBucketState::Active);
    assert_eq!(loaded.high_seqno, record.high_seqno);
    assert_eq!(loaded.max_cas, record.max_cas);
    assert_eq!(loaded.failover_log, record.failover_log);
    assert_eq!(loaded.collections_blob, record.collections_blob);
}

#[test]
fn tasks_command_reports_scheduled_entries() {
    let engine = engine();
    let out = admin::execute(&engine, &["tasks"]).unwrap();
    assert!(out.contains_key("tasks"), "pool not started yet");

    engine.start_background_tasks();
    // A task mid-run is briefly absent from the queue; poll until all
    // three settle.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let out = admin::execute(&engine, &["tasks"]).unwrap();
        let names: Vec<String> = out
            .iter()
            .filter(|(k, _)| k.ends_with(":name"))
            .map(|(_, v)| v.clone())
            .collect();
        let all_present = ["item_pager", "expiry_pager", "durability_timeout"]
            .iter()
            .all(|want| names.iter().any(|n| n == want));
        if all_present {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "background tasks never settled: {names:?}"
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    engine.shutdown();
}
