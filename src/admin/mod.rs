//! Control-surface command processor.
//!
//! Textual commands (read from a control socket by an external front
//! end) map to string→string stat groups that the caller renders as text
//! or JSON. Unknown commands and malformed vbucket ids are invalid
//! arguments.

use std::collections::BTreeMap;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::eviction::freq::freq_to_nru;
use crate::types::Vbid;
use crate::vbucket::VBucket;

/// Output of one command: ordered key → value pairs.
pub type StatMap = BTreeMap<String, String>;

/// Executes one control-surface command against the engine.
pub fn execute(engine: &Engine, argv: &[&str]) -> Result<StatMap> {
    let (command, args) = argv
        .split_first()
        .ok_or_else(|| EngineError::InvalidArgument("empty command".into()))?;
    match *command {
        "all" => all_stats(engine),
        "memory" => Ok(memory_stats(engine)),
        "hash" => Ok(hash_stats(engine, args.first() == Some(&"detail"))),
        "checkpoint" => per_vbucket(engine, args, checkpoint_stats),
        "vbucket-details" => per_vbucket(engine, args, vbucket_details),
        "durability-monitor" => per_vbucket(engine, args, durability_stats),
        "vbucket-seqno" => per_vbucket(engine, args, vbucket_seqno),
        "tasks" => Ok(task_stats(engine)),
        "timings" => Ok(timing_stats(engine)),
        "reset" => Ok(reset(engine)),
        "dcp" => Err(EngineError::InvalidArgument(
            "dcp stats are served by the replication front end".into(),
        )),
        other => Err(EngineError::InvalidArgument(format!(
            "unknown command {other}"
        ))),
    }
}

fn parse_vbid(engine: &Engine, arg: &str) -> Result<Vbid> {
    let raw: u16 = arg
        .parse()
        .map_err(|_| EngineError::InvalidArgument(format!("bad vbucket id {arg}")))?;
    if usize::from(raw) >= usize::from(engine.config().max_vbuckets) {
        return Err(EngineError::InvalidArgument(format!(
            "vbucket id {raw} out of range"
        )));
    }
    Ok(Vbid(raw))
}

fn per_vbucket(
    engine: &Engine,
    args: &[&str],
    render: fn(&VBucket, &mut StatMap),
) -> Result<StatMap> {
    let mut out = StatMap::new();
    match args.first() {
        Some(arg) => {
            let vbid = parse_vbid(engine, arg)?;
            let vb = engine
                .vbucket(vbid)
                .ok_or(EngineError::NotFound("vbucket"))?;
            render(&vb, &mut out);
        }
        None => {
            for vb in engine.all_vbuckets() {
                render(&vb, &mut out);
            }
        }
    }
    Ok(out)
}

fn all_stats(engine: &Engine) -> Result<StatMap> {
    let mut out = memory_stats(engine);
    out.extend(hash_stats(engine, false));
    out.extend(timing_stats(engine));
    for vb in engine.all_vbuckets() {
        vbucket_details(&vb, &mut out);
        checkpoint_stats(&vb, &mut out);
    }
    out.insert(
        "ep_uptime_secs".into(),
        engine.uptime().as_secs().to_string(),
    );
    out.insert(
        "ep_num_vbuckets".into(),
        engine.num_vbuckets().to_string(),
    );
    Ok(out)
}

fn memory_stats(engine: &Engine) -> StatMap {
    let memory = engine.memory();
    let pager = engine.item_pager().stats();
    let mut out = StatMap::new();
    out.insert("mem_used".into(), memory.used().to_string());
    out.insert("ep_max_size".into(), memory.quota().to_string());
    out.insert("ep_mem_high_wat".into(), memory.high_wat().to_string());
    out.insert("ep_mem_low_wat".into(), memory.low_wat().to_string());
    out.insert(
        "ep_oom_errors".into(),
        memory.num_rejections().to_string(),
    );
    out.insert("ep_num_pager_runs".into(), pager.passes.to_string());
    out.insert(
        "ep_num_value_ejects".into(),
        pager.items_evicted.to_string(),
    );
    out.insert(
        "ep_expired_pager".into(),
        pager.items_expired.to_string(),
    );
    out.insert(
        "ep_pager_eviction_multiplier".into(),
        format!("{:.2}", pager.eviction_multiplier),
    );
    out
}

fn hash_stats(engine: &Engine, detail: bool) -> StatMap {
    let mut out = StatMap::new();
    let mut items = 0usize;
    let mut non_resident = 0usize;
    let mut deleted = 0usize;
    let mut temp = 0usize;
    let mut mem = 0usize;
    let mut ejects = 0u64;
    for vb in engine.all_vbuckets() {
        items += vb.ht.num_items();
        non_resident += vb.ht.num_non_resident();
        deleted += vb.ht.num_deleted_items();
        temp += vb.ht.num_temp_items();
        mem += vb.ht.mem_used();
        ejects += vb.ht.num_ejects();
        if detail {
            let prefix = format!("{}:hash", vb.id);
            out.insert(format!("{prefix}:num_buckets"), vb.ht.num_buckets().to_string());
            out.insert(format!("{prefix}:num_locks"), vb.ht.num_locks().to_string());
            out.insert(format!("{prefix}:num_items"), vb.ht.num_items().to_string());
            out.insert(
                format!("{prefix}:resident_ratio"),
                format!("{:.4}", vb.ht.resident_ratio()),
            );
            out.insert(
                format!("{prefix}:max_deleted_revid"),
                vb.ht.max_deleted_rev_seqno().to_string(),
            );
            // NRU occupancy derived from the frequency counters.
            let mut nru_counts = [0u64; 4];
            struct NruVisitor<'a> {
                counts: &'a mut [u64; 4],
            }
            impl crate::hash_table::HashTableVisitor for NruVisitor<'_> {
                fn visit(
                    &mut self,
                    sv: &mut crate::hash_table::StoredValue,
                ) -> crate::hash_table::VisitDecision {
                    self.counts[usize::from(freq_to_nru(sv.freq_counter()))] += 1;
                    crate::hash_table::VisitDecision::Keep
                }
            }
            vb.ht.visit(&mut NruVisitor {
                counts: &mut nru_counts,
            });
            for (level, count) in nru_counts.iter().enumerate() {
                out.insert(format!("{prefix}:nru_{level}"), count.to_string());
            }
        }
    }
    out.insert("ep_ht_num_items".into(), items.to_string());
    out.insert("ep_ht_non_resident".into(), non_resident.to_string());
    out.insert("ep_ht_deleted_items".into(), deleted.to_string());
    out.insert("ep_ht_temp_items".into(), temp.to_string());
    out.insert("ep_ht_mem_used".into(), mem.to_string());
    out.insert("ep_ht_num_ejects".into(), ejects.to_string());
    out
}

fn checkpoint_stats(vb: &VBucket, out: &mut StatMap) {
    let stats = vb.checkpoint_stats();
    let prefix = vb.id.to_string();
    out.insert(
        format!("{prefix}:open_checkpoint_id"),
        stats.open_checkpoint_id.to_string(),
    );
    out.insert(
        format!("{prefix}:num_checkpoints"),
        stats.num_checkpoints.to_string(),
    );
    out.insert(
        format!("{prefix}:num_open_checkpoint_items"),
        stats.num_open_checkpoint_items.to_string(),
    );
    out.insert(
        format!("{prefix}:checkpoint_mem_bytes"),
        stats.mem_bytes.to_string(),
    );
    out.insert(
        format!("{prefix}:num_items_deduped"),
        stats.num_items_deduped.to_string(),
    );
    out.insert(
        format!("{prefix}:num_checkpoints_removed"),
        stats.num_checkpoints_removed.to_string(),
    );
}

fn vbucket_details(vb: &VBucket, out: &mut StatMap) {
    let prefix = vb.id.to_string();
    let ops = vb.op_counters();
    let hlc = vb.hlc.stats();
    out.insert(format!("{prefix}:state"), vb.state().to_string());
    out.insert(format!("{prefix}:num_items"), vb.ht.num_items().to_string());
    out.insert(
        format!("{prefix}:num_non_resident"),
        vb.ht.num_non_resident().to_string(),
    );
    out.insert(
        format!("{prefix}:num_temp_items"),
        vb.ht.num_temp_items().to_string(),
    );
    out.insert(
        format!("{prefix}:queue_size"),
        vb.disk_queue_size().to_string(),
    );
    out.insert(format!("{prefix}:ops_create"), ops.ops_create.to_string());
    out.insert(format!("{prefix}:ops_update"), ops.ops_update.to_string());
    out.insert(format!("{prefix}:ops_delete"), ops.ops_delete.to_string());
    out.insert(format!("{prefix}:ops_reject"), ops.ops_reject.to_string());
    out.insert(
        format!("{prefix}:num_expired"),
        ops.num_expired.to_string(),
    );
    out.insert(format!("{prefix}:max_cas"), hlc.max_cas.to_string());
    out.insert(
        format!("{prefix}:hlc_drift_ahead_exceptions"),
        hlc.ahead_exceptions.to_string(),
    );
    out.insert(
        format!("{prefix}:hlc_drift_behind_exceptions"),
        hlc.behind_exceptions.to_string(),
    );
    out.insert(
        format!("{prefix}:uuid"),
        vb.with_failover_table(|t| t.latest_uuid()).to_string(),
    );
    vb.with_manifest(|m| {
        out.insert(
            format!("{prefix}:collections_manifest_uid"),
            m.uid().to_string(),
        );
        out.insert(
            format!("{prefix}:collections_deleting"),
            m.n_deleting().to_string(),
        );
    });
}

fn durability_stats(vb: &VBucket, out: &mut StatMap) {
    let stats = vb.durability_stats();
    let prefix = vb.id.to_string();
    out.insert(
        format!("{prefix}:num_tracked"),
        stats.num_tracked.to_string(),
    );
    out.insert(
        format!("{prefix}:num_accepted"),
        stats.num_accepted.to_string(),
    );
    out.insert(
        format!("{prefix}:num_committed"),
        stats.num_committed.to_string(),
    );
    out.insert(
        format!("{prefix}:num_aborted"),
        stats.num_aborted.to_string(),
    );
    for node in &stats.nodes {
        let node_prefix = format!("{prefix}:replication:{}", node.name);
        out.insert(
            format!("{node_prefix}:memory_write_seqno"),
            node.memory_write_seqno.to_string(),
        );
        out.insert(
            format!("{node_prefix}:memory_ack_seqno"),
            node.memory_ack_seqno.to_string(),
        );
        out.insert(
            format!("{node_prefix}:disk_write_seqno"),
            node.disk_write_seqno.to_string(),
        );
        out.insert(
            format!("{node_prefix}:disk_ack_seqno"),
            node.disk_ack_seqno.to_string(),
        );
    }
}

fn vbucket_seqno(vb: &VBucket, out: &mut StatMap) {
    let prefix = vb.id.to_string();
    out.insert(format!("{prefix}:high_seqno"), vb.high_seqno().to_string());
    out.insert(
        format!("{prefix}:persistence_seqno"),
        vb.persistence_seqno().to_string(),
    );
    out.insert(format!("{prefix}:purge_seqno"), vb.purge_seqno().to_string());
    out.insert(
        format!("{prefix}:uuid"),
        vb.with_failover_table(|t| t.latest_uuid()).to_string(),
    );
}

fn task_stats(engine: &Engine) -> StatMap {
    let mut out = StatMap::new();
    for (i, (name, until)) in engine.scheduled_tasks().into_iter().enumerate() {
        out.insert(format!("task_{i}:name"), name);
        out.insert(
            format!("task_{i}:next_run_ms"),
            until.as_millis().to_string(),
        );
    }
    if out.is_empty() {
        out.insert("tasks".into(), "background pool not running".into(),);
    }
    out
}

fn timing_stats(engine: &Engine) -> StatMap {
    let mut out = StatMap::new();
    let mut create = 0u64;
    let mut update = 0u64;
    let mut delete = 0u64;
    let mut get = 0u64;
    let mut bg = 0u64;
    let mut conflict = 0u64;
    for vb in engine.all_vbuckets() {
        let ops = vb.op_counters();
        create += ops.ops_create;
        update += ops.ops_update;
        delete += ops.ops_delete;
        get += ops.ops_get;
        bg += ops.bg_fetches;
        conflict += ops.conflict_resolution_losses;
    }
    out.insert("cmd_store_create".into(), create.to_string());
    out.insert("cmd_store_update".into(), update.to_string());
    out.insert("cmd_delete".into(), delete.to_string());
    out.insert("cmd_get".into(), get.to_string());
    out.insert("bg_fetches".into(), bg.to_string());
    out.insert("conflict_resolution_losses".into(), conflict.to_string());
    out
}

fn reset(engine: &Engine) -> StatMap {
    for vb in engine.all_vbuckets() {
        vb.reset_op_counters();
    }
    let mut out = StatMap::new();
    out.insert("reset".into(), "done".into());
    out
}
