//! Workload driver and control-surface front end for a local engine.
//!
//! Spins up an in-process engine, applies a synthetic workload, drains
//! the persistence cursors, then executes a control-surface command and
//! prints the result as text or JSON.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use riptide::{admin, DocKey, Engine, EngineConfig, EvictionPolicy, Item, VBucketState, Vbid};

#[derive(Parser, Debug)]
#[command(name = "enginectl", about = "Run a workload and query engine stats")]
struct Args {
    /// Number of vbuckets to create.
    #[arg(long, default_value_t = 4)]
    vbuckets: u16,

    /// Number of write operations to apply.
    #[arg(long, default_value_t = 10_000)]
    ops: u64,

    /// Use full eviction instead of value eviction.
    #[arg(long)]
    full_eviction: bool,

    /// Control-surface command to execute after the workload.
    #[arg(long, default_value = "all")]
    command: String,

    /// Render the output as JSON instead of key: value lines.
    #[arg(long)]
    json: bool,
}

fn main() -> riptide::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut config = EngineConfig::small();
    config.max_vbuckets = args.vbuckets.max(1);
    if args.full_eviction {
        config.eviction_policy = EvictionPolicy::FullEviction;
    }
    let engine = Engine::new(config)?;
    for vbid in 0..args.vbuckets.max(1) {
        engine.set_vbucket_state(Vbid(vbid), VBucketState::Active)?;
    }

    let num_vbuckets = u64::from(args.vbuckets.max(1));
    for i in 0..args.ops {
        let vbid = Vbid((i % num_vbuckets) as u16);
        let key = DocKey::in_default(format!("key-{i}"));
        engine.set(vbid, Item::new(key.clone(), format!("value-{i}")), 0);
        if i % 3 == 0 {
            engine.get(vbid, &key);
        }
    }
    for vb in engine.all_vbuckets() {
        while !vb.drain_for_persistence(4096).is_empty() {}
        vb.notify_local_persistence();
    }

    let argv: Vec<&str> = args.command.split_whitespace().collect();
    let stats = admin::execute(&engine, &argv)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        for (key, value) in &stats {
            println!("{key}: {value}");
        }
    }
    Ok(())
}
