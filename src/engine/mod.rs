//! Engine facade: the fixed vector of vbuckets, shared memory
//! accounting, and the background task wiring.

pub mod memory;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, Status};
use crate::eviction::{ExpiryPager, ItemPager, PassSummary};
use crate::tasks::{BackgroundTask, TaskControl, TaskRunner};
use crate::types::{Cas, DocKey, Item, VBucketState, Vbid};
use crate::vbucket::{GetValue, MutationOutcome, QueueExpired, VBucket};

use memory::MemoryTracker;

/// The storage engine core: owns every vbucket and the process-wide
/// pagers.
pub struct Engine {
    config: EngineConfig,
    memory: Arc<MemoryTracker>,
    vbuckets: Vec<RwLock<Option<Arc<VBucket>>>>,
    item_pager: Arc<ItemPager>,
    expiry_pager: Arc<ExpiryPager>,
    runner: Mutex<Option<TaskRunner>>,
    /// Deleted vbuckets parked until their last in-flight handle drops;
    /// reaped by a background sweep, never on a front-end thread.
    graveyard: Mutex<Vec<Arc<VBucket>>>,
    start: Instant,
}

impl Engine {
    /// Validates the configuration and builds an engine with every
    /// vbucket slot empty.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let memory = Arc::new(MemoryTracker::new(
            config.mem_quota,
            config.mem_high_wat_ratio,
            config.mem_low_wat_ratio,
            config.mutation_mem_ratio,
        ));
        let vbuckets = (0..config.max_vbuckets)
            .map(|_| RwLock::new(None))
            .collect();
        let item_pager = Arc::new(ItemPager::new(&config));
        let engine = Arc::new(Self {
            config,
            memory,
            vbuckets,
            item_pager,
            expiry_pager: Arc::new(ExpiryPager::new()),
            runner: Mutex::new(None),
            graveyard: Mutex::new(Vec::new()),
            start: Instant::now(),
        });

        // Crossing the high watermark schedules an immediate pager pass.
        let weak = Arc::downgrade(&engine);
        engine.memory.set_wake_hook(Box::new(move || {
            if let Some(engine) = weak.upgrade() {
                engine.wake_item_pager();
            }
        }));
        Ok(engine)
    }

    /// Spawns the NonIO pool and schedules the pagers and the
    /// durability timeout scan.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let mut guard = self.runner.lock();
        if guard.is_some() {
            return;
        }
        let runner = TaskRunner::new("nonio", self.config.nonio_threads);
        runner.schedule(
            Arc::new(ItemPagerTask {
                engine: Arc::downgrade(self),
                period: Duration::from_millis(self.config.pager_sleep_ms),
            }),
            Duration::from_millis(self.config.pager_sleep_ms),
        );
        runner.schedule(
            Arc::new(ExpiryPagerTask {
                engine: Arc::downgrade(self),
                period: Duration::from_millis(self.config.expiry_pager_sleep_ms),
            }),
            Duration::from_millis(self.config.expiry_pager_sleep_ms),
        );
        runner.schedule(
            Arc::new(DurabilityTimeoutTask {
                engine: Arc::downgrade(self),
                period: Duration::from_millis(self.config.durability_timeout_scan_ms),
            }),
            Duration::from_millis(self.config.durability_timeout_scan_ms),
        );
        *guard = Some(runner);
        info!(threads = self.config.nonio_threads, "background tasks started");
    }

    /// Stops and joins the background pool.
    pub fn shutdown(&self) {
        self.runner.lock().take();
        debug!("engine background tasks shut down");
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared memory tracker.
    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    /// Seconds since engine construction.
    pub fn uptime(&self) -> Duration {
        self.start.elapsed()
    }

    /// I/O shard servicing `vbid`.
    pub fn shard_id(&self, vbid: Vbid) -> usize {
        usize::from(vbid.0) % self.config.num_shards
    }

    fn slot(&self, vbid: Vbid) -> Result<&RwLock<Option<Arc<VBucket>>>> {
        self.vbuckets.get(usize::from(vbid.0)).ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "{vbid} outside the configured {} vbuckets",
                self.config.max_vbuckets
            ))
        })
    }

    /// Handle to a vbucket, if materialized.
    pub fn vbucket(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
        self.vbuckets
            .get(usize::from(vbid.0))
            .and_then(|slot| slot.read().clone())
    }

    /// Creates the vbucket on first use and transitions its state.
    pub fn set_vbucket_state(&self, vbid: Vbid, state: VBucketState) -> Result<()> {
        let slot = self.slot(vbid)?;
        let existing = slot.read().clone();
        match existing {
            Some(vb) => {
                vb.set_state(state);
            }
            None => {
                let vb = Arc::new(VBucket::new(vbid, state, &self.config, self.memory.clone()));
                *slot.write() = Some(vb);
                debug!(%vbid, %state, shard = self.shard_id(vbid), "vbucket created");
            }
        }
        Ok(())
    }

    /// Detaches a vbucket; its memory is reclaimed by the background
    /// sweep once the last in-flight handle drops.
    pub fn delete_vbucket(&self, vbid: Vbid) -> Result<()> {
        let slot = self.slot(vbid)?;
        let taken = slot.write().take();
        match taken {
            Some(vb) => {
                vb.set_state(VBucketState::Dead);
                self.graveyard.lock().push(vb);
                Ok(())
            }
            None => Err(EngineError::NotFound("vbucket")),
        }
    }

    /// Drops parked vbuckets whose last external handle is gone.
    /// Returns how many were reclaimed.
    pub fn reap_dead_vbuckets(&self) -> usize {
        let mut graveyard = self.graveyard.lock();
        let before = graveyard.len();
        graveyard.retain(|vb| Arc::strong_count(vb) > 1);
        before - graveyard.len()
    }

    /// Snapshot of every materialized vbucket, in id order.
    pub fn all_vbuckets(&self) -> Vec<Arc<VBucket>> {
        self.vbuckets
            .iter()
            .filter_map(|slot| slot.read().clone())
            .collect()
    }

    /// Number of materialized vbuckets.
    pub fn num_vbuckets(&self) -> usize {
        self.vbuckets
            .iter()
            .filter(|slot| slot.read().is_some())
            .count()
    }

    // ---- pager entry points ---------------------------------------------

    /// Asks the scheduler to run the item pager as soon as possible.
    pub fn wake_item_pager(&self) {
        if let Some(runner) = self.runner.lock().as_ref() {
            runner.wake_by_name(ITEM_PAGER_TASK);
        }
    }

    /// Runs one synchronous item pager pass (admin and tests).
    pub fn run_pager_pass(&self) -> PassSummary {
        let vbuckets = self.all_vbuckets();
        let summary = self.item_pager.pass(&vbuckets, &self.memory);
        self.reap_dead_vbuckets();
        summary
    }

    /// Runs one synchronous expiry pager pass.
    pub fn run_expiry_pass(&self) -> u64 {
        let vbuckets = self.all_vbuckets();
        self.expiry_pager.pass(&vbuckets)
    }

    /// Item pager handle (stats).
    pub fn item_pager(&self) -> &ItemPager {
        &self.item_pager
    }

    /// Expiry pager handle (stats).
    pub fn expiry_pager(&self) -> &ExpiryPager {
        &self.expiry_pager
    }

    /// Scheduled background entries for the `tasks` command.
    pub fn scheduled_tasks(&self) -> Vec<(String, Duration)> {
        self.runner
            .lock()
            .as_ref()
            .map(|r| r.scheduled_tasks())
            .unwrap_or_default()
    }

    // ---- front-door operations ------------------------------------------

    /// Store into a vbucket.
    pub fn set(&self, vbid: Vbid, item: Item, cas: Cas) -> MutationOutcome {
        match self.vbucket(vbid) {
            Some(vb) => vb.set(item, cas),
            None => not_my_vbucket(),
        }
    }

    /// Read from a vbucket.
    pub fn get(&self, vbid: Vbid, key: &DocKey) -> GetValue {
        match self.vbucket(vbid) {
            Some(vb) => vb.get(key, QueueExpired::Yes),
            None => GetValue {
                status: Status::Ranged,
                item: None,
            },
        }
    }

    /// Delete from a vbucket.
    pub fn delete(&self, vbid: Vbid, key: &DocKey, cas: Cas) -> MutationOutcome {
        match self.vbucket(vbid) {
            Some(vb) => vb.delete_item(key, cas),
            None => not_my_vbucket(),
        }
    }
}

fn not_my_vbucket() -> MutationOutcome {
    MutationOutcome {
        status: Status::Ranged,
        cas: 0,
        seqno: 0,
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const ITEM_PAGER_TASK: &str = "item_pager";

struct ItemPagerTask {
    engine: std::sync::Weak<Engine>,
    period: Duration,
}

impl BackgroundTask for ItemPagerTask {
    fn name(&self) -> &'static str {
        ITEM_PAGER_TASK
    }

    fn run(&self) -> TaskControl {
        match self.engine.upgrade() {
            Some(engine) => {
                let summary = engine.run_pager_pass();
                if summary.started && !summary.reached_low_wat && engine.memory().above_high_wat()
                {
                    warn!(
                        used = engine.memory().used(),
                        high_wat = engine.memory().high_wat(),
                        "pager pass left memory above the high watermark"
                    );
                }
                TaskControl::Snooze(self.period)
            }
            None => TaskControl::Stop,
        }
    }
}

struct ExpiryPagerTask {
    engine: std::sync::Weak<Engine>,
    period: Duration,
}

impl BackgroundTask for ExpiryPagerTask {
    fn name(&self) -> &'static str {
        "expiry_pager"
    }

    fn run(&self) -> TaskControl {
        match self.engine.upgrade() {
            Some(engine) => {
                engine.run_expiry_pass();
                TaskControl::Snooze(self.period)
            }
            None => TaskControl::Stop,
        }
    }
}

struct DurabilityTimeoutTask {
    engine: std::sync::Weak<Engine>,
    period: Duration,
}

impl BackgroundTask for DurabilityTimeoutTask {
    fn name(&self) -> &'static str {
        "durability_timeout"
    }

    fn run(&self) -> TaskControl {
        match self.engine.upgrade() {
            Some(engine) => {
                let now = Instant::now();
                for vb in engine.all_vbuckets() {
                    let aborted = vb.process_durability_timeout(now);
                    if !aborted.is_empty() {
                        warn!(
                            vbid = %vb.id,
                            count = aborted.len(),
                            "sync writes timed out"
                        );
                    }
                }
                TaskControl::Snooze(self.period)
            }
            None => TaskControl::Stop,
        }
    }
}
