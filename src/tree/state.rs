//! Shared mutable state for the LSM tree.
//!
//! The state is held behind an `Arc` so the background merge worker can
//! outlive any single operation. Coordination between writers and the
//! cascade uses a single atomic flag: writers that need the merge engine
//! spin-yield until it reads idle, and the cascade (inline or detached)
//! clears it when done. A separate merge mutex serialises cascades so at
//! most one is ever rewriting tier contents.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::Config;
use crate::error::Result;

use super::memory::MemoryLevel;
use super::tier::{self, Tier};
use super::BYTES_PER_RECORD;

/// Running min/max of every value ever inserted, used to short-circuit
/// reads that fall outside the dataset's range.
#[derive(Debug, Default)]
pub struct RangeSummary {
    pub min: i64,
    pub max: i64,
    pub set: bool,
}

impl RangeSummary {
    /// Widens the range to cover `value`.
    pub fn observe(&mut self, value: i64) {
        if !self.set {
            self.min = value;
            self.max = value;
            self.set = true;
            return;
        }
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// True when the range is initialised and `value` falls inside it.
    pub fn covers(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// All mutable engine state shared with the background merge worker.
pub struct LsmState {
    /// Persistent tiers C1..CN, fixed at open.
    pub tiers: Vec<Tier>,

    /// The memory tier.
    pub c0: Mutex<MemoryLevel>,

    /// Inserts into C0 since the last rolling merge; compared against
    /// `c0_max` on every write.
    pub c0_records: AtomicU64,

    /// C0 occupancy bound in records.
    pub c0_max: u64,

    /// Values logically deleted but still present in persistent tiers.
    pub tombstones: Mutex<Vec<i64>>,

    /// Min/max short-circuit state.
    pub range: Mutex<RangeSummary>,

    /// Source of fresh record keys.
    pub key_counter: AtomicU64,

    /// True while a cascade is in flight.
    merge_busy: AtomicBool,

    /// Serialises cascades.
    pub merge_mutex: Mutex<()>,
}

impl LsmState {
    pub fn new(config: &Config) -> Result<Self> {
        let tiers = tier::build_tiers(config)?;
        let c0_max = (config.first_level_file_size as f64 * config.c0_fraction_of_c1) as u64
            / BYTES_PER_RECORD;
        let c0 = MemoryLevel::new(config.c0_structure, c0_max as usize);
        Ok(Self {
            tiers,
            c0: Mutex::new(c0),
            c0_records: AtomicU64::new(0),
            c0_max,
            tombstones: Mutex::new(Vec::new()),
            range: Mutex::new(RangeSummary::default()),
            key_counter: AtomicU64::new(0),
            merge_busy: AtomicBool::new(false),
            merge_mutex: Mutex::new(()),
        })
    }

    /// Marks a cascade as in flight. Raised by the write path before the
    /// cascade starts (inline or enqueued), cleared when it completes.
    pub fn raise_merge_flag(&self) {
        self.merge_busy.store(true, Ordering::SeqCst);
    }

    pub fn clear_merge_flag(&self) {
        self.merge_busy.store(false, Ordering::SeqCst);
    }

    pub fn merge_idle(&self) -> bool {
        !self.merge_busy.load(Ordering::SeqCst)
    }

    /// Spin-waits, yielding the scheduler, until no cascade is in flight.
    pub fn wait_merge_idle(&self) {
        while !self.merge_idle() {
            std::thread::yield_now();
        }
    }

    /// Snapshot of per-tier counts and sizes for monitoring and tests.
    pub fn metrics(&self) -> Result<TreeMetrics> {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            tiers.push(TierMetrics {
                level: tier.level,
                capacity: tier.capacity,
                count: tier.disk.count()?,
                file_size: tier.disk.file_size()?,
            });
        }
        Ok(TreeMetrics {
            c0_count: self.c0.lock()?.count(),
            c0_max: self.c0_max,
            tombstone_count: self.tombstones.lock()?.len(),
            key_counter: self.key_counter.load(Ordering::SeqCst),
            tiers,
        })
    }
}

/// Clears the merge flag when dropped, so an inline cascade that errors out
/// never leaves writers spinning forever.
pub struct MergeFlagGuard<'a> {
    state: &'a LsmState,
}

impl<'a> MergeFlagGuard<'a> {
    pub fn new(state: &'a LsmState) -> Self {
        Self { state }
    }
}

impl Drop for MergeFlagGuard<'_> {
    fn drop(&mut self) {
        self.state.clear_merge_flag();
    }
}

/// Metrics snapshot for the whole tree.
#[derive(Debug, Clone)]
pub struct TreeMetrics {
    pub c0_count: u64,
    pub c0_max: u64,
    pub tombstone_count: usize,
    pub key_counter: u64,
    pub tiers: Vec<TierMetrics>,
}

/// Metrics snapshot for one persistent tier.
#[derive(Debug, Clone)]
pub struct TierMetrics {
    pub level: usize,
    pub capacity: u64,
    pub count: u64,
    pub file_size: u64,
}
