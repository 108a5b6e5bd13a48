//! The public LSM tree: client operations routed across the memory tier,
//! the tombstone log, and the persistent tiers.
//!
//! Writes land in C0 until its occupancy bound is reached, then a rolling
//! merge drains C0 into C1 and cascades any surplus down the ladder. Reads
//! probe tiers from fastest to slowest, so an insert is visible before it
//! ever reaches disk. Under read optimisation, deletes only append to the
//! tombstone log and reads outside the observed value range return without
//! touching any tier.

use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};

use super::merge;
use super::record::Record;
use super::state::{LsmState, MergeFlagGuard, TreeMetrics};
use super::worker::MergeWorker;

const LOCK_FILE: &str = "tierdb.lock";

/// Takes out an exclusive advisory lock on the data directory so two engine
/// instances never mutate the same tier files. The lock lives as long as
/// the returned handle and is released when it drops.
fn lock_dir(dir: &Path) -> Result<File> {
    let path = dir.join(LOCK_FILE);
    let file = File::options().create(true).write(true).open(&path)?;
    exclusive_lock(&file)
        .map_err(|e| Error::IO(format!("directory already locked at {}: {e}", path.display())))?;
    Ok(file)
}

#[cfg(unix)]
fn exclusive_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error()),
    }
}

#[cfg(not(unix))]
fn exclusive_lock(_file: &File) -> std::io::Result<()> {
    // No advisory locking on this platform; let the open proceed.
    Ok(())
}

/// An LSM tree over one memory tier and N on-disk B-tree tiers.
pub struct LsmTree {
    config: Config,
    state: Arc<LsmState>,
    worker: Option<MergeWorker>,
    _dir_lock: File,
}

impl LsmTree {
    /// Opens a tree in `dir` with default configuration.
    pub fn open(dir: &str) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    /// Opens a tree with custom configuration, creating the directory and
    /// the tier files as needed.
    pub fn open_with_config(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let dir_lock = lock_dir(&config.dir)?;
        let state = Arc::new(LsmState::new(&config)?);

        let worker = if config.threaded_rolling_merge {
            Some(MergeWorker::spawn(state.clone(), config.merge_strategy)?)
        } else {
            None
        };

        tracing::info!(
            dir = %config.dir.display(),
            levels = config.number_of_levels,
            c0_max = state.c0_max,
            "opened lsm tree"
        );

        Ok(Self {
            config,
            state,
            worker,
            _dir_lock: dir_lock,
        })
    }

    /// Issues a fresh monotonically-increasing record key.
    pub fn next_key(&self) -> u64 {
        self.state.key_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Inserts a record. A value already present in the target tier is
    /// silently ignored there.
    pub fn insert_value(&self, record: Record) -> Result<()> {
        if self.config.read_optimized {
            self.note_insert(record.value)?;
        }

        if self.state.c0_records.load(Ordering::SeqCst) < self.state.c0_max {
            self.state.c0.lock()?.insert(record);
            self.state.c0_records.fetch_add(1, Ordering::SeqCst);
        } else {
            self.rolling_merge()?;
            self.state.c0_records.store(0, Ordering::SeqCst);
            self.state.c0.lock()?.insert(record);
        }
        Ok(())
    }

    /// Deletes a record by value. Under read optimisation the value is only
    /// tombstoned; otherwise it is blind-deleted from every tier.
    pub fn delete_value(&self, record: Record) -> Result<()> {
        if self.config.read_optimized {
            self.state.tombstones.lock()?.push(record.value);
            return Ok(());
        }
        self.blind_delete(record.value)
    }

    /// Replaces `old` with `new`.
    pub fn update_value(&self, old: Record, new: Record) -> Result<()> {
        if self.config.read_optimized {
            self.state.tombstones.lock()?.push(old.value);
        } else {
            self.blind_delete(old.value)?;
        }
        self.insert_value(new)
    }

    /// Point lookup. Returns false for values outside the observed range or
    /// present in the tombstone log when read optimisation is on.
    pub fn read_value(&self, record: Record) -> Result<bool> {
        let value = record.value;

        if self.config.read_optimized {
            {
                let range = self.state.range.lock()?;
                if range.set && !range.covers(value) {
                    return Ok(false);
                }
            }
            // A tombstoned value reads as absent even while persistent
            // tiers still hold it.
            if self.state.tombstones.lock()?.contains(&value) {
                return Ok(false);
            }
        }

        if self.state.c0.lock()?.search(value) {
            return Ok(true);
        }
        for tier in &self.state.tiers {
            if tier.disk.search(value)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Snapshot of per-tier counts, sizes, and router state.
    pub fn metrics(&self) -> Result<TreeMetrics> {
        self.state.metrics()
    }

    /// Joins the merge worker and rewrites every tier header. The same work
    /// runs best-effort on drop; calling this surfaces errors instead.
    pub fn close(mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
        for tier in &self.state.tiers {
            tier.disk.close()?;
        }
        if let Ok(metrics) = self.state.metrics() {
            tracing::info!(
                c0 = metrics.c0_count,
                tombstones = metrics.tombstone_count,
                tiers = metrics.tiers.len(),
                "closed lsm tree"
            );
        }
        Ok(())
    }

    /// Tombstone scrub and range update performed on every insert under
    /// read optimisation.
    fn note_insert(&self, value: i64) -> Result<()> {
        self.state.tombstones.lock()?.retain(|&v| v != value);
        self.state.range.lock()?.observe(value);
        Ok(())
    }

    /// Blind delete from C0 and every persistent tier in order.
    fn blind_delete(&self, value: i64) -> Result<()> {
        self.state.c0.lock()?.delete(value);
        for tier in &self.state.tiers {
            tier.disk.delete(value)?;
        }
        Ok(())
    }

    /// Drains C0 into C1 and cascades any surplus down the ladder, inline
    /// or on the background worker.
    fn rolling_merge(&self) -> Result<()> {
        let state = &*self.state;
        state.wait_merge_idle();

        let mut c0 = state.c0.lock()?;
        let occupancy = c0.count();
        if occupancy == 0 {
            return Ok(());
        }

        let c1 = &state.tiers[0];
        let quota = merge::rolling_quota(occupancy, c1.capacity, &self.config);
        tracing::debug!(occupancy, to_move = quota.to_move, "rolling merge");
        merge::move_from_memory(&mut c0, &c1.disk, quota.to_move)?;
        drop(c0);

        if quota.threshold >= quota.to_move {
            return Ok(());
        }

        let surplus = c1.disk.count()?.saturating_sub(c1.capacity);
        if surplus == 0 {
            return Ok(());
        }

        state.raise_merge_flag();
        match &self.worker {
            Some(worker) => worker.submit(surplus),
            None => {
                let _clear = MergeFlagGuard::new(state);
                let _serialize = state.merge_mutex.lock()?;
                merge::cascade(&state.tiers, self.config.merge_strategy, surplus)?;
            }
        }
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
        // Tier headers are rewritten by each DiskLevel as it drops; the
        // directory lock releases with its handle afterwards.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::C0Structure;
    use crate::tree::node::FILE_HEADER_SIZE;

    fn insert_all(tree: &LsmTree, values: impl IntoIterator<Item = i64>) -> Result<()> {
        for v in values {
            tree.insert_value(Record::new(tree.next_key(), v))?;
        }
        Ok(())
    }

    fn read(tree: &LsmTree, value: i64) -> Result<bool> {
        tree.read_value(Record::new(0, value))
    }

    fn total_records(tree: &LsmTree) -> Result<u64> {
        let metrics = tree.metrics()?;
        Ok(metrics.c0_count + metrics.tiers.iter().map(|t| t.count).sum::<u64>())
    }

    #[test]
    fn test_happy_path_stays_in_memory() -> Result<()> {
        // S1: a handful of inserts never leaves C0.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .number_of_levels(5)
            .first_level_file_size(500_000)
            .c0_structure(C0Structure::Tree);
        let tree = LsmTree::open_with_config(config)?;

        insert_all(&tree, 1..=10)?;
        for v in 1..=10 {
            assert!(read(&tree, v)?, "value {v}");
        }

        let metrics = tree.metrics()?;
        assert_eq!(metrics.c0_count, 10);
        for tier in &metrics.tiers {
            assert_eq!(tier.count, 0);
            // Empty tier files are just a header and the signature byte.
            assert_eq!(tier.file_size, FILE_HEADER_SIZE + 1);
        }
        Ok(())
    }

    #[test]
    fn test_single_rolling_merge() -> Result<()> {
        // S2: 80 inserts through a 40-record C0 trigger exactly one merge.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .number_of_levels(5)
            .first_level_file_size(2000) // C1 capacity 40, C0 bound 40
            .c0_structure(C0Structure::Buffer);
        let tree = LsmTree::open_with_config(config)?;

        insert_all(&tree, 0..80)?;
        for v in 0..80 {
            assert!(read(&tree, v)?, "value {v}");
        }

        let metrics = tree.metrics()?;
        assert!(metrics.c0_count <= 40);
        assert!(metrics.tiers[0].count >= 40);
        assert_eq!(metrics.tiers[1].count, 0, "no overflow into C2");
        assert_eq!(total_records(&tree)?, 80);
        Ok(())
    }

    #[test]
    fn test_cascade_keeps_capacity_invariant() -> Result<()> {
        // S3: sustained inserts cascade down the ladder; every tier but the
        // last respects its capacity target once merges quiesce.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .number_of_levels(5)
            .first_level_file_size(2000)
            .c0_structure(C0Structure::Buffer);
        let tree = LsmTree::open_with_config(config)?;

        let count = 20_000i64;
        insert_all(&tree, 0..count)?;
        for v in (0..count).step_by(97) {
            assert!(read(&tree, v)?, "value {v}");
        }
        assert!(read(&tree, 0)?);
        assert!(read(&tree, count - 1)?);
        assert!(!read(&tree, count)?);

        let metrics = tree.metrics()?;
        for tier in &metrics.tiers[..4] {
            assert!(
                tier.count <= tier.capacity,
                "tier {} holds {} over target {}",
                tier.level,
                tier.count,
                tier.capacity
            );
        }
        assert_eq!(total_records(&tree)?, count as u64);
        for tier in &tree.state.tiers {
            tier.disk.validate()?;
        }
        Ok(())
    }

    #[test]
    fn test_tombstoned_value_reads_absent() -> Result<()> {
        // S4: a tombstoned value reads as absent without disturbing tiers.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .read_optimized(true)
            .c0_structure(C0Structure::Buffer);
        let tree = LsmTree::open_with_config(config)?;

        insert_all(&tree, 1..=10)?;
        tree.delete_value(Record::new(0, 5))?;

        assert!(tree.state.tombstones.lock().unwrap().contains(&5));
        assert!(!read(&tree, 5)?);
        assert!(read(&tree, 4)?);
        assert!(!read(&tree, 11)?);
        // The record itself was never erased from any tier.
        assert_eq!(total_records(&tree)?, 10);
        Ok(())
    }

    #[test]
    fn test_range_short_circuit() -> Result<()> {
        // S5: reads outside the observed min/max return without probing.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).read_optimized(true);
        let tree = LsmTree::open_with_config(config)?;

        insert_all(&tree, [100, 200, 150])?;

        {
            let range = tree.state.range.lock().unwrap();
            assert!(range.set);
            assert_eq!((range.min, range.max), (100, 200));
        }
        assert!(!read(&tree, 50)?);
        assert!(!read(&tree, 201)?);
        assert!(read(&tree, 150)?);
        Ok(())
    }

    #[test]
    fn test_update_tombstones_old_value() -> Result<()> {
        // S6: an update under read optimisation is tombstone-plus-insert.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).read_optimized(true);
        let tree = LsmTree::open_with_config(config)?;

        tree.insert_value(Record::new(tree.next_key(), 7))?;
        tree.update_value(Record::new(0, 7), Record::new(tree.next_key(), 77))?;

        assert!(tree.state.tombstones.lock().unwrap().contains(&7));
        assert!(read(&tree, 77)?);
        assert!(!read(&tree, 7)?);
        Ok(())
    }

    #[test]
    fn test_update_without_read_optimization() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let tree = LsmTree::open_with_config(Config::new(dir.path()))?;

        tree.insert_value(Record::new(tree.next_key(), 7))?;
        tree.update_value(Record::new(0, 7), Record::new(tree.next_key(), 77))?;

        assert!(!read(&tree, 7)?);
        assert!(read(&tree, 77)?);
        assert_eq!(total_records(&tree)?, 1);
        Ok(())
    }

    #[test]
    fn test_reinsert_scrubs_tombstone() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).read_optimized(true);
        let tree = LsmTree::open_with_config(config)?;

        insert_all(&tree, [5])?;
        tree.delete_value(Record::new(0, 5))?;
        assert!(!read(&tree, 5)?);

        insert_all(&tree, [5])?;
        assert!(tree.state.tombstones.lock().unwrap().is_empty());
        assert!(read(&tree, 5)?);
        Ok(())
    }

    #[test]
    fn test_duplicate_insert_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).c0_structure(C0Structure::Tree);
        let tree = LsmTree::open_with_config(config)?;

        tree.insert_value(Record::new(tree.next_key(), 7))?;
        let before = total_records(&tree)?;
        tree.insert_value(Record::new(tree.next_key(), 7))?;
        assert_eq!(total_records(&tree)?, before);
        Ok(())
    }

    #[test]
    fn test_blind_delete_removes_everywhere() -> Result<()> {
        // Push enough data that values live on disk, then blind-delete.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .number_of_levels(3)
            .first_level_file_size(2000)
            .c0_structure(C0Structure::Buffer);
        let tree = LsmTree::open_with_config(config)?;

        insert_all(&tree, 0..60)?;
        let before = total_records(&tree)?;
        assert_eq!(before, 60);

        tree.delete_value(Record::new(0, 3))?; // migrated to C1
        tree.delete_value(Record::new(0, 55))?; // still in C0
        assert!(!read(&tree, 3)?);
        assert!(!read(&tree, 55)?);
        assert_eq!(total_records(&tree)?, 58);
        Ok(())
    }

    #[test]
    fn test_read_your_writes() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let tree = LsmTree::open_with_config(Config::new(dir.path()))?;
        for v in [3, -8, 1_000_000] {
            tree.insert_value(Record::new(tree.next_key(), v))?;
            assert!(read(&tree, v)?);
        }
        Ok(())
    }

    #[test]
    fn test_key_counter_is_monotonic() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let tree = LsmTree::open_with_config(Config::new(dir.path()))?;
        let a = tree.next_key();
        let b = tree.next_key();
        let c = tree.next_key();
        assert!(a < b && b < c);
        Ok(())
    }

    #[test]
    fn test_persistence_across_reopen() -> Result<()> {
        // Records that reached disk survive a close/reopen; C0 contents are
        // memory-only by design.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .number_of_levels(2)
            .first_level_file_size(2000)
            .c0_structure(C0Structure::Buffer);

        {
            let tree = LsmTree::open_with_config(config.clone())?;
            insert_all(&tree, 0..80)?;
            tree.close()?;
        }

        let tree = LsmTree::open_with_config(config)?;
        let metrics = tree.metrics()?;
        assert_eq!(metrics.c0_count, 0);
        assert_eq!(metrics.tiers[0].count, 40);
        // The buffer drained its oldest 40 values into C1.
        for v in 0..40 {
            assert!(read(&tree, v)?, "value {v} lost across reopen");
        }
        Ok(())
    }

    #[test]
    fn test_threaded_merges_quiesce() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .number_of_levels(4)
            .first_level_file_size(2000)
            .c0_structure(C0Structure::Buffer)
            .threaded_rolling_merge(true);
        let tree = LsmTree::open_with_config(config)?;

        let count = 2000i64;
        insert_all(&tree, 0..count)?;
        tree.state.wait_merge_idle();

        for v in 0..count {
            assert!(read(&tree, v)?, "value {v}");
        }
        assert_eq!(total_records(&tree)?, count as u64);

        let metrics = tree.metrics()?;
        for tier in &metrics.tiers[..3] {
            assert!(tier.count <= tier.capacity, "tier {}", tier.level);
        }
        tree.close()?;
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_second_open_is_rejected_while_locked() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let _tree = LsmTree::open_with_config(Config::new(dir.path()))?;
        assert!(LsmTree::open_with_config(Config::new(dir.path())).is_err());
        Ok(())
    }

    #[test]
    fn test_directory_lock_releases_on_drop() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        {
            let _tree = LsmTree::open_with_config(Config::new(dir.path()))?;
        }
        let _tree = LsmTree::open_with_config(Config::new(dir.path()))?;
        Ok(())
    }
}
