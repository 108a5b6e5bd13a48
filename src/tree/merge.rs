//! Record migration between tiers.
//!
//! A rolling merge drains part of C0 into C1 when C0 fills; when that leaves
//! C1 over its capacity target, the surplus cascades tier by tier, each tier
//! keeping what fits and passing the remainder onward. The final tier
//! retains any overflow, since capacity is advisory at the bottom of the
//! ladder.
//!
//! Moved records keep their value and take a fresh key from a counter local
//! to the move. Disk-to-disk moves re-read the source root through the node
//! mutex before every move, since both the insert into the destination and
//! the delete from the source reshape their trees.

use crate::config::{Config, MergeStrategy};
use crate::error::Result;

use super::disk::DiskLevel;
use super::memory::MemoryLevel;
use super::record::Record;
use super::tier::Tier;

/// How much a rolling merge moves out of C0, and the C1 room threshold that
/// decides whether the cascade runs afterwards.
pub struct RollingQuota {
    pub to_move: u64,
    pub threshold: u64,
}

/// Derives the rolling-merge quota from the C0 occupancy and the configured
/// copy fraction.
pub fn rolling_quota(occupancy: u64, c1_capacity: u64, config: &Config) -> RollingQuota {
    if config.copy_all_from_c0 {
        RollingQuota {
            to_move: occupancy,
            threshold: c1_capacity,
        }
    } else {
        RollingQuota {
            to_move: (occupancy as f64 * config.c0_fraction_to_copy) as u64,
            threshold: (c1_capacity as f64 * config.c0_fraction_to_copy) as u64,
        }
    }
}

/// Moves up to `to_move` records from C0 into a persistent tier. Returns the
/// number actually moved.
pub fn move_from_memory(c0: &mut MemoryLevel, dest: &DiskLevel, to_move: u64) -> Result<u64> {
    let values = c0.drain_for_merge(to_move as usize);
    let moved = values.len() as u64;
    let mut key = 0u64;
    for value in values {
        key += 1;
        dest.insert(Record::new(key, value))?;
    }
    Ok(moved)
}

/// Moves up to `to_move` records from one persistent tier to the next one
/// down, one record at a time in natural tree order. Returns the number
/// actually moved.
pub fn move_between_disks(source: &DiskLevel, dest: &DiskLevel, to_move: u64) -> Result<u64> {
    let mut key = 0u64;
    let mut moved = 0u64;
    while moved < to_move {
        let Some(record) = source.first_record()? else {
            break;
        };
        key += 1;
        dest.insert(Record::new(key, record.value))?;
        source.delete(record.value)?;
        moved += 1;
    }
    Ok(moved)
}

/// Cascades `surplus` records out of the first tier, filling each deeper
/// tier to its capacity target and passing the remainder onward. The last
/// tier keeps whatever is left.
pub fn cascade(tiers: &[Tier], strategy: MergeStrategy, surplus: u64) -> Result<()> {
    let mut to_pass = surplus;
    for j in 1..tiers.len() {
        if to_pass == 0 {
            return Ok(());
        }
        let source = &tiers[j - 1];
        let dest = &tiers[j];
        let dest_count = dest.disk.count()?;

        if strategy == MergeStrategy::WholeLevel && dest_count == 0 {
            // Empty destination: hand the whole surplus over without a room
            // computation; anything over capacity waits for the next cascade.
            let moved = move_between_disks(&source.disk, &dest.disk, to_pass)?;
            tracing::debug!(
                from = source.level,
                to = dest.level,
                moved,
                "whole-level handoff"
            );
            return Ok(());
        }

        let room = dest.capacity.saturating_sub(dest_count);
        let moved = move_between_disks(&source.disk, &dest.disk, to_pass)?;
        tracing::debug!(from = source.level, to = dest.level, moved, room, "cascade step");
        if room >= to_pass {
            return Ok(());
        }
        to_pass = dest.disk.count()?.saturating_sub(dest.capacity);
    }
    if to_pass > 0 {
        tracing::debug!(retained = to_pass, "final tier retains overflow");
    }
    Ok(())
}
