//! The persistent tier registry.
//!
//! Built once when the engine opens; membership never changes afterwards.
//! Each tier owns its disk B-tree and knows its level number and record
//! capacity. Capacities follow a ladder: the first tier's byte budget is a
//! construction parameter and each deeper tier multiplies it by the
//! configured ratio, with bytes converted to record counts through the
//! engine-wide per-record constant.

use crate::config::Config;
use crate::error::Result;

use super::disk::DiskLevel;
use super::BYTES_PER_RECORD;

/// One persistent tier: level number (1-based), record-count capacity
/// target, and the owning disk B-tree.
pub struct Tier {
    pub level: usize,
    pub capacity: u64,
    pub disk: DiskLevel,
}

/// Opens (or creates) the tier files `c1.bin..cN.bin` under the configured
/// directory and derives the capacity ladder.
pub fn build_tiers(config: &Config) -> Result<Vec<Tier>> {
    let mut tiers = Vec::with_capacity(config.number_of_levels);
    let mut budget = config.first_level_file_size;
    for level in 1..=config.number_of_levels {
        let path = config.dir.join(format!("c{level}.bin"));
        let disk = DiskLevel::open(&path)?;
        let capacity = budget / BYTES_PER_RECORD;
        tracing::debug!(level, capacity, path = %path.display(), "opened tier");
        tiers.push(Tier {
            level,
            capacity,
            disk,
        });
        budget = budget.saturating_mul(config.size_between_levels);
    }
    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_ladder() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .number_of_levels(4)
            .first_level_file_size(2000)
            .size_between_levels(2);

        let tiers = build_tiers(&config)?;
        assert_eq!(tiers.len(), 4);
        let capacities: Vec<u64> = tiers.iter().map(|t| t.capacity).collect();
        assert_eq!(capacities, vec![40, 80, 160, 320]);
        for (i, tier) in tiers.iter().enumerate() {
            assert_eq!(tier.level, i + 1);
            assert!(tier.disk.path().ends_with(format!("c{}.bin", i + 1)));
        }
        Ok(())
    }

    #[test]
    fn test_tier_files_created() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).number_of_levels(3);
        let _tiers = build_tiers(&config)?;
        for level in 1..=3 {
            assert!(dir.path().join(format!("c{level}.bin")).exists());
        }
        Ok(())
    }
}
