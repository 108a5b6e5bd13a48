use std::path::PathBuf;

use crate::error::Result;
use crate::{errinput};

/// Representation used for the in-memory C0 tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C0Structure {
    /// An in-memory B-tree of the same order as the disk tiers.
    Tree,
    /// An unordered append buffer, drained wholesale on a rolling merge.
    Buffer,
}

/// Policy used when a tier overflows into the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Bulk handoff into the next tier when it is empty; falls back to
    /// the record cascade otherwise.
    WholeLevel,
    /// Record-by-record cascade, filling each tier and passing the
    /// remainder onward.
    Cascade,
}

/// Configuration for the LSM tree.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the tier files and the lock file.
    pub dir: PathBuf,

    /// Enables the tombstone log and the min/max read short-circuit.
    pub read_optimized: bool,

    /// Data structure backing the memory tier (default: Tree).
    pub c0_structure: C0Structure,

    /// Number of persistent tiers C1..CN (default: 5).
    pub number_of_levels: usize,

    /// Byte budget for the first persistent tier; the record capacity is
    /// derived from it (default: 500_000).
    pub first_level_file_size: u64,

    /// Capacity multiplier between successive tiers (default: 2).
    pub size_between_levels: u64,

    /// Move all of C0 into C1 on a rolling merge (default: true).
    pub copy_all_from_c0: bool,

    /// Fraction of C0 moved when `copy_all_from_c0` is off, in (0, 1].
    pub c0_fraction_to_copy: f64,

    /// C0 capacity as a fraction of C1's, in (0, 1].
    pub c0_fraction_of_c1: f64,

    /// Overflow policy between tiers (default: Cascade).
    pub merge_strategy: MergeStrategy,

    /// Run cascading merges on a background worker thread (default: false).
    pub threaded_rolling_merge: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tierdb"),
            read_optimized: false,
            c0_structure: C0Structure::Tree,
            number_of_levels: 5,
            first_level_file_size: 500_000,
            size_between_levels: 2,
            copy_all_from_c0: true,
            c0_fraction_to_copy: 1.0,
            c0_fraction_of_c1: 1.0,
            merge_strategy: MergeStrategy::Cascade,
            threaded_rolling_merge: false,
        }
    }
}

impl Config {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Enable the tombstone log and the min/max read short-circuit.
    pub fn read_optimized(mut self, enabled: bool) -> Self {
        self.read_optimized = enabled;
        self
    }

    /// Select the memory-tier representation.
    pub fn c0_structure(mut self, structure: C0Structure) -> Self {
        self.c0_structure = structure;
        self
    }

    /// Set the number of persistent tiers.
    pub fn number_of_levels(mut self, levels: usize) -> Self {
        self.number_of_levels = levels;
        self
    }

    /// Set the byte budget for the first persistent tier.
    pub fn first_level_file_size(mut self, bytes: u64) -> Self {
        self.first_level_file_size = bytes;
        self
    }

    /// Set the capacity multiplier between tiers.
    pub fn size_between_levels(mut self, ratio: u64) -> Self {
        self.size_between_levels = ratio;
        self
    }

    /// Move all of C0 into C1 on a rolling merge.
    pub fn copy_all_from_c0(mut self, all: bool) -> Self {
        self.copy_all_from_c0 = all;
        self
    }

    /// Set the fraction of C0 moved per rolling merge.
    pub fn c0_fraction_to_copy(mut self, fraction: f64) -> Self {
        self.c0_fraction_to_copy = fraction;
        self
    }

    /// Set C0's capacity as a fraction of C1's.
    pub fn c0_fraction_of_c1(mut self, fraction: f64) -> Self {
        self.c0_fraction_of_c1 = fraction;
        self
    }

    /// Select the merge strategy.
    pub fn merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Run cascading merges on a background worker.
    pub fn threaded_rolling_merge(mut self, threaded: bool) -> Self {
        self.threaded_rolling_merge = threaded;
        self
    }

    /// Validate parameter bounds before the engine opens any files.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_levels == 0 {
            return errinput!("number of levels must be at least 1");
        }
        if self.size_between_levels < 2 {
            return errinput!(
                "size between levels must be at least 2, got {}",
                self.size_between_levels
            );
        }
        if self.first_level_file_size < crate::tree::BYTES_PER_RECORD {
            return errinput!(
                "first level file size {} is below one record",
                self.first_level_file_size
            );
        }
        if !(0.0..=1.0).contains(&self.c0_fraction_to_copy) || self.c0_fraction_to_copy == 0.0 {
            return errinput!("c0 fraction to copy must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.c0_fraction_of_c1) || self.c0_fraction_of_c1 == 0.0 {
            return errinput!("c0 fraction of c1 must be in (0, 1]");
        }
        Ok(())
    }
}
