//! Tiered LSM storage engine over on-disk B-trees.
//!
//! The engine keeps an ordered multiset of 64-bit values across one memory
//! tier and N persistent tiers, each persistent tier an independent on-disk
//! B-tree file:
//!
//! ```text
//!            ┌──────────────────┐
//!            │  C0 (memory)     │  B-tree or append buffer
//!            └────────┬─────────┘
//!                     │ rolling merge when C0 fills
//!                     ▼
//!            ┌──────────────────┐
//!            │  C1  c1.bin      │  on-disk B-tree, capacity C₁
//!            └────────┬─────────┘
//!                     │ cascade of the surplus
//!                     ▼
//!            ┌──────────────────┐
//!            │  C2  c2.bin      │  capacity C₁ × R
//!            └────────┬─────────┘
//!                     ▼
//!                    ...
//! ```
//!
//! # Write path
//!
//! Inserts land in C0 until its occupancy bound is reached; a rolling merge
//! then drains C0 into C1 and, when C1 exceeds its capacity target, cascades
//! the surplus tier by tier. The cascade runs inline or on a background
//! worker, coordinated through an atomic merge flag that writers spin on.
//!
//! # Read path
//!
//! Reads probe C0 first, then every persistent tier in order, so a record is
//! visible from the moment it is inserted. Under read optimisation a
//! tombstone log makes deletes cheap and a min/max summary rejects
//! out-of-range lookups without touching any tier.
//!
//! # Durability
//!
//! Tier headers are rewritten on clean shutdown only; there is no
//! write-ahead log, and C0 contents do not survive a restart.

pub mod disk;
pub mod memory;
pub mod merge;
pub mod node;
pub mod record;
pub mod state;
pub mod store;
pub mod tier;
pub mod worker;

/// Fixed per-record byte cost used to convert tier byte budgets into record
/// capacities. Shared by the capacity ladder and the C0 bound.
pub const BYTES_PER_RECORD: u64 = 50;

pub use record::Record;
pub use state::{TierMetrics, TreeMetrics};
pub use store::LsmTree;
