pub mod error;

pub mod config;
pub mod queue;
pub mod tree;

pub use config::{C0Structure, Config, MergeStrategy};
pub use error::{Error, Result};
pub use queue::WorkQueue;
pub use tree::{LsmTree, Record, TierMetrics, TreeMetrics};
