/// A stored record: the domain value plus its insertion sequence number.
///
/// Ordering, duplicate detection, and search all use `value`; `key` only
/// records insertion provenance and is rewritten when a record migrates
/// between tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Record {
    pub key: u64,
    pub value: i64,
}

impl Record {
    pub fn new(key: u64, value: i64) -> Self {
        Self { key, value }
    }
}
