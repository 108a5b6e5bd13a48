//! The in-memory C0 tier.
//!
//! C0 takes one of two shapes, selected at configuration time: a B-tree of
//! the same order as the persistent tiers but with process-memory child
//! links, or an unordered append buffer whose capacity is reserved up front.
//! The buffer trades per-insert ordering work for a cheap wholesale drain on
//! a rolling merge.

use crate::config::C0Structure;

use super::node::{MAX_RECORDS, MIN_RECORDS, ORDER};
use super::record::Record;

/// A node of the in-memory B-tree. Same shape as the on-disk node, with
/// owned child links instead of file offsets.
struct MemNode {
    n: usize,
    records: [Record; MAX_RECORDS],
    children: [Option<Box<MemNode>>; ORDER],
}

impl MemNode {
    fn empty() -> Box<Self> {
        Box::new(Self {
            n: 0,
            records: [Record::default(); MAX_RECORDS],
            children: std::array::from_fn(|_| None),
        })
    }

    fn is_leaf(&self) -> bool {
        self.children[0].is_none()
    }

    fn search_slot(&self, value: i64) -> usize {
        self.records[..self.n].partition_point(|r| r.value < value)
    }
}

enum Ins {
    Done,
    Duplicate,
    Promote {
        median: Record,
        right: Option<Box<MemNode>>,
    },
}

enum Del {
    Done,
    NotFound,
    Underflow,
}

/// An in-memory B-tree ordered by record value. Split and rebalance policies
/// mirror the on-disk tier; freed nodes are simply dropped.
#[derive(Default)]
pub struct MemTree {
    root: Option<Box<MemNode>>,
}

impl MemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record; a duplicate value is silently ignored.
    pub fn insert(&mut self, record: Record) {
        match Self::ins(&mut self.root, record) {
            Ins::Done | Ins::Duplicate => {}
            Ins::Promote { median, right } => {
                let mut node = MemNode::empty();
                node.n = 1;
                node.records[0] = median;
                node.children[0] = self.root.take();
                node.children[1] = right;
                self.root = Some(node);
            }
        }
    }

    fn ins(slot_ref: &mut Option<Box<MemNode>>, record: Record) -> Ins {
        let Some(node) = slot_ref else {
            return Ins::Promote {
                median: record,
                right: None,
            };
        };

        let slot = node.search_slot(record.value);
        if slot < node.n && node.records[slot].value == record.value {
            return Ins::Duplicate;
        }

        let (median, right) = match Self::ins(&mut node.children[slot], record) {
            Ins::Promote { median, right } => (median, right),
            done => return done,
        };

        let slot = node.search_slot(median.value);
        if node.n < MAX_RECORDS {
            let mut j = node.n;
            while j > slot {
                node.records[j] = node.records[j - 1];
                let child = node.children[j].take();
                node.children[j + 1] = child;
                j -= 1;
            }
            node.records[slot] = median;
            node.children[slot + 1] = right;
            node.n += 1;
            return Ins::Done;
        }

        // Full node: split around the median of the augmented sequence.
        let (k_final, p_final) = if slot == MAX_RECORDS {
            (median, right)
        } else {
            let kf = node.records[MAX_RECORDS - 1];
            let pf = node.children[MAX_RECORDS].take();
            let mut j = MAX_RECORDS - 1;
            while j > slot {
                node.records[j] = node.records[j - 1];
                let child = node.children[j].take();
                node.children[j + 1] = child;
                j -= 1;
            }
            node.records[slot] = median;
            node.children[slot + 1] = right;
            (kf, pf)
        };

        let h = MAX_RECORDS / 2;
        let promoted = node.records[h];

        let mut sibling = MemNode::empty();
        sibling.n = MAX_RECORDS - h;
        for j in 0..sibling.n {
            sibling.children[j] = node.children[j + h + 1].take();
            sibling.records[j] = if j < sibling.n - 1 {
                node.records[j + h + 1]
            } else {
                k_final
            };
        }
        sibling.children[sibling.n] = p_final;
        node.n = h;

        Ins::Promote {
            median: promoted,
            right: Some(sibling),
        }
    }

    /// Deletes the record carrying `value`; an absent value is ignored.
    pub fn delete(&mut self, value: i64) {
        if let Del::Underflow = Self::del(&mut self.root, value, true) {
            // Root emptied out: its lone child (if any) becomes the root.
            if let Some(mut old) = self.root.take() {
                self.root = old.children[0].take();
            }
        }
    }

    fn del(slot_ref: &mut Option<Box<MemNode>>, value: i64, is_root: bool) -> Del {
        let Some(node) = slot_ref else {
            return Del::NotFound;
        };

        let n = node.n;
        let slot = node.search_slot(value);
        let min = if is_root { 1 } else { MIN_RECORDS };

        if node.is_leaf() {
            if slot == n || value < node.records[slot].value {
                return Del::NotFound;
            }
            for j in slot + 1..n {
                node.records[j - 1] = node.records[j];
            }
            node.n -= 1;
            return if node.n >= min { Del::Done } else { Del::Underflow };
        }

        let descend_value = if slot < n && node.records[slot].value == value {
            // Found in an interior node: replace with the rightmost record
            // of the left subtree and delete that record down there instead.
            let pred = match node.children[slot].as_deref() {
                Some(child) => Self::rightmost(child),
                None => return Del::NotFound,
            };
            node.records[slot] = pred;
            pred.value
        } else {
            value
        };

        let code = Self::del(&mut node.children[slot], descend_value, false);
        if !matches!(code, Del::Underflow) {
            return code;
        }

        Self::rebalance(node, slot);
        if node.n >= min {
            Del::Done
        } else {
            Del::Underflow
        }
    }

    fn rightmost(node: &MemNode) -> Record {
        let mut node = node;
        while let Some(child) = node.children[node.n].as_deref() {
            node = child;
        }
        node.records[node.n - 1]
    }

    /// Fixes an underflowed child at `slot`: borrow from a sibling that can
    /// spare a record, else merge with a sibling plus the pivot.
    fn rebalance(node: &mut MemNode, slot: usize) {
        let n = node.n;

        if slot > 0 {
            let pivot = slot - 1;
            let can_borrow = node.children[pivot]
                .as_deref()
                .is_some_and(|l| l.n > MIN_RECORDS);
            if can_borrow {
                let mut left = node.children[pivot].take();
                let mut right = node.children[slot].take();
                if let (Some(left), Some(right)) = (left.as_deref_mut(), right.as_deref_mut()) {
                    let spill = right.children[right.n].take();
                    right.children[right.n + 1] = spill;
                    let mut j = right.n;
                    while j > 0 {
                        right.records[j] = right.records[j - 1];
                        let child = right.children[j - 1].take();
                        right.children[j] = child;
                        j -= 1;
                    }
                    right.n += 1;
                    right.records[0] = node.records[pivot];
                    right.children[0] = left.children[left.n].take();
                    left.n -= 1;
                    node.records[pivot] = left.records[left.n];
                }
                node.children[pivot] = left;
                node.children[slot] = right;
                return;
            }
        }

        if slot < n {
            let can_borrow = node.children[slot + 1]
                .as_deref()
                .is_some_and(|r| r.n > MIN_RECORDS);
            if can_borrow {
                let mut left = node.children[slot].take();
                let mut right = node.children[slot + 1].take();
                if let (Some(left), Some(right)) = (left.as_deref_mut(), right.as_deref_mut()) {
                    left.records[left.n] = node.records[slot];
                    left.children[left.n + 1] = right.children[0].take();
                    node.records[slot] = right.records[0];
                    left.n += 1;
                    right.n -= 1;
                    for j in 0..right.n {
                        right.records[j] = right.records[j + 1];
                        let child = right.children[j + 1].take();
                        right.children[j] = child;
                    }
                    let spill = right.children[right.n + 1].take();
                    right.children[right.n] = spill;
                }
                node.children[slot] = left;
                node.children[slot + 1] = right;
                return;
            }
        }

        // Merge the underflowed child with a sibling plus the pivot record.
        let pivot = if slot == n { slot - 1 } else { slot };
        let right = node.children[pivot + 1].take();
        if let (Some(left), Some(mut right)) = (node.children[pivot].as_deref_mut(), right) {
            left.records[left.n] = node.records[pivot];
            left.children[left.n + 1] = right.children[0].take();
            for j in 0..right.n {
                left.records[left.n + 1 + j] = right.records[j];
                left.children[left.n + 2 + j] = right.children[j + 1].take();
            }
            left.n += 1 + right.n;
        }
        for j in pivot + 1..n {
            node.records[j - 1] = node.records[j];
            let child = node.children[j + 1].take();
            node.children[j] = child;
        }
        node.n -= 1;
    }

    /// Point lookup by value.
    pub fn search(&self, value: i64) -> bool {
        let mut node = self.root.as_deref();
        while let Some(current) = node {
            let slot = current.search_slot(value);
            if slot < current.n && current.records[slot].value == value {
                return true;
            }
            node = current.children[slot].as_deref();
        }
        false
    }

    pub fn count(&self) -> u64 {
        fn walk(node: Option<&MemNode>) -> u64 {
            let Some(node) = node else { return 0 };
            let mut total = node.n as u64;
            for j in 0..=node.n {
                total += walk(node.children[j].as_deref());
            }
            total
        }
        walk(self.root.as_deref())
    }

    /// Collects up to `limit` records in natural tree order (node records
    /// before children), for migration into a persistent tier.
    pub fn collect_for_merge(&self, limit: usize) -> Vec<Record> {
        fn walk(node: Option<&MemNode>, out: &mut Vec<Record>, limit: usize) {
            let Some(node) = node else { return };
            for j in 0..node.n {
                if out.len() == limit {
                    return;
                }
                out.push(node.records[j]);
            }
            for j in 0..=node.n {
                if out.len() == limit {
                    return;
                }
                walk(node.children[j].as_deref(), out, limit);
            }
        }
        let mut out = Vec::with_capacity(limit.min(1024));
        walk(self.root.as_deref(), &mut out, limit);
        out
    }
}

/// The C0 tier: an ordered B-tree or an unordered append buffer.
pub enum MemoryLevel {
    Tree(MemTree),
    Buffer(Vec<i64>),
}

impl MemoryLevel {
    /// Builds the configured representation; the buffer variant reserves its
    /// full capacity up front so it never reallocates.
    pub fn new(structure: C0Structure, capacity: usize) -> Self {
        match structure {
            C0Structure::Tree => Self::Tree(MemTree::new()),
            C0Structure::Buffer => Self::Buffer(Vec::with_capacity(capacity)),
        }
    }

    pub fn insert(&mut self, record: Record) {
        match self {
            Self::Tree(tree) => tree.insert(record),
            Self::Buffer(values) => values.push(record.value),
        }
    }

    /// Removes the first record equal to `value`, if present.
    pub fn delete(&mut self, value: i64) {
        match self {
            Self::Tree(tree) => tree.delete(value),
            Self::Buffer(values) => {
                if let Some(pos) = values.iter().position(|&v| v == value) {
                    values.remove(pos);
                }
            }
        }
    }

    pub fn search(&self, value: i64) -> bool {
        match self {
            Self::Tree(tree) => tree.search(value),
            Self::Buffer(values) => values.contains(&value),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Self::Tree(tree) => tree.count(),
            Self::Buffer(values) => values.len() as u64,
        }
    }

    /// Removes and returns up to `to_move` values for migration. The buffer
    /// variant drains wholesale when everything is moving; the tree variant
    /// deletes the collected records one by one.
    pub fn drain_for_merge(&mut self, to_move: usize) -> Vec<i64> {
        match self {
            Self::Buffer(values) => {
                if to_move >= values.len() {
                    std::mem::take(values)
                } else {
                    values.drain(..to_move).collect()
                }
            }
            Self::Tree(tree) => {
                let records = tree.collect_for_merge(to_move);
                let mut moved = Vec::with_capacity(records.len());
                for record in records {
                    tree.delete(record.value);
                    moved.push(record.value);
                }
                moved
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(values: impl IntoIterator<Item = i64>) -> MemTree {
        let mut tree = MemTree::new();
        for (i, v) in values.into_iter().enumerate() {
            tree.insert(Record::new(i as u64, v));
        }
        tree
    }

    #[test]
    fn test_tree_insert_search_across_splits() {
        let values: Vec<i64> = (0..200).map(|i| (i * 37) % 997).collect();
        let tree = tree_with(values.clone());
        for &v in &values {
            assert!(tree.search(v), "value {v} should be present");
        }
        assert!(!tree.search(-5));
        assert_eq!(tree.count(), 200);
    }

    #[test]
    fn test_tree_duplicate_ignored() {
        let tree = tree_with([7, 7, 7]);
        assert_eq!(tree.count(), 1);
    }

    #[test]
    fn test_tree_delete_with_rebalancing() {
        let values: Vec<i64> = (0..150).map(|i| (i * 37) % 997).collect();
        let mut tree = tree_with(values.clone());
        for &v in values.iter().step_by(2) {
            tree.delete(v);
        }
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(tree.search(v), i % 2 == 1, "value {v}");
        }
        assert_eq!(tree.count(), 75);
    }

    #[test]
    fn test_tree_delete_to_empty() {
        let mut tree = tree_with(0..60);
        for v in 0..60 {
            tree.delete(v);
        }
        assert_eq!(tree.count(), 0);
        assert!(!tree.search(30));
        tree.insert(Record::new(0, 99));
        assert!(tree.search(99));
    }

    #[test]
    fn test_tree_collect_respects_limit() {
        let tree = tree_with(0..50);
        let collected = tree.collect_for_merge(20);
        assert_eq!(collected.len(), 20);
        let all = tree.collect_for_merge(usize::MAX);
        assert_eq!(all.len(), 50);
    }

    #[test]
    fn test_buffer_basic_operations() {
        let mut c0 = MemoryLevel::new(C0Structure::Buffer, 16);
        c0.insert(Record::new(1, 5));
        c0.insert(Record::new(2, 9));
        c0.insert(Record::new(3, 5));
        assert_eq!(c0.count(), 3);
        assert!(c0.search(9));
        assert!(!c0.search(4));

        // Removes the first equal value only.
        c0.delete(5);
        assert_eq!(c0.count(), 2);
        assert!(c0.search(5));
    }

    #[test]
    fn test_buffer_drain_wholesale() {
        let mut c0 = MemoryLevel::new(C0Structure::Buffer, 16);
        for v in 0..10 {
            c0.insert(Record::new(v as u64, v));
        }
        let moved = c0.drain_for_merge(10);
        assert_eq!(moved.len(), 10);
        assert_eq!(c0.count(), 0);
    }

    #[test]
    fn test_buffer_drain_prefix() {
        let mut c0 = MemoryLevel::new(C0Structure::Buffer, 16);
        for v in 0..10 {
            c0.insert(Record::new(v as u64, v));
        }
        let moved = c0.drain_for_merge(4);
        assert_eq!(moved, vec![0, 1, 2, 3]);
        assert_eq!(c0.count(), 6);
    }

    #[test]
    fn test_tree_drain_removes_moved_records() {
        let mut c0 = MemoryLevel::new(C0Structure::Tree, 0);
        for v in 0..30 {
            c0.insert(Record::new(v as u64, v));
        }
        let moved = c0.drain_for_merge(12);
        assert_eq!(moved.len(), 12);
        assert_eq!(c0.count(), 18);
        for v in moved {
            assert!(!c0.search(v), "moved value {v} should be gone from C0");
        }
    }
}
