//! On-disk B-tree backing a single persistent tier.
//!
//! Each tier owns one file with a fixed layout: a 16-byte header carrying the
//! root offset and the free-list head, a body of fixed-size node records at
//! even offsets, and a single trailing signature byte used to verify the
//! format when an existing file is reopened. Freed node slots form a singly
//! linked list threaded through the first child slot of each freed node.
//!
//! Concurrency follows a single-node-latch discipline: every node read or
//! write acquires the tier's node mutex for the duration of that one I/O, and
//! a multi-node descent re-acquires it per node. Readers racing a split or a
//! rebalance may observe a false miss for a record in flight, never a torn
//! node. The header is only rewritten on clean close.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::node::{Node, PageId, FORMAT_SIGNATURE, MAX_RECORDS, MIN_RECORDS, NIL, NODE_SIZE};
use super::record::Record;
use crate::error::Result;
use crate::errdata;

/// Outcome of a recursive insert step. `Promote` carries the median record
/// and the new right sibling that the caller still has to place.
enum Ins {
    Done,
    Duplicate,
    Promote { median: Record, right: PageId },
}

/// Outcome of a recursive delete step.
enum Del {
    Done,
    NotFound,
    Underflow,
}

/// An on-disk B-tree of fixed order, backing one persistent tier.
pub struct DiskLevel {
    path: PathBuf,
    inner: Mutex<LevelFile>,
}

/// File handle plus the header fields and the cached root node. Guarded by
/// the tier's node mutex; held for at most one node I/O at a time.
struct LevelFile {
    file: File,
    root: PageId,
    free_list: PageId,
    root_cache: Node,
}

impl LevelFile {
    /// Reads the node at `at`, serving the cached copy when `at` is the live
    /// root.
    fn read_node(&mut self, at: PageId) -> Result<Node> {
        if at == self.root && self.root_cache.n > 0 {
            return Ok(self.root_cache);
        }
        self.read_node_from_disk(at)
    }

    fn read_node_from_disk(&mut self, at: PageId) -> Result<Node> {
        self.file.seek(SeekFrom::Start(at as u64))?;
        let mut buf = [0u8; NODE_SIZE];
        self.file.read_exact(&mut buf)?;
        Node::decode(&buf)
    }

    /// Writes the node at `at`, refreshing the root cache when `at` is the
    /// live root.
    fn write_node(&mut self, at: PageId, node: &Node) -> Result<()> {
        if at == self.root {
            self.root_cache = *node;
        }
        self.file.seek(SeekFrom::Start(at as u64))?;
        self.file.write_all(&node.encode())?;
        Ok(())
    }

    /// Rewrites the header and restores the trailing signature byte if the
    /// current length is even. Idempotent.
    fn persist_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_i64::<LittleEndian>(self.root)?;
        self.file.write_i64::<LittleEndian>(self.free_list)?;
        let len = self.file.seek(SeekFrom::End(0))?;
        if len & 1 == 0 {
            self.file.write_all(&[FORMAT_SIGNATURE])?;
        }
        self.file.flush()?;
        Ok(())
    }
}

impl DiskLevel {
    /// Opens the tier file at `path`, creating it when absent. Reopening an
    /// existing file verifies the trailing signature byte and re-caches the
    /// root node.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (root, free_list, root_cache) = if len == 0 {
            file.write_i64::<LittleEndian>(NIL)?;
            file.write_i64::<LittleEndian>(NIL)?;
            file.write_all(&[FORMAT_SIGNATURE])?;
            file.flush()?;
            (NIL, NIL, Node::empty())
        } else {
            file.seek(SeekFrom::End(-1))?;
            let mut sig = [0u8; 1];
            file.read_exact(&mut sig)?;
            if sig[0] != FORMAT_SIGNATURE {
                return errdata!("wrong file format: {}", path.display());
            }
            file.seek(SeekFrom::Start(0))?;
            let root = file.read_i64::<LittleEndian>()?;
            let free_list = file.read_i64::<LittleEndian>()?;
            let mut cache = Node::empty();
            if root != NIL {
                file.seek(SeekFrom::Start(root as u64))?;
                let mut buf = [0u8; NODE_SIZE];
                file.read_exact(&mut buf)?;
                cache = Node::decode(&buf)?;
            }
            (root, free_list, cache)
        };

        Ok(Self {
            path,
            inner: Mutex::new(LevelFile {
                file,
                root,
                free_list,
                root_cache,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current root offset, `NIL` when the tree is empty.
    pub fn root(&self) -> Result<PageId> {
        Ok(self.inner.lock()?.root)
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.inner.lock()?.file.metadata()?.len())
    }

    /// Rewrites the header fields and the trailing signature. Called on
    /// clean shutdown; safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        self.inner.lock()?.persist_header()
    }

    fn read_node(&self, at: PageId) -> Result<Node> {
        self.inner.lock()?.read_node(at)
    }

    fn write_node(&self, at: PageId, node: &Node) -> Result<()> {
        self.inner.lock()?.write_node(at, node)
    }

    /// Allocates a node slot: pops the free list head, else appends at
    /// end-of-file rounded down to an even offset so that the trailing
    /// signature byte is overwritten by the new node.
    fn alloc_node(&self) -> Result<PageId> {
        let mut inner = self.inner.lock()?;
        if inner.free_list != NIL {
            let at = inner.free_list;
            let node = inner.read_node(at)?;
            inner.free_list = node.children[0];
            Ok(at)
        } else {
            let end = inner.file.seek(SeekFrom::End(0))?;
            let at = (end & !1) as PageId;
            inner.write_node(at, &Node::empty())?;
            Ok(at)
        }
    }

    /// Returns a node slot to the free list, threading the list through the
    /// node's first child slot.
    fn free_node(&self, at: PageId) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let mut node = inner.read_node(at)?;
        node.children[0] = inner.free_list;
        inner.free_list = at;
        inner.write_node(at, &node)
    }

    /// Publishes a freshly written node as the new root.
    fn install_root(&self, at: PageId, node: &Node) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.root = at;
        inner.root_cache = *node;
        Ok(())
    }

    /// Replaces the root with one of its children after a root underflow.
    fn collapse_root(&self, new_root: PageId) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.root = new_root;
        inner.root_cache = if new_root != NIL {
            inner.read_node_from_disk(new_root)?
        } else {
            Node::empty()
        };
        Ok(())
    }

    /// Inserts a record, keyed and deduplicated by its value. A duplicate
    /// value is silently ignored.
    pub fn insert(&self, record: Record) -> Result<()> {
        let root = self.root()?;
        match self.ins(root, record)? {
            Ins::Done | Ins::Duplicate => Ok(()),
            Ins::Promote { median, right } => {
                let at = self.alloc_node()?;
                let mut node = Node::empty();
                node.n = 1;
                node.records[0] = median;
                node.children[0] = root;
                node.children[1] = right;
                self.write_node(at, &node)?;
                self.install_root(at, &node)
            }
        }
    }

    fn ins(&self, at: PageId, record: Record) -> Result<Ins> {
        if at == NIL {
            return Ok(Ins::Promote {
                median: record,
                right: NIL,
            });
        }

        let mut node = self.read_node(at)?;
        let slot = node.search_slot(record.value);
        if slot < node.n && node.records[slot].value == record.value {
            return Ok(Ins::Duplicate);
        }

        let (median, right) = match self.ins(node.children[slot], record)? {
            Ins::Promote { median, right } => (median, right),
            done => return Ok(done),
        };

        // The child split; place the promoted median in this node.
        let slot = node.search_slot(median.value);
        if node.n < MAX_RECORDS {
            let mut j = node.n;
            while j > slot {
                node.records[j] = node.records[j - 1];
                node.children[j + 1] = node.children[j];
                j -= 1;
            }
            node.records[slot] = median;
            node.children[slot + 1] = right;
            node.n += 1;
            self.write_node(at, &node)?;
            return Ok(Ins::Done);
        }

        // Full node: split around the median of the augmented sequence. The
        // rightmost pair is carried separately when the new item lands
        // anywhere but the last slot.
        let (k_final, p_final) = if slot == MAX_RECORDS {
            (median, right)
        } else {
            let carried = (node.records[MAX_RECORDS - 1], node.children[MAX_RECORDS]);
            let mut j = MAX_RECORDS - 1;
            while j > slot {
                node.records[j] = node.records[j - 1];
                node.children[j + 1] = node.children[j];
                j -= 1;
            }
            node.records[slot] = median;
            node.children[slot + 1] = right;
            carried
        };

        let h = MAX_RECORDS / 2;
        let promoted = node.records[h];

        let mut sibling = Node::empty();
        sibling.n = MAX_RECORDS - h;
        for j in 0..sibling.n {
            sibling.children[j] = node.children[j + h + 1];
            sibling.records[j] = if j < sibling.n - 1 {
                node.records[j + h + 1]
            } else {
                k_final
            };
        }
        sibling.children[sibling.n] = p_final;
        node.n = h;

        let sibling_at = self.alloc_node()?;
        self.write_node(at, &node)?;
        self.write_node(sibling_at, &sibling)?;
        Ok(Ins::Promote {
            median: promoted,
            right: sibling_at,
        })
    }

    /// Deletes the record carrying `value`. Deleting an absent value is
    /// silently ignored.
    pub fn delete(&self, value: i64) -> Result<()> {
        let root = self.root()?;
        match self.del(root, value)? {
            Del::Done | Del::NotFound => Ok(()),
            Del::Underflow => {
                // The root is down to zero records; its lone child (or NIL)
                // becomes the new root and the old slot is recycled.
                let old = self.read_node(root)?;
                self.collapse_root(old.children[0])?;
                self.free_node(root)
            }
        }
    }

    fn del(&self, at: PageId, value: i64) -> Result<Del> {
        if at == NIL {
            return Ok(Del::NotFound);
        }

        let mut node = self.read_node(at)?;
        let n = node.n;
        let slot = node.search_slot(value);
        let min = if at == self.root()? { 1 } else { MIN_RECORDS };

        if node.is_leaf() {
            if slot == n || value < node.records[slot].value {
                return Ok(Del::NotFound);
            }
            for j in slot + 1..n {
                node.records[j - 1] = node.records[j];
                node.children[j] = node.children[j + 1];
            }
            node.n -= 1;
            self.write_node(at, &node)?;
            return Ok(if node.n >= min { Del::Done } else { Del::Underflow });
        }

        if slot < n && node.records[slot].value == value {
            // Found in an interior node: swap with the rightmost record of
            // the left subtree's rightmost leaf, then delete down there.
            let mut q = node.children[slot];
            let (leaf_at, mut leaf) = loop {
                let candidate = self.read_node(q)?;
                let next = candidate.children[candidate.n];
                if next == NIL {
                    break (q, candidate);
                }
                q = next;
            };
            let target = node.records[slot];
            node.records[slot] = leaf.records[leaf.n - 1];
            leaf.records[leaf.n - 1] = target;
            self.write_node(at, &node)?;
            self.write_node(leaf_at, &leaf)?;
        }

        let code = self.del(node.children[slot], value)?;
        if !matches!(code, Del::Underflow) {
            return Ok(code);
        }

        // The child at `slot` underflowed: borrow from a sibling when one
        // can spare a record, else merge with a sibling and the pivot.
        if slot > 0 {
            let pivot = slot - 1;
            let left_at = node.children[pivot];
            let mut left = self.read_node(left_at)?;
            if left.n > MIN_RECORDS {
                let right_at = node.children[slot];
                let mut right = self.read_node(right_at)?;
                right.children[right.n + 1] = right.children[right.n];
                let mut j = right.n;
                while j > 0 {
                    right.records[j] = right.records[j - 1];
                    right.children[j] = right.children[j - 1];
                    j -= 1;
                }
                right.n += 1;
                right.records[0] = node.records[pivot];
                right.children[0] = left.children[left.n];
                left.n -= 1;
                node.records[pivot] = left.records[left.n];
                self.write_node(left_at, &left)?;
                self.write_node(right_at, &right)?;
                self.write_node(at, &node)?;
                return Ok(Del::Done);
            }
        }

        if slot < n {
            let right_at = node.children[slot + 1];
            let mut right = self.read_node(right_at)?;
            if right.n > MIN_RECORDS {
                let left_at = node.children[slot];
                let mut left = self.read_node(left_at)?;
                left.records[left.n] = node.records[slot];
                left.children[left.n + 1] = right.children[0];
                node.records[slot] = right.records[0];
                left.n += 1;
                right.n -= 1;
                for j in 0..right.n {
                    right.records[j] = right.records[j + 1];
                    right.children[j] = right.children[j + 1];
                }
                right.children[right.n] = right.children[right.n + 1];
                self.write_node(left_at, &left)?;
                self.write_node(right_at, &right)?;
                self.write_node(at, &node)?;
                return Ok(Del::Done);
            }
        }

        // Merge the underflowed child with a sibling plus the pivot record.
        let pivot = if slot == n { slot - 1 } else { slot };
        let left_at = node.children[pivot];
        let right_at = node.children[pivot + 1];
        let mut left = self.read_node(left_at)?;
        let right = self.read_node(right_at)?;
        left.records[left.n] = node.records[pivot];
        left.children[left.n + 1] = right.children[0];
        for j in 0..right.n {
            left.records[left.n + 1 + j] = right.records[j];
            left.children[left.n + 2 + j] = right.children[j + 1];
        }
        left.n += 1 + right.n;
        self.free_node(right_at)?;
        for j in slot + 1..n {
            node.records[j - 1] = node.records[j];
            node.children[j] = node.children[j + 1];
        }
        node.n -= 1;
        self.write_node(left_at, &left)?;
        self.write_node(at, &node)?;
        Ok(if node.n >= min { Del::Done } else { Del::Underflow })
    }

    /// Point lookup by value.
    pub fn search(&self, value: i64) -> Result<bool> {
        let mut at = self.root()?;
        while at != NIL {
            let node = self.read_node(at)?;
            let slot = node.search_slot(value);
            if slot < node.n && node.records[slot].value == value {
                return Ok(true);
            }
            at = node.children[slot];
        }
        Ok(false)
    }

    /// Number of live records, via a depth-first traversal.
    pub fn count(&self) -> Result<u64> {
        let root = self.root()?;
        self.count_from(root)
    }

    fn count_from(&self, at: PageId) -> Result<u64> {
        if at == NIL {
            return Ok(0);
        }
        let node = self.read_node(at)?;
        let mut total = node.n as u64;
        for j in 0..=node.n {
            total += self.count_from(node.children[j])?;
        }
        Ok(total)
    }

    /// First record in natural tree order, re-reading the root through the
    /// node mutex. Migrations call this between successive moves because
    /// both the insert into the destination and the delete from the source
    /// reshape the tree.
    pub fn first_record(&self) -> Result<Option<Record>> {
        let mut inner = self.inner.lock()?;
        if inner.root == NIL {
            return Ok(None);
        }
        let root = inner.root;
        let node = inner.read_node(root)?;
        if node.n == 0 {
            return Ok(None);
        }
        Ok(Some(node.records[0]))
    }

    /// Validates the structural invariants: record-count bounds, ascending
    /// per-node ordering, subtree value bounds, and uniform leaf depth.
    pub fn validate(&self) -> Result<()> {
        let root = self.root()?;
        if root == NIL {
            return Ok(());
        }
        self.validate_node(root, true, i64::MIN, i64::MAX)?;
        Ok(())
    }

    fn validate_node(&self, at: PageId, is_root: bool, lower: i64, upper: i64) -> Result<usize> {
        let node = self.read_node(at)?;
        let min = if is_root { 1 } else { MIN_RECORDS };
        if node.n < min || node.n > MAX_RECORDS {
            return errdata!("node at {at} holds {} records, outside [{min}, {MAX_RECORDS}]", node.n);
        }
        for j in 0..node.n {
            let value = node.records[j].value;
            if value <= lower || value >= upper {
                return errdata!("node at {at} record {value} escapes subtree bounds");
            }
            if j > 0 && node.records[j - 1].value >= value {
                return errdata!("node at {at} records not strictly ascending");
            }
        }
        if node.is_leaf() {
            return Ok(1);
        }
        let mut depth = None;
        for j in 0..=node.n {
            let child_lower = if j == 0 { lower } else { node.records[j - 1].value };
            let child_upper = if j == node.n { upper } else { node.records[j].value };
            let child_depth = self.validate_node(node.children[j], false, child_lower, child_upper)?;
            match depth {
                None => depth = Some(child_depth),
                Some(d) if d != child_depth => {
                    return errdata!("node at {at} has leaves at unequal depths")
                }
                _ => {}
            }
        }
        Ok(depth.unwrap_or(0) + 1)
    }
}

impl Drop for DiskLevel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist tier header");
        }
    }
}
