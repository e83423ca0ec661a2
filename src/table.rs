//! The transaction hash table.
//!
//! A fixed power-of-two array of buckets, each owning its linked cells and
//! its own lock. Lookup hashes `(Call-ID, CSeq number)` to a bucket and
//! walks that bucket's cells. Cells never move between buckets; mutations of
//! a bucket's membership are linearized by its lock, and nested code that
//! needs the bucket receives the held [`BucketGuard`] through the call chain
//! rather than re-locking.
//!
//! Slots are stable for a cell's lifetime: a bucket keeps its cells in a
//! small arena with a free list, so an unlink never shifts other cells.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::cell::Cell;
use crate::error::invariant_violation;

/// Stable transaction identity: bucket index plus the per-bucket sequence
/// label assigned at insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId {
    pub hash_index: usize,
    pub label: u32,
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_index, self.label)
    }
}

struct BucketList {
    slots: Vec<Option<Arc<Cell>>>,
    free: Vec<usize>,
    next_label: u32,
    cur_entries: usize,
    acc_entries: u64,
}

/// One hash bucket: its cells and the lock that guards them.
pub struct Bucket {
    list: Mutex<BucketList>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            list: Mutex::new(BucketList {
                slots: Vec::new(),
                free: Vec::new(),
                next_label: 0,
                cur_entries: 0,
                acc_entries: 0,
            }),
        }
    }
}

/// Aggregate table counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Cells currently linked.
    pub current: usize,
    /// Cells ever linked.
    pub accumulated: u64,
}

/// The fixed-size transaction table shared by all workers.
pub struct HashTable {
    buckets: Box<[Bucket]>,
    mask: usize,
    total: AtomicUsize,
}

impl HashTable {
    /// `size` must be a nonzero power of two (validated by the engine
    /// config).
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two() && size > 0);
        let buckets = (0..size).map(|_| Bucket::new()).collect::<Vec<_>>();
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: size - 1,
            total: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Cells currently linked, across all buckets.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Deterministic bucket index for `(Call-ID, CSeq number)`.
    ///
    /// Fixed-order accumulation: the Call-ID bytes first, then the CSeq
    /// number, so swapped inputs do not collide by construction.
    pub fn hash(&self, call_id: &[u8], cseq_num: u32) -> usize {
        let mut h: u64 = 0;
        for &b in call_id {
            h = h.wrapping_mul(31).wrapping_add(b as u64);
        }
        for b in cseq_num.to_be_bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as u64);
        }
        (h as usize) & self.mask
    }

    /// Locks a bucket, blocking until available.
    pub fn lock(&self, hash_index: usize) -> BucketGuard<'_> {
        let bucket = match self.buckets.get(hash_index) {
            Some(b) => b,
            None => invariant_violation("bucket index out of range"),
        };
        BucketGuard {
            hash_index,
            total: &self.total,
            list: bucket.list.lock(),
        }
    }

    /// Snapshot of the table counters. Locks each bucket briefly.
    pub fn stats(&self) -> TableStats {
        let mut stats = TableStats {
            current: 0,
            accumulated: 0,
        };
        for bucket in self.buckets.iter() {
            let list = bucket.list.lock();
            stats.current += list.cur_entries;
            stats.accumulated += list.acc_entries;
        }
        stats
    }
}

/// Outcome of a destruction attempt; see [`BucketGuard::unlink_unreferenced`].
pub enum UnlinkOutcome {
    /// The cell was unlinked; the caller now owns the last table reference.
    Removed(Arc<Cell>),
    /// A holder still references the cell; destruction must be retried.
    StillReferenced,
    /// No cell with that label is linked here.
    NotFound,
}

/// Exclusive access to one bucket while held.
pub struct BucketGuard<'a> {
    hash_index: usize,
    total: &'a AtomicUsize,
    list: MutexGuard<'a, BucketList>,
}

impl BucketGuard<'_> {
    pub fn hash_index(&self) -> usize {
        self.hash_index
    }

    pub fn cur_entries(&self) -> usize {
        self.list.cur_entries
    }

    /// Links a new cell into the bucket. This is the commit point: the
    /// builder receives the assigned identity, and everything fallible must
    /// have succeeded before this call.
    pub fn insert_with(&mut self, build: impl FnOnce(CellId) -> Arc<Cell>) -> Arc<Cell> {
        let label = self.list.next_label;
        self.list.next_label = self.list.next_label.wrapping_add(1);
        let id = CellId {
            hash_index: self.hash_index,
            label,
        };
        let cell = build(id);
        if cell.id() != id {
            invariant_violation("inserted cell does not carry its assigned identity");
        }
        let slot = match self.list.free.pop() {
            Some(slot) => {
                self.list.slots[slot] = Some(cell.clone());
                slot
            }
            None => {
                self.list.slots.push(Some(cell.clone()));
                self.list.slots.len() - 1
            }
        };
        self.list.cur_entries += 1;
        self.list.acc_entries += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id = %id, slot, "transaction linked");
        cell
    }

    /// Iterates the linked cells, oldest slot first.
    pub fn cells(&self) -> impl Iterator<Item = &Arc<Cell>> {
        self.list.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn find(&self, label: u32) -> Option<&Arc<Cell>> {
        self.cells().find(|c| c.id().label == label)
    }

    /// Unlinks the cell with `label` if its reference count is zero.
    ///
    /// The count is re-read under this lock: a holder that attached between
    /// the caller's optimistic decision and this call aborts the unlink.
    pub fn unlink_unreferenced(&mut self, label: u32) -> UnlinkOutcome {
        let slot = self
            .list
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|c| c.id().label == label));
        let Some(slot) = slot else {
            return UnlinkOutcome::NotFound;
        };
        match self.list.slots[slot].as_ref() {
            Some(cell) => {
                if cell.id().hash_index != self.hash_index {
                    invariant_violation("cell linked into foreign bucket");
                }
                if cell.refs() != 0 {
                    return UnlinkOutcome::StillReferenced;
                }
            }
            None => return UnlinkOutcome::NotFound,
        }
        let Some(cell) = self.list.slots[slot].take() else {
            return UnlinkOutcome::NotFound;
        };
        self.list.free.push(slot);
        if self.list.cur_entries == 0 {
            invariant_violation("bucket entry count underflow");
        }
        self.list.cur_entries -= 1;
        self.total.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(id = %cell.id(), "transaction unlinked");
        UnlinkOutcome::Removed(cell)
    }
}
