//! Fixed-capacity buckets and the arena linking them into overflow chains.
//!
//! Buckets reference each other by [BucketId], an index into the arena, never by
//! pointer. A bucket is never removed from the arena, an emptied overflow bucket
//! goes to the free list and its record in the data log is reused.

use crate::{Error, Result};

/// Flag bit set on every bucket chained after a home bucket.
pub(crate) const IS_OVERFLOW: i32 = 1;
/// Index stored in buckets sitting on the free list.
pub(crate) const FREE_INDEX: i32 = -1;
/// Offset stored in both halves of an unused slot.
const EMPTY_SLOT: i64 = -1;

pub(crate) type BucketId = usize;

/// Data log offsets of one entry's key and value blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub key: u64,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Bucket {
    /// Home slot in the directory, or [FREE_INDEX].
    pub index: i32,
    pub flags: i32,
    /// Live slots, packed to the left.
    pub slots: Vec<Slot>,
    pub overflow: Option<BucketId>,
    pub parent: Option<BucketId>,
    /// Position of this bucket's record in the data log.
    pub offset: u64,
    /// Whether the record on disk is stale.
    pub dirty: bool,
}

impl Bucket {
    pub fn new(index: i32, flags: i32, offset: u64, capacity: usize) -> Self {
        Bucket {
            index,
            flags,
            slots: Vec::with_capacity(capacity),
            overflow: None,
            parent: None,
            offset,
            dirty: true,
        }
    }

    /// Size in bytes of a bucket record: `Index`, `Flags`, then `capacity` offset pairs.
    pub fn record_size(capacity: usize) -> usize {
        8 + 16 * capacity
    }

    pub fn is_overflow(&self) -> bool {
        self.flags & IS_OVERFLOW != 0
    }

    pub fn to_bytes(&self, capacity: usize) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(Self::record_size(capacity));
        buffer.extend_from_slice(&self.index.to_le_bytes());
        buffer.extend_from_slice(&self.flags.to_le_bytes());

        for i in 0..capacity {
            let (key, value) = match self.slots.get(i) {
                Some(slot) => (slot.key as i64, slot.value as i64),
                None => (EMPTY_SLOT, EMPTY_SLOT),
            };
            buffer.extend_from_slice(&key.to_le_bytes());
            buffer.extend_from_slice(&value.to_le_bytes());
        }

        buffer
    }

    /// Parse a bucket record read from `offset`. Links are left for the caller to restore.
    pub fn from_bytes(bytes: &[u8], offset: u64, capacity: usize) -> Result<Self> {
        if bytes.len() != Self::record_size(capacity) {
            return Err(Error::CorruptRecord {
                offset,
                reason: "bucket record has the wrong size",
            });
        }

        let mut buf32 = [0_u8; 4];
        let mut buf64 = [0_u8; 8];

        buf32.copy_from_slice(&bytes[0..4]);
        let index = i32::from_le_bytes(buf32);
        buf32.copy_from_slice(&bytes[4..8]);
        let flags = i32::from_le_bytes(buf32);

        let mut bucket = Bucket::new(index, flags, offset, capacity);
        bucket.dirty = false;

        let mut pos = 8;
        for _ in 0..capacity {
            buf64.copy_from_slice(&bytes[pos..(pos + 8)]);
            let key = i64::from_le_bytes(buf64);
            buf64.copy_from_slice(&bytes[(pos + 8)..(pos + 16)]);
            let value = i64::from_le_bytes(buf64);
            pos += 16;

            if key < 0 || value < 0 {
                break;
            }
            bucket.slots.push(Slot {
                key: key as u64,
                value: value as u64,
            });
        }

        Ok(bucket)
    }
}

/// Every bucket of a table, the directory of home buckets, and the free list.
#[derive(Debug)]
pub(crate) struct BucketArena {
    capacity: usize,
    buckets: Vec<Bucket>,
    directory: Vec<BucketId>,
    free: Vec<BucketId>,
}

impl BucketArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buckets: Vec::new(),
            directory: Vec::new(),
            free: Vec::new(),
        }
    }

    // === Getters ===

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, id: BucketId) -> &Bucket {
        &self.buckets[id]
    }

    pub fn get_mut(&mut self, id: BucketId) -> &mut Bucket {
        &mut self.buckets[id]
    }

    pub fn directory(&self) -> &[BucketId] {
        &self.directory
    }

    /// Home bucket of directory slot `slot`.
    pub fn home(&self, slot: usize) -> Result<BucketId> {
        self.directory.get(slot).copied().ok_or_else(|| {
            Error::Consistency(format!(
                "bucket {slot} is outside a directory of {}",
                self.directory.len()
            ))
        })
    }

    /// Home bucket followed by its overflow buckets.
    pub fn chain(&self, home: BucketId) -> Vec<BucketId> {
        let mut chain = vec![home];
        let mut current = self.buckets[home].overflow;

        // Bounded, so a cycle can't hang us before `check` reports it.
        while let Some(id) = current {
            if chain.len() > self.buckets.len() {
                break;
            }
            chain.push(id);
            current = self.buckets[id].overflow;
        }

        chain
    }

    pub fn dirty_buckets(&mut self) -> impl Iterator<Item = &mut Bucket> {
        self.buckets.iter_mut().filter(|b| b.dirty)
    }

    /// Data log offsets of the home buckets, in directory order.
    pub fn home_offsets(&self) -> Vec<u64> {
        self.directory
            .iter()
            .map(|&id| self.buckets[id].offset)
            .collect()
    }

    /// `(home slot, offset)` of every overflow bucket in chain order, then
    /// `(FREE_INDEX, offset)` of every free bucket.
    pub fn chain_entries(&self) -> Vec<(i32, u64)> {
        let overflow = self
            .directory
            .iter()
            .enumerate()
            .flat_map(|(slot, &home)| {
                self.chain(home)
                    .into_iter()
                    .skip(1)
                    .map(move |id| (slot as i32, id))
            });

        overflow
            .chain(self.free.iter().map(|&id| (FREE_INDEX, id)))
            .map(|(index, id)| (index, self.buckets[id].offset))
            .collect()
    }

    // === Public Methods ===

    pub fn insert(&mut self, bucket: Bucket) -> BucketId {
        self.buckets.push(bucket);
        self.buckets.len() - 1
    }

    pub fn push_home(&mut self, id: BucketId) {
        self.directory.push(id);
    }

    pub fn pop_home(&mut self) -> Option<BucketId> {
        self.directory.pop()
    }

    /// Chain `child` directly after `parent`, keeping whatever followed `parent`.
    pub fn link(&mut self, parent: BucketId, child: BucketId) {
        let next = self.buckets[parent].overflow;

        self.buckets[parent].overflow = Some(child);
        self.buckets[child].parent = Some(parent);
        self.buckets[child].overflow = next;

        if let Some(next) = next {
            self.buckets[next].parent = Some(child);
        }
    }

    /// Take `id` out of its chain, joining its neighbours.
    pub fn unlink(&mut self, id: BucketId) {
        let parent = self.buckets[id].parent.take();
        let child = self.buckets[id].overflow.take();

        if let Some(parent) = parent {
            self.buckets[parent].overflow = child;
        }
        if let Some(child) = child {
            self.buckets[child].parent = parent;
        }
    }

    /// Put an unlinked bucket on the free list.
    pub fn recycle(&mut self, id: BucketId) {
        let bucket = &mut self.buckets[id];
        bucket.index = FREE_INDEX;
        bucket.flags = 0;
        bucket.slots.clear();
        bucket.overflow = None;
        bucket.parent = None;
        bucket.dirty = true;

        self.free.push(id);
    }

    /// Reuse a free bucket, if any, for home slot `index`.
    pub fn take_free(&mut self, index: i32, flags: i32) -> Option<BucketId> {
        let id = self.free.pop()?;

        let bucket = &mut self.buckets[id];
        bucket.index = index;
        bucket.flags = flags;
        bucket.dirty = true;

        Some(id)
    }

    pub fn push_free(&mut self, id: BucketId) {
        self.free.push(id);
    }

    /// Total live entries across all chains.
    pub fn entry_count(&self) -> usize {
        self.directory
            .iter()
            .flat_map(|&home| self.chain(home))
            .map(|id| self.buckets[id].slots.len())
            .sum()
    }

    /// Verify the structural invariants of the bucket graph.
    ///
    /// Home buckets carry their directory slot and no overflow flag, overflow
    /// buckets carry the flag and their home's slot, free buckets carry
    /// [FREE_INDEX], and every bucket is reachable exactly once.
    pub fn check(&self, bucket_count: usize, count: usize) -> Result<()> {
        if self.directory.len() != bucket_count {
            return Err(Error::Consistency(format!(
                "directory holds {} buckets, expected {bucket_count}",
                self.directory.len()
            )));
        }

        let mut seen = vec![false; self.buckets.len()];
        let mut total = 0;

        for (slot, &home) in self.directory.iter().enumerate() {
            let bucket = &self.buckets[home];
            if bucket.index != slot as i32 || bucket.is_overflow() || bucket.parent.is_some() {
                return Err(Error::Consistency(format!(
                    "home bucket {slot} records index {} with flags {}",
                    bucket.index, bucket.flags
                )));
            }

            let mut previous = None;
            let mut current = Some(home);
            while let Some(id) = current {
                if seen[id] {
                    return Err(Error::Consistency(format!(
                        "bucket record {id} is reachable twice"
                    )));
                }
                seen[id] = true;

                let bucket = &self.buckets[id];
                if previous.is_some()
                    && (!bucket.is_overflow()
                        || bucket.index != slot as i32
                        || bucket.parent != previous)
                {
                    return Err(Error::Consistency(format!(
                        "overflow bucket {id} of home {slot} records index {} with flags {}",
                        bucket.index, bucket.flags
                    )));
                }
                if bucket.slots.len() > self.capacity {
                    return Err(Error::Consistency(format!(
                        "bucket record {id} holds {} slots",
                        bucket.slots.len()
                    )));
                }

                total += bucket.slots.len();
                previous = Some(id);
                current = bucket.overflow;
            }
        }

        for &id in &self.free {
            if seen[id] || self.buckets[id].index != FREE_INDEX {
                return Err(Error::Consistency(format!(
                    "free bucket {id} records index {}",
                    self.buckets[id].index
                )));
            }
            seen[id] = true;
        }

        if let Some(id) = seen.iter().position(|seen| !seen) {
            return Err(Error::Consistency(format!(
                "bucket record {id} is neither chained nor free"
            )));
        }

        if total != count {
            return Err(Error::Consistency(format!(
                "buckets hold {total} entries, expected {count}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn slot(n: u64) -> Slot {
        Slot {
            key: n,
            value: n + 1,
        }
    }

    /// Two home buckets, the first with one overflow bucket.
    fn arena() -> BucketArena {
        let mut arena = BucketArena::new(2);

        for index in 0..2 {
            let id = arena.insert(Bucket::new(index, 0, index as u64 * 100, 2));
            arena.push_home(id);
        }
        let overflow = arena.insert(Bucket::new(0, IS_OVERFLOW, 200, 2));
        arena.link(0, overflow);

        arena.get_mut(0).slots = vec![slot(0), slot(2)];
        arena.get_mut(overflow).slots = vec![slot(4)];
        arena.get_mut(1).slots = vec![slot(6)];

        arena
    }

    #[test]
    fn record_layout() {
        let mut bucket = Bucket::new(3, IS_OVERFLOW, 64, 2);
        bucket.slots.push(slot(10));

        let bytes = bucket.to_bytes(2);

        assert_eq!(bytes.len(), Bucket::record_size(2));
        assert_eq!(&bytes[0..4], &3_i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1_i32.to_le_bytes());
        assert_eq!(&bytes[8..16], &10_i64.to_le_bytes());
        assert_eq!(&bytes[24..32], &(-1_i64).to_le_bytes());

        let parsed = Bucket::from_bytes(&bytes, 64, 2).unwrap();
        assert_eq!(parsed.index, 3);
        assert!(parsed.is_overflow());
        assert_eq!(parsed.slots, vec![slot(10)]);
        assert!(!parsed.dirty);
    }

    #[test]
    fn short_record_is_corrupt() {
        assert!(matches!(
            Bucket::from_bytes(&[0; 12], 8, 2),
            Err(Error::CorruptRecord { offset: 8, .. })
        ));
    }

    #[test]
    fn chains_and_offsets() {
        let arena = arena();

        assert_eq!(arena.chain(0), vec![0, 2]);
        assert_eq!(arena.home_offsets(), vec![0, 100]);
        assert_eq!(arena.chain_entries(), vec![(0, 200)]);
        assert_eq!(arena.entry_count(), 4);
        arena.check(2, 4).unwrap();
    }

    #[test]
    fn recycled_overflow_bucket_is_reused() {
        let mut arena = arena();

        arena.unlink(2);
        arena.recycle(2);

        assert_eq!(arena.chain(0), vec![0]);
        assert_eq!(arena.chain_entries(), vec![(FREE_INDEX, 200)]);
        arena.check(2, 3).unwrap();

        let reused = arena.take_free(1, IS_OVERFLOW).unwrap();
        arena.link(1, reused);

        assert_eq!(reused, 2);
        assert_eq!(arena.chain(1), vec![1, 2]);
        arena.check(2, 3).unwrap();
    }

    #[test]
    fn check_rejects_wrong_home_index() {
        let mut arena = arena();
        arena.get_mut(1).index = 0;

        assert!(matches!(arena.check(2, 4), Err(Error::Consistency(_))));
    }

    #[test]
    fn check_rejects_overflow_without_flag() {
        let mut arena = arena();
        arena.get_mut(2).flags = 0;

        assert!(matches!(arena.check(2, 4), Err(Error::Consistency(_))));
    }

    #[test]
    fn check_rejects_orphans_and_bad_free_buckets() {
        let mut arena = arena();
        arena.unlink(2);

        assert!(matches!(arena.check(2, 3), Err(Error::Consistency(_))));

        arena.push_free(2);
        assert!(matches!(arena.check(2, 3), Err(Error::Consistency(_))));

        arena.get_mut(2).index = FREE_INDEX;
        arena.get_mut(2).slots.clear();
        arena.check(2, 3).unwrap();
    }
}
