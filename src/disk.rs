//! Disk-backed store: buckets and blobs in an append-only data log, the bucket
//! directory in a separately committed index file.

mod bucket;
mod compaction;
mod data_log;
mod index;

use std::collections::HashSet;
use std::fs::{self, File, TryLockError};
use std::iter;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::codec::{Encoding, TableKey};
use crate::state::TableState;
use crate::store::Store;
use crate::table::config::Config;
use crate::{Error, Result};

use bucket::{Bucket, BucketArena, BucketId, Slot, FREE_INDEX, IS_OVERFLOW};
use data_log::DataLog;
use index::{IndexFile, IndexRecord, UndoRecord};

/// Take an exclusive OS lock on `file`, failing fast if another handle holds it.
pub(crate) fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    match file.try_lock() {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => Err(Error::Locked(path.to_path_buf())),
        Err(TryLockError::Error(error)) => Err(error.into()),
    }
}

/// The files of one table, all named after the same base path.
#[derive(Debug, Clone)]
pub(crate) struct TablePaths {
    pub data: PathBuf,
    pub index: PathBuf,
    pub backup: PathBuf,
    pub compact: PathBuf,
    pub pending_index: PathBuf,
}

impl TablePaths {
    pub fn new(base: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut path = base.as_os_str().to_owned();
            path.push(suffix);
            PathBuf::from(path)
        };

        Self {
            data: with_suffix(".htdata"),
            index: with_suffix(".htindex"),
            backup: with_suffix(".htindex-bak"),
            compact: with_suffix(".htdata-compact"),
            pending_index: with_suffix(".htindex-compact"),
        }
    }
}

/// Store keeping buckets and entries in files next to a base path.
///
/// Every bucket ever allocated stays cached in memory, only key and value
/// blobs are read from disk on demand.
#[derive(Debug)]
pub struct DiskStore<K, V> {
    paths: TablePaths,
    data: DataLog,
    index: IndexFile,
    arena: BucketArena,
    compaction_threshold: u32,
    verify_structure: bool,
    /// Whether the index record differs from the committed one.
    index_dirty: bool,
    /// Data log length at the last commit. Only bucket records below it can
    /// be referenced by the committed index.
    committed_len: u64,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: TableKey, V: Encoding> DiskStore<K, V> {
    /// Open the table at `base`, creating its files if needed.
    pub(crate) fn open(base: &Path, config: &Config) -> Result<(Self, TableState)> {
        let paths = TablePaths::new(base);

        let mut data = DataLog::open(&paths.data, config.cache_size)?;
        let mut index = IndexFile::open(&paths.index, &paths.backup)?;

        // Still there means the rename never happened and the old log is live.
        if paths.compact.exists() {
            warn!(path = ?paths.compact, "Removing data log left by an interrupted compaction");
            fs::remove_file(&paths.compact)?;

            if paths.pending_index.exists() {
                fs::remove_file(&paths.pending_index)?;
            }
        }

        index.recover(&mut data)?;

        if let Some(record) = index::read_pending(&paths.pending_index)? {
            warn!(
                path = ?paths.pending_index,
                "Committing the index of a compacted log renamed into place"
            );
            index.commit(&record)?;
            fs::remove_file(&paths.pending_index)?;
        }

        let record = index.read()?;
        let committed_len = data.len();

        let mut store = Self {
            paths,
            data,
            index,
            arena: BucketArena::new(config.bucket_capacity),
            compaction_threshold: config.compaction_threshold,
            verify_structure: config.verify_structure,
            index_dirty: false,
            committed_len,
            _marker: PhantomData,
        };

        let state = match record {
            Some(record) => store.load(record, config)?,
            None => store.initialize(config)?,
        };

        info!(
            path = ?store.paths.data,
            entries = state.count,
            buckets = state.bucket_count(),
            "Opened table"
        );

        Ok((store, state))
    }

    fn initialize(&mut self, config: &Config) -> Result<TableState> {
        if self.data.len() > 0 {
            warn!(
                path = ?self.paths.data,
                len = self.data.len(),
                "Data log of a never committed table is not empty, its contents are unreachable"
            );
        }

        for index in 0..config.min_bucket_count {
            let id = self.allocate(to_i32(index)?, 0)?;
            self.arena.push_home(id);
        }

        let state = TableState::new(config.min_bucket_count, config.bucket_capacity);

        self.index_dirty = true;
        self.persist(&state)?;

        Ok(state)
    }

    /// Rebuild the arena from a committed index record.
    ///
    /// The record is the authority on which bucket plays which role, a bucket
    /// record disagreeing with it is corruption.
    fn load(&mut self, record: IndexRecord, config: &Config) -> Result<TableState> {
        let capacity = record.bucket_capacity as usize;
        if capacity != config.bucket_capacity {
            warn!(
                stored = capacity,
                configured = config.bucket_capacity,
                "Using the bucket capacity the table was created with"
            );
        }

        let (n, p) = (record.n as usize, record.p as usize);
        if !n.is_power_of_two() || p >= n || record.bucket_offsets.len() != n + p {
            return Err(Error::Corrupt(format!(
                "index lists {} home buckets for n {n} and p {p}",
                record.bucket_offsets.len()
            )));
        }

        self.arena = BucketArena::new(capacity);
        let mut seen = HashSet::new();

        for (slot, &offset) in record.bucket_offsets.iter().enumerate() {
            let id = self.read_bucket(offset, to_i32(slot)?, 0, &mut seen)?;
            self.arena.push_home(id);
        }

        let mut tails = self.arena.directory().to_vec();
        for &(home, offset) in &record.chain_offsets {
            if home == FREE_INDEX {
                let id = self.read_bucket(offset, FREE_INDEX, 0, &mut seen)?;
                self.arena.push_free(id);
                continue;
            }

            let tail = usize::try_from(home)
                .ok()
                .and_then(|slot| tails.get_mut(slot))
                .ok_or_else(|| {
                    Error::Corrupt(format!("overflow bucket at {offset} names home {home}"))
                })?;

            let id = self.read_bucket(offset, home, IS_OVERFLOW, &mut seen)?;
            self.arena.link(*tail, id);
            *tail = id;
        }

        let mut state = TableState {
            n,
            p,
            capacity,
            count: record.count as usize,
            fragmentations: record.fragmentations as u32,
        };

        let count = self.arena.entry_count();
        if count != state.count {
            warn!(
                stored = state.count,
                count, "Index entry count disagrees with bucket contents"
            );
            state.count = count;
            self.index_dirty = true;
        }

        self.arena
            .check(state.bucket_count(), state.count)
            .map_err(|error| Error::Corrupt(error.to_string()))?;

        Ok(state)
    }

    /// Read the bucket record at `offset`, expected to carry `index` and `flags`.
    fn read_bucket(
        &mut self,
        offset: i64,
        index: i32,
        flags: i32,
        seen: &mut HashSet<u64>,
    ) -> Result<BucketId> {
        let offset = u64::try_from(offset)
            .map_err(|_| Error::Corrupt(format!("negative bucket offset {offset}")))?;
        if !seen.insert(offset) {
            return Err(Error::Corrupt(format!(
                "bucket offset {offset} is listed twice"
            )));
        }

        let capacity = self.arena.capacity();
        let bucket = self
            .data
            .read_at(offset, Bucket::record_size(capacity))
            .and_then(|bytes| Bucket::from_bytes(&bytes, offset, capacity))
            .map_err(|error| match error {
                Error::CorruptRecord { offset, reason } => {
                    Error::Corrupt(format!("bucket record at {offset}: {reason}"))
                }
                error => error,
            })?;

        if bucket.index != index || bucket.flags != flags {
            return Err(Error::Corrupt(format!(
                "bucket record at {offset} holds index {} and flags {}, expected {index} and {flags}",
                bucket.index, bucket.flags
            )));
        }
        if index == FREE_INDEX && !bucket.slots.is_empty() {
            return Err(Error::Corrupt(format!(
                "free bucket record at {offset} holds entries"
            )));
        }

        Ok(self.arena.insert(bucket))
    }

    // === Private Methods ===

    /// A bucket for home slot `index`, reused from the free list or appended to the data log.
    fn allocate(&mut self, index: i32, flags: i32) -> Result<BucketId> {
        if let Some(id) = self.arena.take_free(index, flags) {
            return Ok(id);
        }

        let capacity = self.arena.capacity();
        let mut bucket = Bucket::new(index, flags, 0, capacity);
        bucket.offset = self.data.append_raw(&bucket.to_bytes(capacity))?;
        bucket.dirty = false;

        Ok(self.arena.insert(bucket))
    }

    fn read_key(&mut self, offset: u64) -> Result<K> {
        let blob = self.data.read_blob(offset)?;
        Ok(K::decode(&blob)?)
    }

    fn read_value(&mut self, offset: u64) -> Result<V> {
        let blob = self.data.read_blob(offset)?;
        Ok(V::decode(&blob)?)
    }

    fn append_encoded<T: Encoding>(&mut self, item: &T) -> Result<u64> {
        let mut buffer = Vec::new();
        item.encode(&mut buffer)?;

        self.data.append_blob(&buffer)
    }

    /// Bucket and slot position of `key` in the chain of home slot `slot`.
    fn find(&mut self, slot: usize, key: &K) -> Result<Option<(BucketId, usize)>> {
        for id in self.arena.chain(self.arena.home(slot)?) {
            for position in 0..self.arena.get(id).slots.len() {
                let offset = self.arena.get(id).slots[position].key;

                if self.read_key(offset)? == *key {
                    return Ok(Some((id, position)));
                }
            }
        }

        Ok(None)
    }

    /// Put `entry` in the first bucket of the chain with room, growing the
    /// chain if it is full. Returns whether a bucket was allocated.
    fn append_slot(&mut self, slot: usize, entry: Slot) -> Result<bool> {
        let home = self.arena.home(slot)?;
        let chain = self.arena.chain(home);
        let capacity = self.arena.capacity();

        let (target, allocated) = match chain
            .iter()
            .copied()
            .find(|&id| self.arena.get(id).slots.len() < capacity)
        {
            Some(id) => (id, false),
            None => {
                let tail = chain.last().copied().unwrap_or(home);
                let id = self.allocate(to_i32(slot)?, IS_OVERFLOW)?;

                self.arena.link(tail, id);
                self.index_dirty = true;

                (id, true)
            }
        };

        let bucket = self.arena.get_mut(target);
        bucket.slots.push(entry);
        bucket.dirty = true;

        Ok(allocated)
    }

    /// Remove one slot, recycling its bucket if it was an overflow bucket
    /// left empty. Returns whether a bucket was recycled.
    fn remove_slot(&mut self, id: BucketId, position: usize) -> bool {
        let bucket = self.arena.get_mut(id);
        bucket.slots.remove(position);
        bucket.dirty = true;

        if bucket.slots.is_empty() && bucket.is_overflow() {
            self.arena.unlink(id);
            self.arena.recycle(id);
            self.index_dirty = true;

            return true;
        }

        false
    }

    /// Pack the entries of a chain towards its home bucket and recycle the
    /// overflow buckets left empty.
    fn refill(&mut self, home: BucketId) {
        let chain = self.arena.chain(home);
        let capacity = self.arena.capacity();

        let entries: Vec<Slot> = chain
            .iter()
            .flat_map(|&id| self.arena.get(id).slots.clone())
            .collect();
        let mut chunks = entries.chunks(capacity);

        for &id in &chain {
            let slots = chunks.next().map(<[Slot]>::to_vec).unwrap_or_default();

            let bucket = self.arena.get_mut(id);
            if bucket.slots != slots {
                bucket.slots = slots;
                bucket.dirty = true;
            }
        }

        for &id in chain.iter().skip(1).rev() {
            if self.arena.get(id).slots.is_empty() {
                self.arena.unlink(id);
                self.arena.recycle(id);
                self.index_dirty = true;
            }
        }
    }

    /// Unlink and recycle every bucket of the chain starting at `home`.
    fn recycle_chain(&mut self, home: BucketId) {
        for id in self.arena.chain(home).into_iter().rev() {
            self.arena.unlink(id);
            self.arena.recycle(id);
        }
        self.index_dirty = true;
    }

    fn verify(&self, bucket_count: usize, count: usize) -> Result<()> {
        if self.verify_structure {
            self.arena.check(bucket_count, count)?;
        }

        Ok(())
    }

    /// Committed images of the dirty bucket records a flush will overwrite.
    ///
    /// Records appended since the last commit are not referenced by the
    /// committed index and need none.
    fn undo_images(&mut self) -> Result<Vec<UndoRecord>> {
        let committed_len = self.committed_len;
        let size = Bucket::record_size(self.arena.capacity());

        let offsets: Vec<u64> = self
            .arena
            .dirty_buckets()
            .map(|bucket| bucket.offset)
            .filter(|&offset| offset < committed_len)
            .collect();

        offsets
            .into_iter()
            .map(|offset| {
                Ok(UndoRecord {
                    offset,
                    bytes: self.data.read_at(offset, size)?,
                })
            })
            .collect()
    }

    fn write_buckets(&mut self) -> Result<()> {
        let capacity = self.arena.capacity();

        for bucket in self.arena.dirty_buckets() {
            self.data.write_at(bucket.offset, &bucket.to_bytes(capacity))?;
            bucket.dirty = false;
        }

        Ok(())
    }

    /// Commit dirty buckets and the index as one step.
    ///
    /// The backup is stamped before the first bucket record is overwritten,
    /// so a crash at any point reopens at either this commit or the last one.
    fn persist(&mut self, state: &TableState) -> Result<()> {
        if !self.index_dirty && self.arena.dirty_buckets().next().is_none() {
            return self.data.sync();
        }

        let record = index_record(&self.arena, state)?;
        let undo = self.undo_images()?;

        self.index.backup(&undo)?;
        self.write_buckets()?;
        self.data.sync()?;
        self.index.publish(&record)?;

        self.committed_len = self.data.len();
        self.index_dirty = false;

        debug!(
            entries = state.count,
            buckets = state.bucket_count(),
            rewritten = undo.len(),
            "Committed table index"
        );

        Ok(())
    }
}

impl<K: TableKey, V: Encoding> Store<K, V> for DiskStore<K, V> {
    fn bucket_count(&self) -> usize {
        self.arena.directory().len()
    }

    fn get(&mut self, bucket: usize, key: &K) -> Result<Option<V>> {
        match self.find(bucket, key)? {
            Some((id, position)) => {
                let offset = self.arena.get(id).slots[position].value;
                self.read_value(offset).map(Some)
            }
            None => Ok(None),
        }
    }

    fn set(&mut self, state: &mut TableState, bucket: usize, key: &K, value: &V) -> Result<()> {
        match self.find(bucket, key)? {
            Some((id, position)) => {
                let offset = self.append_encoded(value)?;

                let bucket = self.arena.get_mut(id);
                bucket.slots[position].value = offset;
                bucket.dirty = true;

                state.fragmentations = state.fragmentations.saturating_add(1);
                self.index_dirty = true;

                if state.fragmentations >= self.compaction_threshold {
                    self.compact_log(state)?;
                }
            }
            None => {
                let entry = Slot {
                    key: self.append_encoded(key)?,
                    value: self.append_encoded(value)?,
                };
                let allocated = self.append_slot(bucket, entry)?;

                state.count += 1;
                self.index_dirty = true;

                if allocated {
                    self.verify(state.bucket_count(), state.count)?;
                }
            }
        }

        Ok(())
    }

    fn remove(&mut self, state: &mut TableState, bucket: usize, key: &K) -> Result<bool> {
        let Some((id, position)) = self.find(bucket, key)? else {
            return Ok(false);
        };

        let recycled = self.remove_slot(id, position);
        state.count -= 1;
        self.index_dirty = true;

        if recycled {
            self.verify(state.bucket_count(), state.count)?;
        }

        Ok(true)
    }

    fn split(
        &mut self,
        state: &TableState,
        from: usize,
        relocate: &dyn Fn(&K) -> bool,
    ) -> Result<()> {
        let (_, new_index) = state.split_target();
        if new_index != self.arena.directory().len() {
            return Err(Error::Consistency(format!(
                "splitting into bucket {new_index} of a directory holding {}",
                self.arena.directory().len()
            )));
        }

        let home = self.arena.home(from)?;
        let chain = self.arena.chain(home);

        let mut kept = Vec::with_capacity(chain.len());
        let mut moved = Vec::new();
        for &id in &chain {
            let mut stayed = Vec::new();

            for entry in self.arena.get(id).slots.clone() {
                if relocate(&self.read_key(entry.key)?) {
                    moved.push(entry);
                } else {
                    stayed.push(entry);
                }
            }
            kept.push(stayed);
        }

        // Every fallible step happens before the directory or the old chain changes.
        let capacity = self.arena.capacity();
        let index = to_i32(new_index)?;
        let mut new_chain = Vec::new();

        for flags in iter::once(0)
            .chain(iter::repeat(IS_OVERFLOW))
            .take(moved.len().div_ceil(capacity).max(1))
        {
            match self.allocate(index, flags) {
                Ok(id) => new_chain.push(id),
                Err(error) => {
                    for &id in new_chain.iter().rev() {
                        self.arena.recycle(id);
                    }
                    self.index_dirty = true;

                    return Err(error);
                }
            }
        }

        for pair in new_chain.windows(2) {
            self.arena.link(pair[0], pair[1]);
        }
        for (&id, entries) in new_chain.iter().zip(moved.chunks(capacity)) {
            let bucket = self.arena.get_mut(id);
            bucket.slots = entries.to_vec();
            bucket.dirty = true;
        }
        self.arena.push_home(new_chain[0]);

        for (&id, stayed) in chain.iter().zip(kept) {
            let bucket = self.arena.get_mut(id);
            if bucket.slots != stayed {
                bucket.slots = stayed;
                bucket.dirty = true;
            }
        }
        self.refill(home);

        self.index_dirty = true;

        let mut grown = *state;
        grown.advance();
        self.verify(grown.bucket_count(), grown.count)
    }

    fn merge(&mut self, state: &TableState, home_of: &dyn Fn(&K) -> usize) -> Result<()> {
        let last = *self
            .arena
            .directory()
            .last()
            .ok_or_else(|| Error::Consistency("merge on an empty directory".into()))?;
        let chain = self.arena.chain(last);

        let mut entries = Vec::new();
        for &id in &chain {
            for entry in self.arena.get(id).slots.clone() {
                let key = self.read_key(entry.key)?;
                entries.push((home_of(&key), entry));
            }
        }

        self.arena.pop_home();
        if self.arena.directory().len() != state.bucket_count() {
            return Err(Error::Consistency(format!(
                "merge left {} buckets, expected {}",
                self.arena.directory().len(),
                state.bucket_count()
            )));
        }

        self.recycle_chain(last);

        for (slot, entry) in entries {
            self.append_slot(slot, entry)?;
        }

        self.index_dirty = true;

        self.verify(state.bucket_count(), state.count)
    }

    fn check(&self, state: &TableState) -> Result<()> {
        self.arena.check(state.bucket_count(), state.count)
    }

    fn compact(&mut self, state: &mut TableState) -> Result<()> {
        self.compact_log(state)
    }

    fn flush(&mut self, state: &TableState) -> Result<()> {
        self.persist(state)
    }

    fn data_len(&self) -> Option<u64> {
        Some(self.data.len())
    }
}

/// The index record describing `arena` and `state`.
fn index_record(arena: &BucketArena, state: &TableState) -> Result<IndexRecord> {
    Ok(IndexRecord {
        count: to_i32(state.count)?,
        p: to_i32(state.p)?,
        n: to_i32(state.n)?,
        bucket_capacity: to_i32(state.capacity)?,
        bucket_offsets: arena
            .home_offsets()
            .into_iter()
            .map(|offset| offset as i64)
            .collect(),
        fragmentations: i32::try_from(state.fragmentations).unwrap_or(i32::MAX),
        chain_offsets: arena
            .chain_entries()
            .into_iter()
            .map(|(home, offset)| (home, offset as i64))
            .collect(),
    })
}

fn to_i32(value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::Consistency(format!("{value} does not fit the index record")))
}

/// Where a simulated crash stops a flush.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashPoint {
    /// Backup stamped, no bucket record rewritten yet.
    AfterBackup,
    /// Bucket records rewritten and synced, live index untouched.
    AfterBuckets,
    /// Live index half overwritten.
    TornIndex,
}

#[cfg(test)]
impl<K: TableKey, V: Encoding> DiskStore<K, V> {
    /// Run a flush up to `crash`, then stop as if the process died.
    pub(crate) fn interrupt_flush(&mut self, state: &TableState, crash: CrashPoint) -> Result<()> {
        let record = index_record(&self.arena, state)?;
        let undo = self.undo_images()?;

        self.index.backup(&undo)?;
        if crash == CrashPoint::AfterBackup {
            return Ok(());
        }

        self.write_buckets()?;
        self.data.sync()?;
        if crash == CrashPoint::TornIndex {
            self.index.publish_torn(&record)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::{Seek, SeekFrom, Write};

    use super::*;

    fn config(bucket_capacity: usize) -> Config {
        Config {
            bucket_capacity,
            ..Default::default()
        }
    }

    fn open(dir: &tempfile::TempDir, capacity: usize) -> (DiskStore<i32, String>, TableState) {
        DiskStore::open(&dir.path().join("t"), &config(capacity)).unwrap()
    }

    fn chain_len(store: &DiskStore<i32, String>, slot: usize) -> usize {
        store.arena.chain(store.arena.home(slot).unwrap()).len()
    }

    #[test]
    fn new_table_is_committed_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (store, state) = open(&dir, 5);

        assert_eq!(state.bucket_count(), 32);
        assert_eq!(Store::<i32, String>::bucket_count(&store), 32);
        assert_eq!(store.data.len(), 32 * Bucket::record_size(5) as u64);
        drop(store);

        let paths = TablePaths::new(&dir.path().join("t"));
        assert!(fs::metadata(&paths.index).unwrap().len() > 0);
        assert_eq!(fs::metadata(&paths.backup).unwrap().len(), 0);

        let (_, reopened) = open(&dir, 5);
        assert_eq!(reopened, state);
    }

    #[test]
    fn overflow_chain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, mut state) = open(&dir, 2);

        for key in [0, 32, 64, 96, 128] {
            store.set(&mut state, 0, &key, &key.to_string()).unwrap();
        }
        assert_eq!(chain_len(&store, 0), 3);
        store.flush(&state).unwrap();
        drop(store);

        let (mut store, reopened) = open(&dir, 2);
        assert_eq!(reopened, state);
        assert_eq!(chain_len(&store, 0), 3);
        for key in [0, 32, 64, 96, 128] {
            assert_eq!(store.get(0, &key).unwrap(), Some(key.to_string()));
        }
        store.check(&reopened).unwrap();
    }

    #[test]
    fn stored_capacity_wins_over_config() {
        let dir = tempfile::tempdir().unwrap();
        drop(open(&dir, 2));

        let (_, state) = open(&dir, 5);
        assert_eq!(state.capacity, 2);
    }

    #[test]
    fn emptied_overflow_bucket_is_recycled_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, mut state) = open(&dir, 2);

        for key in [0, 32, 64] {
            store.set(&mut state, 0, &key, &String::new()).unwrap();
        }
        let overflow = store.arena.chain(store.arena.home(0).unwrap())[1];
        let offset = store.arena.get(overflow).offset;

        assert!(store.remove(&mut state, 0, &64).unwrap());
        assert!(!store.remove(&mut state, 0, &64).unwrap());
        assert_eq!(chain_len(&store, 0), 1);
        assert_eq!(store.arena.chain_entries(), vec![(FREE_INDEX, offset)]);

        store.set(&mut state, 5, &5, &String::new()).unwrap();
        store.set(&mut state, 5, &37, &String::new()).unwrap();
        store.set(&mut state, 5, &69, &String::new()).unwrap();

        assert_eq!(store.arena.chain_entries(), vec![(5, offset)]);
        assert_eq!(state.count, 5);
        store.check(&state).unwrap();
    }

    #[test]
    fn overwrite_appends_value_and_counts_fragmentation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, mut state) = open(&dir, 5);

        store.set(&mut state, 1, &1, &"a".to_string()).unwrap();
        let len = store.data.len();
        store.set(&mut state, 1, &1, &"b".to_string()).unwrap();

        assert_eq!(state.count, 1);
        assert_eq!(state.fragmentations, 1);
        assert_eq!(store.data.len(), len + 5);

        store.flush(&state).unwrap();
        drop(store);

        let (mut store, reopened) = open(&dir, 5);
        assert_eq!(reopened.fragmentations, 1);
        assert_eq!(store.get(1, &1).unwrap(), Some("b".to_string()));
    }

    #[test]
    fn split_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, mut state) = open(&dir, 2);

        for key in [0, 32, 64, 96] {
            store.set(&mut state, 0, &key, &key.to_string()).unwrap();
        }

        store
            .split(&state, 0, &|key: &i32| state.relocates(key.table_hash()))
            .unwrap();
        state.advance();

        assert_eq!(Store::<i32, String>::bucket_count(&store), 33);
        assert_eq!(store.get(0, &0).unwrap(), Some("0".into()));
        assert_eq!(store.get(0, &64).unwrap(), Some("64".into()));
        assert_eq!(store.get(32, &32).unwrap(), Some("32".into()));
        assert_eq!(store.get(32, &96).unwrap(), Some("96".into()));
        assert_eq!(chain_len(&store, 0), 1);
        store.check(&state).unwrap();

        state.retreat();
        let shrunk = state;
        store
            .merge(&state, &|key: &i32| shrunk.home_of(key.table_hash()))
            .unwrap();

        assert_eq!(Store::<i32, String>::bucket_count(&store), 32);
        assert_eq!(store.get(0, &96).unwrap(), Some("96".into()));
        assert_eq!(chain_len(&store, 0), 2);
        store.check(&state).unwrap();
    }

    const CRASH_POINTS: [CrashPoint; 3] = [
        CrashPoint::AfterBackup,
        CrashPoint::AfterBuckets,
        CrashPoint::TornIndex,
    ];

    #[test]
    fn interrupted_recycle_reopens_at_last_commit() {
        for crash in CRASH_POINTS {
            let dir = tempfile::tempdir().unwrap();

            let committed = {
                let (mut store, mut state) = open(&dir, 2);
                for key in [0, 32, 64] {
                    store.set(&mut state, 0, &key, &key.to_string()).unwrap();
                }
                store.flush(&state).unwrap();
                let committed = state;

                // Empties and recycles the overflow bucket.
                store.remove(&mut state, 0, &64).unwrap();
                store.interrupt_flush(&state, crash).unwrap();

                committed
            };

            let (mut store, state) = open(&dir, 2);

            assert_eq!(state, committed, "{crash:?}");
            assert_eq!(chain_len(&store, 0), 2, "{crash:?}");
            for key in [0, 32, 64] {
                assert_eq!(store.get(0, &key).unwrap(), Some(key.to_string()), "{crash:?}");
            }
            store.check(&state).unwrap();
            drop(store);

            let paths = TablePaths::new(&dir.path().join("t"));
            assert_eq!(fs::metadata(&paths.backup).unwrap().len(), 0);
            let (_, reopened) = open(&dir, 2);
            assert_eq!(reopened, committed);
        }
    }

    #[test]
    fn interrupted_split_keeps_committed_entries() {
        for crash in CRASH_POINTS {
            let dir = tempfile::tempdir().unwrap();

            {
                let (mut store, mut state) = open(&dir, 2);
                for key in [0, 32] {
                    store.set(&mut state, 0, &key, &key.to_string()).unwrap();
                }
                store.flush(&state).unwrap();

                store
                    .split(&state, 0, &|key: &i32| state.relocates(key.table_hash()))
                    .unwrap();
                state.advance();
                store.interrupt_flush(&state, crash).unwrap();
            }

            let (mut store, state) = open(&dir, 2);

            assert_eq!(state.bucket_count(), 32, "{crash:?}");
            assert_eq!(state.count, 2, "{crash:?}");
            assert_eq!(store.get(0, &0).unwrap(), Some("0".into()), "{crash:?}");
            assert_eq!(store.get(0, &32).unwrap(), Some("32".into()), "{crash:?}");
            store.check(&state).unwrap();
        }
    }

    #[test]
    fn interrupted_merge_keeps_split_layout() {
        let dir = tempfile::tempdir().unwrap();

        {
            let (mut store, mut state) = open(&dir, 2);
            for key in [0, 32] {
                store.set(&mut state, 0, &key, &key.to_string()).unwrap();
            }
            store
                .split(&state, 0, &|key: &i32| state.relocates(key.table_hash()))
                .unwrap();
            state.advance();
            store.flush(&state).unwrap();

            state.retreat();
            let shrunk = state;
            store
                .merge(&state, &|key: &i32| shrunk.home_of(key.table_hash()))
                .unwrap();
            store.interrupt_flush(&state, CrashPoint::TornIndex).unwrap();
        }

        let (mut store, state) = open(&dir, 2);

        assert_eq!(state.bucket_count(), 33);
        assert_eq!(state.count, 2);
        assert_eq!(store.get(0, &0).unwrap(), Some("0".into()));
        assert_eq!(store.get(32, &32).unwrap(), Some("32".into()));
        store.check(&state).unwrap();
    }

    #[test]
    fn split_into_overflow_chain() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, mut state) = open(&dir, 2);

        for key in [0, 32, 96, 160, 224, 288] {
            store.set(&mut state, 0, &key, &key.to_string()).unwrap();
        }

        store
            .split(&state, 0, &|key: &i32| state.relocates(key.table_hash()))
            .unwrap();
        state.advance();

        assert_eq!(chain_len(&store, 32), 3);
        for key in [32, 96, 160, 224, 288] {
            assert_eq!(store.get(32, &key).unwrap(), Some(key.to_string()));
        }
        assert_eq!(store.get(0, &0).unwrap(), Some("0".into()));
        store.check(&state).unwrap();
    }

    #[test]
    fn failed_split_leaves_table_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, mut state) = open(&dir, 2);

        for key in [0, 32] {
            store.set(&mut state, 0, &key, &key.to_string()).unwrap();
        }
        // Read straight from the record so the key blob never enters the cache.
        let key_offset = store.arena.get(store.arena.home(0).unwrap()).slots[1].key;
        store
            .data
            .write_at(key_offset, &(-1_i32).to_le_bytes())
            .unwrap();

        assert!(store
            .split(&state, 0, &|key: &i32| state.relocates(key.table_hash()))
            .is_err());

        assert_eq!(Store::<i32, String>::bucket_count(&store), 32);
        assert_eq!(chain_len(&store, 0), 1);
        assert_eq!(store.get(0, &0).unwrap(), Some("0".into()));
        store.check(&state).unwrap();
    }

    #[test]
    fn mismatched_bucket_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();

        let offset = {
            let (store, _) = open(&dir, 5);
            store.arena.get(store.arena.home(1).unwrap()).offset
        };

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("t.htdata"))
            .unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&7_i32.to_le_bytes()).unwrap();
        drop(file);

        assert!(matches!(
            DiskStore::<i32, String>::open(&dir.path().join("t"), &config(5)),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn unfinished_compaction_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TablePaths::new(&dir.path().join("t"));

        {
            let (mut store, mut state) = open(&dir, 5);
            store.set(&mut state, 1, &1, &"one".into()).unwrap();
            store.flush(&state).unwrap();
        }
        fs::write(&paths.compact, b"partial").unwrap();
        fs::write(&paths.pending_index, b"partial").unwrap();

        let (mut store, state) = open(&dir, 5);

        assert!(!paths.compact.exists());
        assert!(!paths.pending_index.exists());
        assert_eq!(state.count, 1);
        assert_eq!(store.get(1, &1).unwrap(), Some("one".into()));
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open(&dir, 5);

        assert!(matches!(
            DiskStore::<i32, String>::open(&dir.path().join("t"), &config(5)),
            Err(Error::Locked(_))
        ));
    }
}
