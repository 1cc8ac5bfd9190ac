//! Data log garbage collection.
//!
//! Overwritten values leave their old blobs behind. Compaction copies the live
//! entries into a fresh log next to the old one, rebuilding every bucket record
//! in directory order. The matching index is made durable in a pending file
//! before the log is renamed into place, so an open after a crash either
//! finds the old log untouched or adopts the pending index.

use std::fs;
use std::num::NonZeroUsize;

use bytes::Bytes;
use tracing::{info, warn};

use super::bucket::{Bucket, BucketArena, BucketId, Slot, IS_OVERFLOW};
use super::data_log::DataLog;
use super::index::{self, IndexRecord};
use super::{index_record, to_i32, DiskStore};
use crate::codec::{Encoding, TableKey};
use crate::state::TableState;
use crate::{Error, Result};

impl<K: TableKey, V: Encoding> DiskStore<K, V> {
    /// Rewrite the data log keeping only live entries.
    ///
    /// An entry whose key or value blob can't be read or decoded is dropped
    /// and logged instead of failing the whole compaction.
    pub(crate) fn compact_log(&mut self, state: &mut TableState) -> Result<()> {
        let before = self.data.len();
        let (record, dropped) = self.replace_log(state)?;

        self.index.commit(&record)?;
        fs::remove_file(&self.paths.pending_index)?;

        self.committed_len = self.data.len();
        self.index_dirty = false;

        info!(
            entries = state.count,
            dropped,
            before,
            after = self.data.len(),
            "Compacted data log"
        );

        Ok(())
    }

    /// Build the compacted log and its pending index, then rename the log
    /// into place. Returns the index still to be committed and the number
    /// of dropped entries.
    pub(super) fn replace_log(&mut self, state: &mut TableState) -> Result<(IndexRecord, usize)> {
        let capacity = self.arena.capacity();

        if self.paths.compact.exists() {
            fs::remove_file(&self.paths.compact)?;
        }
        // Written sequentially and never read back, so no cache to speak of.
        let mut target = DataLog::open(&self.paths.compact, NonZeroUsize::MIN)?;

        let mut arena = BucketArena::new(capacity);
        let mut dropped = 0;

        for slot in 0..self.arena.directory().len() {
            let index = to_i32(slot)?;
            let home = reserve(&mut target, &mut arena, index, 0)?;
            arena.push_home(home);
            let mut tail = home;

            for id in self.arena.chain(self.arena.home(slot)?) {
                for entry in self.arena.get(id).slots.clone() {
                    let (key, value) = match self.live_blobs(entry) {
                        Ok(blobs) => blobs,
                        Err(error @ (Error::CorruptRecord { .. } | Error::Codec(_))) => {
                            warn!(
                                slot,
                                key_offset = entry.key,
                                value_offset = entry.value,
                                %error,
                                "Dropping unreadable record during compaction"
                            );
                            dropped += 1;
                            continue;
                        }
                        Err(error) => return Err(error),
                    };

                    if arena.get(tail).slots.len() == capacity {
                        let overflow = reserve(&mut target, &mut arena, index, IS_OVERFLOW)?;
                        arena.link(tail, overflow);
                        tail = overflow;
                    }

                    let entry = Slot {
                        key: target.append_blob(&key)?,
                        value: target.append_blob(&value)?,
                    };
                    arena.get_mut(tail).slots.push(entry);
                }
            }
        }

        for bucket in arena.dirty_buckets() {
            target.write_at(bucket.offset, &bucket.to_bytes(capacity))?;
            bucket.dirty = false;
        }
        target.sync()?;
        // Release the lock on the new file before it is reopened under the old name.
        drop(target);

        let mut compacted = *state;
        compacted.count -= dropped;
        compacted.fragmentations = 0;

        if self.verify_structure {
            arena.check(compacted.bucket_count(), compacted.count)?;
        }

        let record = index_record(&arena, &compacted)?;
        index::write_pending(&self.paths.pending_index, &record)?;

        self.data.replace_with(&self.paths.compact)?;
        self.arena = arena;
        *state = compacted;

        Ok((record, dropped))
    }

    /// Raw key and value blobs of `entry`, checked to decode.
    fn live_blobs(&mut self, entry: Slot) -> Result<(Bytes, Bytes)> {
        let key = self.data.read_blob(entry.key)?;
        K::decode(&key)?;

        let value = self.data.read_blob(entry.value)?;
        V::decode(&value)?;

        Ok((key, value))
    }
}

/// Append an empty bucket record to `target`, to be filled in once compaction is done.
fn reserve(
    target: &mut DataLog,
    arena: &mut BucketArena,
    index: i32,
    flags: i32,
) -> Result<BucketId> {
    let capacity = arena.capacity();

    let mut bucket = Bucket::new(index, flags, 0, capacity);
    bucket.offset = target.append_raw(&bucket.to_bytes(capacity))?;

    Ok(arena.insert(bucket))
}
