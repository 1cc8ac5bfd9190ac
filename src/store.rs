//! Storage strategy behind a [crate::HashTable].
//!
//! The table owns the linear hashing decisions (which bucket, when to grow or
//! shrink). A store owns the buckets themselves and how they are kept.

use crate::codec::{Encoding, TableKey};
use crate::state::TableState;
use crate::Result;

/// Bucket storage for keys of type `K` and values of type `V`.
///
/// Every method receives the table's [TableState] so counters stay in one
/// place, borrowed exclusively for mutating calls.
pub trait Store<K: TableKey, V: Encoding> {
    /// Number of home buckets currently in the directory.
    fn bucket_count(&self) -> usize;

    /// Look `key` up in home bucket `bucket` and its overflow chain.
    fn get(&mut self, bucket: usize, key: &K) -> Result<Option<V>>;

    /// Insert or overwrite `key` in home bucket `bucket`.
    ///
    /// Updates `state.count` for new keys and `state.fragmentations` for overwrites
    /// that leave garbage behind.
    fn set(&mut self, state: &mut TableState, bucket: usize, key: &K, value: &V) -> Result<()>;

    /// Remove `key` from home bucket `bucket`, returning `false` if it wasn't there.
    fn remove(&mut self, state: &mut TableState, bucket: usize, key: &K) -> Result<bool>;

    /// Append a new home bucket and move into it every entry of bucket `from`
    /// for which `relocate` returns `true`.
    fn split(&mut self, state: &TableState, from: usize, relocate: &dyn Fn(&K) -> bool)
        -> Result<()>;

    /// Drop the last home bucket, reinserting each of its entries into `home_of(key)`.
    ///
    /// `state` already describes the directory without the dropped bucket.
    fn merge(&mut self, state: &TableState, home_of: &dyn Fn(&K) -> usize) -> Result<()>;

    /// Verify the structural invariants of the bucket graph against `state`.
    fn check(&self, state: &TableState) -> Result<()>;

    /// Rewrite storage without garbage. Stores that never fragment do nothing.
    fn compact(&mut self, _state: &mut TableState) -> Result<()> {
        Ok(())
    }

    /// Persist everything mutated since the last flush.
    fn flush(&mut self, state: &TableState) -> Result<()>;

    /// Length in bytes of the backing data log, if there is one.
    fn data_len(&self) -> Option<u64> {
        None
    }
}
