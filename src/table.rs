//! The public hash table.

pub mod config;
pub mod info;

use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, trace, warn};

use crate::codec::{Encoding, TableKey};
use crate::disk::DiskStore;
use crate::memory::MemoryStore;
use crate::state::TableState;
use crate::store::Store;
use crate::{Error, Result};

use config::Config;
use info::Info;

#[cfg(test)]
use crate::disk::CrashPoint;

/// A table persisted to `<base>.htdata`, `<base>.htindex` and `<base>.htindex-bak`.
pub type DiskTable<K, V> = HashTable<K, V, DiskStore<K, V>>;
/// A table that lives only as long as the process.
pub type MemoryTable<K, V> = HashTable<K, V, MemoryStore<K, V>>;

/// Linear hash table mapping keys of type `K` to values of type `V`, kept in a store `S`.
///
/// Every operation takes `&self` and runs under one table-wide lock, so a
/// table can be shared between threads behind an [std::sync::Arc].
///
/// Dropping the table flushes it. Use [HashTable::close] to observe flush errors.
#[derive(Debug)]
pub struct HashTable<K: TableKey, V: Encoding, S: Store<K, V>> {
    inner: Mutex<Inner<S>>,
    config: Config,
    _marker: PhantomData<fn() -> (K, V)>,
}

#[derive(Debug)]
struct Inner<S> {
    state: TableState,
    store: S,
    /// Set once the table was flushed for the last time.
    closed: bool,
}

impl<K: TableKey, V: Encoding> HashTable<K, V, DiskStore<K, V>> {
    /// Open the table stored next to `path`, creating it if it doesn't exist.
    ///
    /// An index interrupted mid-commit is restored from its backup. Fails with
    /// [Error::Corrupt] if neither copy can be trusted, and with [Error::Locked]
    /// if another handle has the table open.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;

        let (store, state) = DiskStore::open(path.as_ref(), &config)?;

        Ok(Self::with_store(store, state, config))
    }
}

impl<K: TableKey + Clone, V: Encoding + Clone> HashTable<K, V, MemoryStore<K, V>> {
    /// Create an empty in-memory table.
    pub fn in_memory(config: Config) -> Result<Self> {
        config.validate()?;

        let state = TableState::new(config.min_bucket_count, config.bucket_capacity);
        let store = MemoryStore::new(config.min_bucket_count);

        Ok(Self::with_store(store, state, config))
    }
}

impl<K: TableKey, V: Encoding, S: Store<K, V>> HashTable<K, V, S> {
    fn with_store(store: S, state: TableState, config: Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                store,
                closed: false,
            }),
            config,
            _marker: PhantomData,
        }
    }

    // === Getters ===

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.state().count
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of home buckets, `n + p`.
    pub fn bucket_count(&self) -> usize {
        self.state().bucket_count()
    }

    /// Returns a snapshot of this table's counters.
    pub fn info(&self) -> Info {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        Info::new(&inner.state, inner.store.data_len())
    }

    // === Public Methods ===

    /// Insert `key`, or replace its value.
    ///
    /// Grows the table one bucket at a time until the load factor is back
    /// under [Config::max_load_factor].
    pub fn set(&self, key: &K, value: &V) -> Result<()> {
        let mut inner = self.lock()?;
        let Inner { state, store, .. } = &mut *inner;

        let bucket = state.home_of(key.table_hash());
        store.set(state, bucket, key, value)?;

        while state.load_factor() > self.config.max_load_factor {
            grow(state, store)?;
        }

        Ok(())
    }

    /// Returns the value stored for `key`, if any.
    pub fn try_get_value(&self, key: &K) -> Result<Option<V>> {
        let mut inner = self.lock()?;
        let Inner { state, store, .. } = &mut *inner;

        store.get(state.home_of(key.table_hash()), key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.try_get_value(key).map(|value| value.is_some())
    }

    /// Remove `key`, returning `false` if it wasn't there.
    ///
    /// Shrinks the table one bucket at a time while the load factor is under
    /// [Config::min_load_factor], but never below [Config::min_bucket_count].
    pub fn try_remove(&self, key: &K) -> Result<bool> {
        let mut inner = self.lock()?;
        let Inner { state, store, .. } = &mut *inner;

        let bucket = state.home_of(key.table_hash());
        if !store.remove(state, bucket, key)? {
            return Ok(false);
        }

        while state.bucket_count() > self.config.min_bucket_count
            && state.load_factor() < self.config.min_load_factor
        {
            shrink(state, store)?;
        }

        Ok(true)
    }

    /// Persist every change made since the last flush.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let Inner { state, store, .. } = &mut *inner;

        store.flush(state)
    }

    /// Verify the structural invariants of the bucket graph.
    pub fn check(&self) -> Result<()> {
        let inner = self.lock()?;

        inner.store.check(&inner.state)
    }

    /// Reclaim the space held by overwritten values, without waiting for
    /// [Config::compaction_threshold] overwrites.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let Inner { state, store, .. } = &mut *inner;

        store.compact(state)
    }

    /// Flush and release the table, returning the error [Drop] could only log.
    pub fn close(self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.closed = true;

        let Inner { state, store, .. } = &mut *inner;
        store.flush(state)
    }

    // === Private Methods ===

    fn lock(&self) -> Result<MutexGuard<'_, Inner<S>>> {
        self.inner.lock().map_err(|_| Error::Poisoned)
    }

    fn state(&self) -> TableState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }
}

impl<K: TableKey, V: Encoding, S: Store<K, V>> Drop for HashTable<K, V, S> {
    fn drop(&mut self) {
        let Ok(inner) = self.inner.get_mut() else {
            warn!("Table lock poisoned, dropping without a final flush");
            return;
        };

        if inner.closed {
            return;
        }

        let Inner { state, store, .. } = inner;
        if let Err(error) = store.flush(state) {
            error!(?error, "Failed to flush table on drop");
        }
    }
}

/// Split the bucket under the split pointer and move the pointer forward.
fn grow<K: TableKey, V: Encoding, S: Store<K, V>>(
    state: &mut TableState,
    store: &mut S,
) -> Result<()> {
    let (from, to) = state.split_target();
    let before = *state;

    store.split(state, from, &|key| before.relocates(key.table_hash()))?;
    state.advance();

    trace!(from, to, "Split bucket");
    if state.p == 0 {
        debug!(n = state.n, entries = state.count, "Doubled bucket count");
    }

    Ok(())
}

/// Move the split pointer back and fold the last bucket into its partner.
fn shrink<K: TableKey, V: Encoding, S: Store<K, V>>(
    state: &mut TableState,
    store: &mut S,
) -> Result<()> {
    state.retreat();
    let after = *state;

    store.merge(state, &|key| after.home_of(key.table_hash()))?;

    trace!(into = state.p, from = state.bucket_count(), "Merged bucket");
    if state.p == 0 {
        debug!(n = state.n, entries = state.count, "Halved bucket count");
    }

    Ok(())
}

#[cfg(test)]
impl<K: TableKey, V: Encoding> HashTable<K, V, DiskStore<K, V>> {
    /// Stop a flush right after the bucket records are rewritten, then drop
    /// the table as if the process died.
    pub(crate) fn interrupt_flush(self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.closed = true;

        let state = inner.state;
        inner.store.interrupt_flush(&state, CrashPoint::AfterBuckets)
    }
}
