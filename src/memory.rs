//! In-memory store, for tests and ephemeral tables.

use crate::codec::{Encoding, TableKey};
use crate::state::TableState;
use crate::store::Store;
use crate::{Error, Result};

/// Keeps each home bucket and its whole overflow chain as one list.
#[derive(Debug)]
pub struct MemoryStore<K, V> {
    buckets: Vec<Vec<(K, V)>>,
}

impl<K: TableKey + Clone, V: Encoding + Clone> MemoryStore<K, V> {
    /// A store with `bucket_count` empty home buckets.
    pub fn new(bucket_count: usize) -> Self {
        Self {
            buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
        }
    }

    fn bucket_mut(&mut self, bucket: usize) -> Result<&mut Vec<(K, V)>> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::Consistency(format!("bucket {bucket} is out of range")))
    }
}

impl<K: TableKey + Clone, V: Encoding + Clone> Store<K, V> for MemoryStore<K, V> {
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn get(&mut self, bucket: usize, key: &K) -> Result<Option<V>> {
        Ok(self
            .bucket_mut(bucket)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }

    fn set(&mut self, state: &mut TableState, bucket: usize, key: &K, value: &V) -> Result<()> {
        let entries = self.bucket_mut(bucket)?;

        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value.clone(),
            None => {
                entries.push((key.clone(), value.clone()));
                state.count += 1;
            }
        }

        Ok(())
    }

    fn remove(&mut self, state: &mut TableState, bucket: usize, key: &K) -> Result<bool> {
        let entries = self.bucket_mut(bucket)?;

        match entries.iter().position(|(k, _)| k == key) {
            Some(index) => {
                entries.remove(index);
                state.count -= 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn split(
        &mut self,
        _state: &TableState,
        from: usize,
        relocate: &dyn Fn(&K) -> bool,
    ) -> Result<()> {
        let entries = std::mem::take(self.bucket_mut(from)?);
        let (moved, stayed): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(k, _)| relocate(k));

        self.buckets[from] = stayed;
        self.buckets.push(moved);

        Ok(())
    }

    fn merge(&mut self, _state: &TableState, home_of: &dyn Fn(&K) -> usize) -> Result<()> {
        let dropped = self
            .buckets
            .pop()
            .ok_or_else(|| Error::Consistency("merge on an empty directory".into()))?;

        for (key, value) in dropped {
            let home = home_of(&key);
            self.bucket_mut(home)?.push((key, value));
        }

        Ok(())
    }

    fn check(&self, state: &TableState) -> Result<()> {
        if self.buckets.len() != state.bucket_count() {
            return Err(Error::Consistency(format!(
                "directory holds {} buckets, expected {}",
                self.buckets.len(),
                state.bucket_count()
            )));
        }

        let mut count = 0;
        for (index, entries) in self.buckets.iter().enumerate() {
            for (key, _) in entries {
                let home = state.home_of(key.table_hash());
                if home != index {
                    return Err(Error::Consistency(format!(
                        "key in bucket {index} belongs to bucket {home}"
                    )));
                }
            }
            count += entries.len();
        }

        if count != state.count {
            return Err(Error::Consistency(format!(
                "buckets hold {count} entries, expected {}",
                state.count
            )));
        }

        Ok(())
    }

    fn flush(&mut self, _state: &TableState) -> Result<()> {
        Ok(())
    }
}
