use crate::state::TableState;

/// Statistics about a table, as of the moment [crate::HashTable::info] was called.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    entries: usize,
    n: usize,
    p: usize,
    bucket_capacity: usize,
    fragmentations: u32,
    data_len: Option<u64>,
}

impl Info {
    pub(crate) fn new(state: &TableState, data_len: Option<u64>) -> Self {
        Self {
            entries: state.count,
            n: state.n,
            p: state.p,
            bucket_capacity: state.capacity,
            fragmentations: state.fragmentations,
            data_len,
        }
    }

    /// Number of live entries.
    pub fn entries(&self) -> usize {
        self.entries
    }
    /// Bucket count at the start of the current doubling round.
    pub fn n(&self) -> usize {
        self.n
    }
    /// Split pointer: the next home bucket a grow splits.
    pub fn p(&self) -> usize {
        self.p
    }
    /// Entry slots per bucket.
    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }
    /// Number of home buckets, `n + p`.
    pub fn bucket_count(&self) -> usize {
        self.n + self.p
    }
    /// Live entries divided by the slots of all home buckets.
    pub fn load_factor(&self) -> f64 {
        self.entries as f64 / (self.bucket_capacity * self.bucket_count()) as f64
    }
    /// Values overwritten since the data log was last compacted.
    pub fn fragmentations(&self) -> u32 {
        self.fragmentations
    }
    /// Length in bytes of the data log, `None` for in-memory tables.
    pub fn data_len(&self) -> Option<u64> {
        self.data_len
    }
}
