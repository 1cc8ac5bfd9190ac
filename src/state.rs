//! Table-wide counters and linear hashing address math.

/// Counters shared by a table and its store.
///
/// `n` is the bucket count at the start of the current doubling round and `p`
/// the split pointer inside it, so the directory always holds `n + p` home buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableState {
    pub(crate) n: usize,
    pub(crate) p: usize,
    pub(crate) capacity: usize,
    pub(crate) count: usize,
    pub(crate) fragmentations: u32,
}

impl TableState {
    pub(crate) fn new(n: usize, capacity: usize) -> Self {
        Self {
            n,
            p: 0,
            capacity,
            count: 0,
            fragmentations: 0,
        }
    }

    // === Getters ===

    /// Number of home buckets in the directory.
    pub fn bucket_count(&self) -> usize {
        self.n + self.p
    }

    /// Live entries divided by total slot capacity.
    pub fn load_factor(&self) -> f64 {
        self.count as f64 / (self.capacity * self.bucket_count()) as f64
    }

    // === Public Methods ===

    /// Home bucket of a key with the given hash.
    ///
    /// Buckets below the split pointer were already split this round, so their
    /// keys are addressed with one more bit.
    pub fn home_of(&self, hash: i32) -> usize {
        let hash = hash as u32 as usize;
        let bucket = hash & (self.n - 1);

        if bucket < self.p {
            hash & (2 * self.n - 1)
        } else {
            bucket
        }
    }

    /// The bucket the next grow splits, and the index of the bucket it creates.
    pub(crate) fn split_target(&self) -> (usize, usize) {
        (self.p, self.n + self.p)
    }

    /// Whether a key with `hash` leaves the split bucket for the new one.
    pub(crate) fn relocates(&self, hash: i32) -> bool {
        let (_, new_index) = self.split_target();

        (hash as u32 as usize) & (2 * self.n - 1) == new_index
    }

    /// Move the split pointer past one freshly split bucket.
    pub(crate) fn advance(&mut self) {
        self.p += 1;

        if self.p == self.n {
            self.n *= 2;
            self.p = 0;
        }
    }

    /// Move the split pointer back before the last bucket.
    pub(crate) fn retreat(&mut self) {
        if self.p == 0 {
            self.n /= 2;
            self.p = self.n - 1;
        } else {
            self.p -= 1;
        }
    }
}
