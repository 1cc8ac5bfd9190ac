//! Single-threaded set/get/remove throughput of disk and in-memory tables,
//! reported in nanoseconds per operation.
//!
//! Catches regressions in bucket addressing, chain walks and resizing.
//!
//! Run: `cargo bench --bench throughput`

use std::time::{Duration, Instant};

use linhash::{Config, DiskTable, HashTable, MemoryTable, Store};

fn main() {
    println!("throughput\n");

    for size in [1_000, 10_000, 50_000] {
        let dir = tempfile::tempdir().unwrap();
        let table = DiskTable::<u64, u64>::open(dir.path().join("bench"), Config::default())
            .unwrap();
        bench("disk", size, &table);
        table.close().unwrap();

        let table = MemoryTable::<u64, u64>::in_memory(Config::default()).unwrap();
        bench("memory", size, &table);
    }
}

fn bench<S: Store<u64, u64>>(name: &str, size: u64, table: &HashTable<u64, u64, S>) {
    let set = timed(|| {
        for key in 0..size {
            table.set(&key, &key).unwrap();
        }
    });

    let overwrite = timed(|| {
        for key in 0..size {
            table.set(&key, &(key + 1)).unwrap();
        }
    });

    let get = timed(|| {
        for key in 0..size {
            assert!(table.try_get_value(&key).unwrap().is_some());
        }
    });

    let remove = timed(|| {
        for key in 0..size {
            table.try_remove(&key).unwrap();
        }
    });

    println!(
        "{name:<7} {size:>6} entries: set {}ns/op, overwrite {}ns/op, get {}ns/op, remove {}ns/op",
        set.as_nanos() / size as u128,
        overwrite.as_nanos() / size as u128,
        get.as_nanos() / size as u128,
        remove.as_nanos() / size as u128,
    );
}

fn timed(f: impl FnOnce()) -> Duration {
    let start = Instant::now();
    f();
    start.elapsed()
}
