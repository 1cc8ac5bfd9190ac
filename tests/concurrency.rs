//! Many threads sharing one table.

use linhash::{Config, DiskTable};
use rayon::prelude::*;

#[test]
fn concurrent_writers_and_readers() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempfile::tempdir().unwrap();
    let table = DiskTable::<u32, String>::open(dir.path().join("shared"), Config::default()).unwrap();

    (0..4000_u32).into_par_iter().for_each(|key| {
        table.set(&key, &key.to_string()).unwrap();

        if key % 3 == 0 {
            assert_eq!(table.try_get_value(&key).unwrap(), Some(key.to_string()));
        }
    });

    (0..4000_u32)
        .into_par_iter()
        .filter(|key| key % 2 == 1)
        .for_each(|key| {
            assert!(table.try_remove(&key).unwrap());
        });

    assert_eq!(table.len(), 2000);
    table.check().unwrap();

    for key in 0..4000_u32 {
        let expected = (key % 2 == 0).then(|| key.to_string());
        assert_eq!(table.try_get_value(&key).unwrap(), expected);
    }
}
