//! Append-only log of key and value blobs.
//!
//! Bucket records live in the same file, each at a stable offset reserved when
//! the bucket is first allocated. Blobs are never rewritten in place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use lru::LruCache;

use super::lock_exclusive;
use crate::{Error, Result};

/// Size of the length prefix framing every blob.
const BLOB_HEADER_SIZE: u64 = 4;

#[derive(Debug)]
pub(crate) struct DataLog {
    path: PathBuf,
    reader: File,
    writer: File,
    len: u64,
    /// Blobs by offset. Offsets are immutable until the log is replaced.
    cache: LruCache<u64, Bytes>,
}

impl DataLog {
    /// Open or create the log at `path`, locking it against other handles.
    pub fn open(path: &Path, cache_size: NonZeroUsize) -> Result<Self> {
        let (reader, writer, len) = open_handles(path, true)?;

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            writer,
            len,
            cache: LruCache::new(cache_size),
        })
    }

    // === Getters ===

    pub fn len(&self) -> u64 {
        self.len
    }

    // === Public Methods ===

    /// Append a length-prefixed blob and return its offset.
    pub fn append_blob(&mut self, blob: &[u8]) -> Result<u64> {
        let length = i32::try_from(blob.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "blob exceeds i32::MAX bytes")
        })?;

        let mut frame = Vec::with_capacity(BLOB_HEADER_SIZE as usize + blob.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(blob);

        self.append_raw(&frame)
    }

    /// Append unframed bytes, such as a bucket record, and return their offset.
    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.len;

        self.writer.seek(SeekFrom::Start(offset))?;
        self.writer.write_all(bytes)?;
        self.len += bytes.len() as u64;

        Ok(offset)
    }

    /// Overwrite bytes at an offset handed out by [Self::append_raw].
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() as u64 > self.len {
            return Err(Error::CorruptRecord {
                offset,
                reason: "write runs past the end of the data log",
            });
        }

        self.writer.seek(SeekFrom::Start(offset))?;
        self.writer.write_all(bytes)?;

        Ok(())
    }

    /// Read `len` unframed bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.len {
            return Err(Error::CorruptRecord {
                offset,
                reason: "record runs past the end of the data log",
            });
        }

        let mut buffer = vec![0_u8; len];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Read the blob framed at `offset`.
    pub fn read_blob(&mut self, offset: u64) -> Result<Bytes> {
        if let Some(blob) = self.cache.get(&offset) {
            return Ok(blob.clone());
        }

        let mut header = [0_u8; BLOB_HEADER_SIZE as usize];
        header.copy_from_slice(&self.read_at(offset, BLOB_HEADER_SIZE as usize)?);

        let length = i32::from_le_bytes(header);
        if length < 0 {
            return Err(Error::CorruptRecord {
                offset,
                reason: "negative blob length",
            });
        }

        if offset + BLOB_HEADER_SIZE + length as u64 > self.len {
            return Err(Error::CorruptRecord {
                offset,
                reason: "blob runs past the end of the data log",
            });
        }

        let blob = Bytes::from(self.read_at(offset + BLOB_HEADER_SIZE, length as usize)?);
        self.cache.put(offset, blob.clone());

        Ok(blob)
    }

    /// Flush written blobs and bucket records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.sync_data()?;
        Ok(())
    }

    /// Atomically replace this log with the file at `compacted`.
    pub fn replace_with(&mut self, compacted: &Path) -> Result<()> {
        fs::rename(compacted, &self.path)?;

        let (reader, writer, len) = open_handles(&self.path, false)?;
        self.reader = reader;
        self.writer = writer;
        self.len = len;
        self.cache.clear();

        Ok(())
    }
}

/// Open a reader and a locked writer on `path`, returning the file length.
fn open_handles(path: &Path, create: bool) -> Result<(File, File, u64)> {
    let writer = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)?;
    lock_exclusive(&writer, path)?;

    let reader = File::open(path)?;
    let len = writer.metadata()?.len();

    Ok((reader, writer, len))
}

#[cfg(test)]
mod test {
    use super::*;

    fn log(dir: &tempfile::TempDir) -> DataLog {
        DataLog::open(
            &dir.path().join("test.htdata"),
            NonZeroUsize::new(8).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn blobs_are_framed_and_addressed_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = log(&dir);

        let a = log.append_blob(b"alpha").unwrap();
        let b = log.append_blob(b"").unwrap();
        let c = log.append_blob(b"gamma").unwrap();

        assert_eq!((a, b, c), (0, 9, 13));
        assert_eq!(log.len(), 22);
        assert_eq!(log.read_blob(c).unwrap(), Bytes::from_static(b"gamma"));
        assert_eq!(log.read_blob(b).unwrap(), Bytes::new());
        assert_eq!(log.read_blob(a).unwrap(), Bytes::from_static(b"alpha"));
    }

    #[test]
    fn reopen_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();

        let offset = {
            let mut log = log(&dir);
            let offset = log.append_blob(b"persisted").unwrap();
            log.sync().unwrap();
            offset
        };

        let mut log = log(&dir);
        assert_eq!(log.read_blob(offset).unwrap(), Bytes::from_static(b"persisted"));
    }

    #[test]
    fn second_handle_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let _log = log(&dir);

        let error = DataLog::open(
            &dir.path().join("test.htdata"),
            NonZeroUsize::new(8).unwrap(),
        )
        .unwrap_err();

        assert!(matches!(error, Error::Locked(_)));
    }

    #[test]
    fn unreadable_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = log(&dir);

        log.append_raw(&(-3_i32).to_le_bytes()).unwrap();
        log.append_raw(&100_i32.to_le_bytes()).unwrap();

        assert!(matches!(
            log.read_blob(0),
            Err(Error::CorruptRecord {
                reason: "negative blob length",
                ..
            })
        ));
        assert!(matches!(
            log.read_blob(4),
            Err(Error::CorruptRecord { offset: 4, .. })
        ));
        assert!(matches!(
            log.read_blob(6),
            Err(Error::CorruptRecord { offset: 6, .. })
        ));
    }

    #[test]
    fn bucket_records_are_rewritten_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = log(&dir);

        let offset = log.append_raw(&[0; 8]).unwrap();
        log.write_at(offset, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        assert_eq!(log.read_at(offset, 8).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(log.write_at(4, &[0; 8]).is_err());
    }

    #[test]
    fn replace_with_compacted_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = log(&dir);
        log.append_blob(b"garbage").unwrap();
        log.append_blob(b"live").unwrap();
        assert_eq!(log.read_blob(0).unwrap(), Bytes::from_static(b"garbage"));

        let compacted_path = dir.path().join("test.htdata-compact");
        {
            let mut compacted = DataLog::open(&compacted_path, NonZeroUsize::new(8).unwrap())
                .unwrap();
            compacted.append_blob(b"live").unwrap();
            compacted.sync().unwrap();
        }

        log.replace_with(&compacted_path).unwrap();

        assert_eq!(log.len(), 8);
        assert_eq!(log.read_blob(0).unwrap(), Bytes::from_static(b"live"));
        assert!(!compacted_path.exists());
    }
}
