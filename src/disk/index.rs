//! Table metadata record and its crash-safe commit protocol.
//!
//! The live index file is overwritten in place, and a flush rewrites bucket
//! records in the data log in place too. Before either happens, the current
//! index and the committed image of every bucket record about to change are
//! written to a backup file, and only once that copy is durable is it stamped
//! with [BACKUP_MARKER]. A non-empty backup found at open time therefore means
//! a commit was interrupted: with the marker, restoring it yields the last
//! committed table exactly; without it, neither copy can be trusted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::data_log::DataLog;
use super::lock_exclusive;
use crate::{Error, Result};

/// Stamped over the first four bytes of a complete backup.
pub(crate) const BACKUP_MARKER: [u8; 4] = *b"LHBK";

/// Flat metadata record persisted in the `.htindex` file.
///
/// `fragmentations` and `chain_offsets` are trailing sections that older
/// files may lack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct IndexRecord {
    pub count: i32,
    pub p: i32,
    pub n: i32,
    pub bucket_capacity: i32,
    /// Home bucket offsets, in directory order.
    pub bucket_offsets: Vec<i64>,
    pub fragmentations: i32,
    /// `(home slot, offset)` of overflow buckets in chain order, then
    /// `(-1, offset)` of free buckets.
    pub chain_offsets: Vec<(i32, i64)>,
}

impl IndexRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(
            28 + 8 * self.bucket_offsets.len() + 12 * self.chain_offsets.len(),
        );

        buffer.extend_from_slice(&self.count.to_le_bytes());
        buffer.extend_from_slice(&self.p.to_le_bytes());
        buffer.extend_from_slice(&self.n.to_le_bytes());
        buffer.extend_from_slice(&self.bucket_capacity.to_le_bytes());
        buffer.extend_from_slice(&(self.bucket_offsets.len() as i32).to_le_bytes());
        for offset in &self.bucket_offsets {
            buffer.extend_from_slice(&offset.to_le_bytes());
        }
        buffer.extend_from_slice(&self.fragmentations.to_le_bytes());
        buffer.extend_from_slice(&(self.chain_offsets.len() as i32).to_le_bytes());
        for (home, offset) in &self.chain_offsets {
            buffer.extend_from_slice(&home.to_le_bytes());
            buffer.extend_from_slice(&offset.to_le_bytes());
        }

        buffer
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };

        let count = cursor.i32()?;
        let p = cursor.i32()?;
        let n = cursor.i32()?;
        let bucket_capacity = cursor.i32()?;
        let bucket_offsets = cursor.list(|cursor| cursor.i64())?;

        let fragmentations = if cursor.is_done() { 0 } else { cursor.i32()? };
        let chain_offsets = if cursor.is_done() {
            vec![]
        } else {
            cursor.list(|cursor| Ok((cursor.i32()?, cursor.i64()?)))?
        };

        if !cursor.is_done() {
            return Err(Error::Corrupt("index record has trailing bytes".into()));
        }
        if count < 0 || p < 0 || n <= 0 || bucket_capacity <= 0 || fragmentations < 0 {
            return Err(Error::Corrupt(format!(
                "index record has invalid counters: count {count}, p {p}, n {n}, capacity {bucket_capacity}"
            )));
        }

        Ok(Self {
            count,
            p,
            n,
            bucket_capacity,
            bucket_offsets,
            fragmentations,
            chain_offsets,
        })
    }
}

/// Committed image of a bucket record that a flush is about to overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoRecord {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Backup payload: the live index, then the bucket record images.
///
/// `int32 index length | index | int32 image count | (int64 offset, int32 length, bytes)*`
fn encode_backup(live: &[u8], undo: &[UndoRecord]) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(
        8 + live.len() + undo.iter().map(|image| 12 + image.bytes.len()).sum::<usize>(),
    );

    buffer.extend_from_slice(&length_prefix(live.len())?);
    buffer.extend_from_slice(live);
    buffer.extend_from_slice(&length_prefix(undo.len())?);
    for image in undo {
        buffer.extend_from_slice(&(image.offset as i64).to_le_bytes());
        buffer.extend_from_slice(&length_prefix(image.bytes.len())?);
        buffer.extend_from_slice(&image.bytes);
    }

    Ok(buffer)
}

fn decode_backup(payload: &[u8]) -> Result<(&[u8], Vec<UndoRecord>)> {
    let mut cursor = Cursor {
        bytes: payload,
        pos: 0,
    };

    let len = cursor.length()?;
    let live = cursor.slice(len)?;
    let undo = cursor.list(|cursor| {
        let offset = u64::try_from(cursor.i64()?)
            .map_err(|_| Error::Corrupt("backup holds a negative bucket offset".into()))?;
        let len = cursor.length()?;

        Ok(UndoRecord {
            offset,
            bytes: cursor.slice(len)?.to_vec(),
        })
    })?;

    if !cursor.is_done() {
        return Err(Error::Corrupt("index backup has trailing bytes".into()));
    }

    Ok((live, undo))
}

fn length_prefix(len: usize) -> Result<[u8; 4]> {
    i32::try_from(len)
        .map(i32::to_le_bytes)
        .map_err(|_| Error::Consistency(format!("{len} bytes do not fit the index backup")))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(Error::Corrupt("index data is truncated".into()));
        }

        let bytes = &self.bytes[self.pos..end];
        self.pos = end;

        Ok(bytes)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buffer = [0_u8; N];
        buffer.copy_from_slice(self.slice(N)?);

        Ok(buffer)
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    /// A non-negative `int32` length.
    fn length(&mut self) -> Result<usize> {
        usize::try_from(self.i32()?)
            .map_err(|_| Error::Corrupt("index data has a negative length".into()))
    }

    /// A list prefixed with its `int32` length.
    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let len = self.length()?;

        (0..len).map(|_| item(self)).collect()
    }
}

/// The live `.htindex` file and its `.htindex-bak` shadow.
#[derive(Debug)]
pub(crate) struct IndexFile {
    live: File,
    backup: File,
    backup_path: PathBuf,
}

impl IndexFile {
    /// Open and lock both files. Call [Self::recover] before reading.
    pub fn open(live_path: &Path, backup_path: &Path) -> Result<Self> {
        Ok(Self {
            live: open_locked(live_path)?,
            backup: open_locked(backup_path)?,
            backup_path: backup_path.to_path_buf(),
        })
    }

    /// The committed record, or `None` for a table that was never flushed.
    pub fn read(&mut self) -> Result<Option<IndexRecord>> {
        let bytes = read_all(&mut self.live)?;

        if bytes.is_empty() {
            return Ok(None);
        }

        IndexRecord::from_bytes(&bytes).map(Some)
    }

    /// Replace the live record with `record` when no bucket record changes with it.
    pub fn commit(&mut self, record: &IndexRecord) -> Result<()> {
        self.backup(&[])?;
        self.publish(record)
    }

    /// Copy the live record and the bucket record images aside, then stamp
    /// the copy as complete. Nothing may be overwritten before this returns.
    pub fn backup(&mut self, undo: &[UndoRecord]) -> Result<()> {
        let current = read_all(&mut self.live)?;
        let payload = encode_backup(&current, undo)?;

        self.backup.set_len(0)?;
        self.backup.seek(SeekFrom::Start(0))?;
        self.backup.write_all(&[0; BACKUP_MARKER.len()])?;
        self.backup.write_all(&payload)?;
        self.backup.sync_data()?;

        self.backup.seek(SeekFrom::Start(0))?;
        self.backup.write_all(&BACKUP_MARKER)?;
        self.backup.sync_data()?;

        Ok(())
    }

    /// Overwrite the live record and discard the backup, ending the commit.
    pub fn publish(&mut self, record: &IndexRecord) -> Result<()> {
        overwrite(&mut self.live, &record.to_bytes())?;
        self.discard_backup()
    }

    fn discard_backup(&mut self) -> Result<()> {
        self.backup.set_len(0)?;
        self.backup.sync_data()?;
        Ok(())
    }

    /// Roll an interrupted commit back, restoring the bucket records in
    /// `data` and the live record. Returns whether there was one.
    pub fn recover(&mut self, data: &mut DataLog) -> Result<bool> {
        let backup = read_all(&mut self.backup)?;

        if backup.is_empty() {
            return Ok(false);
        }

        if !backup.starts_with(&BACKUP_MARKER) {
            return Err(Error::Corrupt(format!(
                "{} holds an incomplete backup, the index can't be trusted",
                self.backup_path.display()
            )));
        }

        let (live, undo) = decode_backup(&backup[BACKUP_MARKER.len()..])?;

        warn!(
            path = ?self.backup_path,
            buckets = undo.len(),
            "Restoring table index from backup after an interrupted commit"
        );

        for image in &undo {
            data.write_at(image.offset, &image.bytes)
                .map_err(|error| match error {
                    Error::CorruptRecord { offset, reason } => {
                        Error::Corrupt(format!("backup image at {offset}: {reason}"))
                    }
                    error => error,
                })?;
        }
        data.sync()?;

        overwrite(&mut self.live, live)?;
        self.discard_backup()?;

        Ok(true)
    }
}

/// Write the index of a compacted log next to it, durable before returning.
pub(crate) fn write_pending(path: &Path, record: &IndexRecord) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&record.to_bytes())?;
    file.sync_all()?;

    Ok(())
}

/// The index left by a compaction that renamed its log into place, if any.
pub(crate) fn read_pending(path: &Path) -> Result<Option<IndexRecord>> {
    match fs::read(path) {
        Ok(bytes) => IndexRecord::from_bytes(&bytes).map(Some),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

fn open_locked(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    lock_exclusive(&file, path)?;

    Ok(file)
}

fn read_all(file: &mut File) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();

    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;

    Ok(bytes)
}

fn overwrite(file: &mut File, bytes: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.set_len(bytes.len() as u64)?;
    file.sync_all()?;

    Ok(())
}

#[cfg(test)]
impl IndexFile {
    /// Write the first half of `record` over the live file, as a crash mid-publish would.
    pub(crate) fn publish_torn(&mut self, record: &IndexRecord) -> Result<()> {
        let bytes = record.to_bytes();
        overwrite(&mut self.live, &bytes[..bytes.len() / 2])
    }
}
