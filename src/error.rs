//! Main Crate Error

use std::path::PathBuf;

use crate::codec::CodecError;

/// Alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
/// Linhash crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// A key or value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The bucket graph no longer satisfies its structural invariants.
    ///
    /// Fatal for the operation that detected it, the table is never repaired silently.
    #[error("Internal consistency violation: {0}")]
    Consistency(String),

    /// Both the index file and its backup are untrustworthy, or the index can't be parsed.
    ///
    /// The table refuses to open until it is repaired or recreated.
    #[error("Table is corrupt: {0}")]
    Corrupt(String),

    /// A blob in the data log could not be read.
    #[error("Unreadable record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Byte offset of the blob in the data log.
        offset: u64,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// Another handle already holds this file.
    #[error("Table file is locked by another handle: {0}")]
    Locked(PathBuf),

    /// The [crate::Config] can't describe a working table.
    #[error("Invalid config: {0}")]
    InvalidConfig(&'static str),

    /// A thread panicked while holding the table lock.
    #[error("Table lock poisoned")]
    Poisoned,
}
