#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
pub mod codec;
mod disk;
mod error;
mod memory;
mod state;
mod store;
mod table;

pub use codec::{Encoding, TableKey};
pub use disk::DiskStore;
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use state::TableState;
pub use store::Store;
pub use table::config::{self, Config};
pub use table::info::Info;
pub use table::{DiskTable, HashTable, MemoryTable};

pub use bytes::Bytes;
