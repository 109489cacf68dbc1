//! Storage facade backends.
//!
//! Backends implement [`StorageFs`](super::StorageFs) and
//! [`MetaStore`](super::auth::MetaStore) for different stores.

mod memory;

pub use memory::{JobMode, MemoryJob, MemoryMetaStore, MemoryStorage};
