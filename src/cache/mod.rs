//! Named cache partitions for offline support.
//!
//! This module provides the storage half of the offline cache:
//! - A store holds named partitions, each mapping a request to a response
//! - Partitions are created lazily on first open and persist until deleted
//! - Entries carry a body digest that is verified on every read

mod storage;
mod traits;

pub use storage::{CacheStore, SqliteStore};
pub use traits::{CacheResult, CacheSource, RequestKey, Response};
