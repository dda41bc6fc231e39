//! Durable write layer for tasklink.
//!
//! This library provides the persistence primitives the sync engine is built
//! on: crash-safe atomic file writes, an in-memory cache with scoped
//! invalidation, and a batching write queue that retries transient failures
//! and invalidates the cache once each write has landed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod atomic;
pub mod cache;
pub mod error;
pub mod queue;

pub use atomic::{AtomicFileWriter, FileWriter, read_if_exists, write_atomic};
pub use cache::{Cache, CacheConfig, CacheScope, InvalidationScope, Invalidator, InvalidatorSet};
pub use error::{Error, Result};
pub use queue::{FlushResult, Invalidation, WriteHandle, WriteQueue, WriteQueueConfig};
