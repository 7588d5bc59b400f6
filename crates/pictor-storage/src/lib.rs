//! Pictor Storage Library
//!
//! Object store abstraction used for originals and derivative artifacts, with
//! a local filesystem backend and an in-memory backend.
//!
//! # Storage key format
//!
//! - Originals: `originals/{hash[0..2]}/{hash}.{ext}`
//! - Derivatives: `derivatives/{source_id}/{format}-{attempt_id}.{ext}`
//!
//! Keys must not contain `..` or a leading `/`. Key generation lives in the
//! [`keys`] module so all callers stay consistent.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod memory;
pub mod traits;

// Re-export commonly used types
pub use factory::create_storage;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use pictor_core::StorageBackend;
pub use traits::{ByteStream, Storage, StorageError, StorageResult};
