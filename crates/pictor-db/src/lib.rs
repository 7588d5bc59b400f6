//! Pictor metadata store
//!
//! Repository traits for derivative and source-image records, a PostgreSQL
//! implementation, and an in-memory implementation with the same
//! conditional-update semantics.

pub mod db;

pub use db::*;
