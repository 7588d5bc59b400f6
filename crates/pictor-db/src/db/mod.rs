//! Database repositories
//!
//! Every state change on a derivative is a single conditional write: the
//! Postgres implementation uses `UPDATE ... WHERE id = $1 AND status = $2`,
//! the in-memory one checks and writes under one lock. Callers learn from the
//! returned flag whether they won.

pub mod derivative;
pub mod memory;
pub mod source_image;

pub use derivative::{DerivativeRepository, PostgresDerivativeRepository};
pub use memory::{InMemoryDerivativeRepository, InMemorySourceImageRepository};
pub use source_image::{PostgresSourceImageRepository, SourceImageRepository};
