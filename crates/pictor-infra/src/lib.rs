//! Pictor Infrastructure Library
//!
//! Shared infrastructure used by Pictor binaries. Currently this is tracing
//! initialisation.

#[cfg(feature = "observability-basic")]
pub mod telemetry;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry, LogFormat};
