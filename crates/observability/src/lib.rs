//! Tracing and logging setup shared by the queue binaries.

/// Initialize process-wide logging using `LOG_FORMAT` to pick the output.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init_with(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::LogFormat;
