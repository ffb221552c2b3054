//! Tracing and logging setup shared by the binaries.

/// Initialize process-wide logging with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

pub use self::tracing::{LogFormat, UnknownLogFormat, init as init_with};

/// Tracing configuration (filters, formatters).
pub mod tracing;
