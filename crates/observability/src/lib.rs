//! Process-wide logging setup shared by the pipeline binaries.

/// Initialize JSON logging for a long-running pipeline process.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json);
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;
