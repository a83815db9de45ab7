//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Output format of the process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event (pipeline workers).
    #[default]
    Json,
    /// Single-line human-readable output (operator CLI).
    Compact,
}

/// Initialize tracing for the process with the filter taken from `RUST_LOG`
/// (default `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    init_with_default(format, "info");
}

/// Like [`init`], but with a caller-chosen fallback filter directive.
pub fn init_with_default(format: LogFormat, default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().with_writer(std::io::stderr).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        init(LogFormat::Json);
        init(LogFormat::Compact);
        ::tracing::info!(second_init = true, "logging initialized twice");
    }
}
