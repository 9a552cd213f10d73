//! Tracing and logging (shared setup).

/// Initialize process-wide logging with the default JSON format.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LoggingSettings::default());
}

/// Initialize process-wide logging from explicit settings.
pub fn init_with(settings: &LoggingSettings) {
    tracing::init(settings);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{LogFormat, LoggingSettings};
