//! Logging integration for rowcache.
//!
//! Provides helpers for configuring [`tracing`]-based logging from
//! [`Settings`](crate::settings::Settings) and for creating per-operation spans.

use crate::settings::Settings;

/// Tracing target used for sampled cache-fallback diagnostics.
pub const CACHE_MISS_TARGET: &str = "rowcache::cache_miss";

/// Sets up the global tracing subscriber based on the given settings.
///
/// The filter is read from `settings.log_level`. In debug mode a pretty,
/// human-readable format is used; otherwise structured JSON. A subscriber
/// that is already installed is left in place.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for one store or cache operation on a table.
///
/// # Examples
///
/// ```
/// use rowcache_core::logging::operation_span;
///
/// let span = operation_span("update", "users");
/// let _guard = span.enter();
/// tracing::debug!("executing");
/// ```
pub fn operation_span(operation: &'static str, table: &str) -> tracing::Span {
    tracing::debug_span!("rowcache", op = operation, table = table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_is_idempotent() {
        let mut settings = Settings::default();
        settings.log_level = "not a valid = directive [".to_string();
        setup_logging(&settings);
        settings.debug = false;
        setup_logging(&settings);
    }

    #[test]
    fn test_operation_span_enters() {
        let span = operation_span("insert", "users");
        let _guard = span.enter();
        tracing::debug!("inside span");
    }
}
