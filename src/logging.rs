//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

/// The filter for `level`, unless `RUST_LOG` holds a valid one.
pub fn filter(level: &str, rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|expr| EnvFilter::try_new(expr).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so `manifest` output on
/// stdout stays machine readable. Calling this twice is harmless.
pub fn init(level: &str) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let _ = fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(filter(level, rust_log.as_deref()))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_level() {
        assert_eq!(filter("info", Some("portable=trace")).to_string(), "portable=trace");
        assert_eq!(filter("debug", None).to_string(), "debug");
    }

    #[test]
    fn invalid_expressions_fall_back() {
        assert_eq!(filter("warn", Some("portable=loud")).to_string(), "warn");
        assert_eq!(filter("portable=loud", None).to_string(), "info");
    }
}
