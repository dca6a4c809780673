//! Logging configuration for Quarry.
//!
//! Logs go to stderr so that query results written to stdout stay clean.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "quarry=debug,info"
    } else {
        "info"
    }
}

/// Builds the filter: `RUST_LOG` wins, otherwise the `debug` switch decides.
pub fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

/// Initializes logging to stderr.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init_stderr_logging(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug))
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "info");
        assert!(default_directive(true).contains("quarry=debug"));
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_stderr_logging(true);
        init_stderr_logging(false);
    }
}
