//! # Log output.
//!
//! [`init_logging`] installs a `tracing-subscriber` formatter for the process.
//! `RUST_LOG` overrides the default directive.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global formatter with `default` as the filter directive
/// (e.g. `"info"` or `"cartvisor=debug"`).
///
/// Returns `false` if a global subscriber was already set.
pub fn init_logging(default: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let _ = init_logging("info");
        assert!(!init_logging("debug"));
    }
}
