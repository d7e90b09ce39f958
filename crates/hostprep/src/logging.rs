//! Tracing setup for the `hostprep` binary.
//!
//! Logs go to stderr so stdout stays usable for `--json` event output.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "hostprep=debug,info"
    } else {
        "info"
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        for verbose in [false, true] {
            assert!(default_filter(verbose).parse::<EnvFilter>().is_ok());
        }
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(false);
        init(true);
    }
}
