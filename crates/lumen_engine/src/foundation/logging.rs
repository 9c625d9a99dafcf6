//! Logging utilities and structured logging support

pub use log::{debug, info, warn, error, trace};

/// Parse a textual log level, falling back to `Info` for unknown names
pub fn parse_level(level: &str) -> log::LevelFilter {
    level.parse().unwrap_or(log::LevelFilter::Info)
}

/// Initialize the logging system
///
/// `default_level` applies when `RUST_LOG` is unset. Calling this twice is
/// harmless; the second call is ignored.
pub fn init(default_level: &str) {
    let result = env_logger::Builder::from_default_env()
        .filter_level(parse_level(default_level))
        .parse_default_env()
        .try_init();

    if result.is_err() {
        log::debug!("Logger already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_known_names() {
        assert_eq!(parse_level("debug"), log::LevelFilter::Debug);
        assert_eq!(parse_level("WARN"), log::LevelFilter::Warn);
        assert_eq!(parse_level("off"), log::LevelFilter::Off);
    }

    #[test]
    fn test_parse_level_unknown_falls_back_to_info() {
        assert_eq!(parse_level("chatty"), log::LevelFilter::Info);
    }
}
