//! Setup for the application logging.
//!
//! It redirects the tracing output to stdout with the threshold defined in
//! the configuration (case is ignored):
//!
//! - `off` (i.e. don't install any subscriber)
//! - `error`
//! - `warn`
//! - `info`
//! - `debug`
//! - `trace`
use std::str::FromStr;
use std::sync::Once;

use harbor_configuration::Configuration;
use tracing::info;
use tracing::level_filters::LevelFilter;

static INIT: Once = Once::new();

/// Installs the stdout subscriber with the configured threshold. Safe to
/// call more than once; only the first call installs anything.
pub fn setup(configuration: &Configuration) {
    let filter = config_level_or_default(configuration.log_level.as_deref());

    if filter == LevelFilter::OFF {
        return;
    }

    INIT.call_once(|| {
        tracing_subscriber::fmt().with_max_level(filter).init();
        info!("logging initialized");
    });
}

fn config_level_or_default(log_level: Option<&str>) -> LevelFilter {
    match log_level {
        None => LevelFilter::INFO,
        Some(level) => LevelFilter::from_str(level).unwrap_or(LevelFilter::INFO),
    }
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::config_level_or_default;

    #[test]
    fn the_default_threshold_should_be_info() {
        assert_eq!(config_level_or_default(None), LevelFilter::INFO);
        assert_eq!(config_level_or_default(Some("not a level")), LevelFilter::INFO);
    }

    #[test]
    fn thresholds_should_parse_case_insensitively() {
        assert_eq!(config_level_or_default(Some("DEBUG")), LevelFilter::DEBUG);
        assert_eq!(config_level_or_default(Some("off")), LevelFilter::OFF);
    }
}
