//! Setup before the engine runs: logging and configuration loading.
//!
//! The application setup has two stages: build the domain layer (the
//! engine) from the configuration, then launch the service jobs (peer
//! listener, snapshot job). This module contains the pieces shared by the
//! binary and by tests that boot a whole engine.
pub mod logging;

use harbor_configuration::Configuration;
use tracing::info;

/// Loads the configuration: from the given file when present, defaults
/// otherwise.
///
/// # Errors
///
/// Will return a configuration error when the file exists but cannot be
/// parsed.
pub fn load_configuration(path: Option<&str>) -> Result<Configuration, harbor_configuration::Error> {
    match path {
        Some(path) => {
            info!(path, "loading configuration");
            Configuration::load_from_file(path)
        }
        None => Ok(Configuration::default()),
    }
}
