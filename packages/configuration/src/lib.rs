//! Configuration data structures for the [Harbor](https://docs.rs/harbor)
//! engine.
//!
//! The configuration is loaded from a [TOML](https://toml.io/en/) file. Each
//! section of the file maps to a structure: `[network]` to [`Network`],
//! `[limits]` to [`Limits`], `[dht]` to [`Dht`] and `[seeding]` to
//! [`Seeding`]. Every field has a default, so an empty file (or no file at
//! all) yields a working engine that listens on the standard `BitTorrent`
//! port and stores content under `./storage/downloads`.
//!
//! ```toml
//! log_level = "info"
//! download_root = "./storage/downloads"
//!
//! [network]
//! port = 6881
//!
//! [limits]
//! download_bps = 0      # 0 means unlimited
//! upload_bps = 1048576
//! ```
use std::fs;
use std::panic::Location;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core configuration for the engine.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Configuration {
    /// Logging threshold. Possible values are: `off`, `error`, `warn`, `info`,
    /// `debug` and `trace`. Default is `info`.
    #[serde(default = "Configuration::default_log_level")]
    pub log_level: Option<String>,

    /// Directory under which downloaded content is stored. The engine state
    /// snapshot lives in a `.state` subdirectory of this root.
    #[serde(default = "Configuration::default_download_root")]
    pub download_root: String,

    /// Interval in seconds between engine state snapshots.
    #[serde(default = "Configuration::default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    // Network configuration.
    #[serde(default = "Configuration::default_network")]
    pub network: Network,

    // Transfer and concurrency limits.
    #[serde(default = "Configuration::default_limits")]
    pub limits: Limits,

    // DHT configuration.
    #[serde(default = "Configuration::default_dht")]
    pub dht: Dht,

    // Optional bounds after which a seeding swarm stops.
    #[serde(default = "Configuration::default_seeding")]
    pub seeding: Seeding,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            download_root: Self::default_download_root(),
            snapshot_interval_secs: Self::default_snapshot_interval_secs(),
            network: Self::default_network(),
            limits: Self::default_limits(),
            dht: Self::default_dht(),
            seeding: Self::default_seeding(),
        }
    }
}

impl Configuration {
    fn default_log_level() -> Option<String> {
        Some("info".to_owned())
    }

    fn default_download_root() -> String {
        "./storage/downloads".to_owned()
    }

    fn default_snapshot_interval_secs() -> u64 {
        60
    }

    fn default_network() -> Network {
        Network::default()
    }

    fn default_limits() -> Limits {
        Limits::default()
    }

    fn default_dht() -> Dht {
        Dht::default()
    }

    fn default_seeding() -> Seeding {
        Seeding::default()
    }

    /// Loads the configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if the document is not valid TOML or a field
    /// has the wrong type.
    pub fn from_toml(toml: &str) -> Result<Self, Error> {
        toml::from_str(toml).map_err(|err| Error::BadToml {
            source: err,
            location: Location::caller(),
        })
    }

    /// Loads the configuration from the configuration file.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if `path` cannot be read or has a bad
    /// configuration.
    pub fn load_from_file(path: &str) -> Result<Self, Error> {
        let toml = fs::read_to_string(path).map_err(|err| Error::UnableToLoadFromConfigFile {
            source: err,
            location: Location::caller(),
        })?;

        Self::from_toml(&toml)
    }

    /// Saves the configuration to the configuration file.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if the file cannot be written.
    pub fn save_to_file(&self, path: &str) -> Result<(), Error> {
        fs::write(path, self.to_toml()).map_err(|err| Error::UnableToSaveToConfigFile {
            source: err,
            location: Location::caller(),
        })
    }

    /// Encodes the configuration to TOML.
    ///
    /// # Panics
    ///
    /// Will panic if the configuration cannot be encoded, which cannot happen
    /// for a value that deserialized in the first place.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string(self).expect("the configuration is serializable")
    }
}

/// Socket configuration for the peer listener and the DHT.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Network {
    /// TCP port the peer listener binds to. `0` picks a random free port.
    #[serde(default = "Network::default_port")]
    pub port: u16,

    /// The externally reachable IP announced to trackers, when known.
    #[serde(default = "Network::default_external_ip")]
    pub external_ip: Option<String>,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            external_ip: Self::default_external_ip(),
        }
    }
}

impl Network {
    fn default_port() -> u16 {
        6881
    }

    fn default_external_ip() -> Option<String> {
        None
    }
}

/// Transfer-rate and concurrency limits.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Limits {
    /// Global download limit in bytes per second. `0` means unlimited.
    #[serde(default = "Limits::default_download_bps")]
    pub download_bps: u64,

    /// Global upload limit in bytes per second. `0` means unlimited.
    #[serde(default = "Limits::default_upload_bps")]
    pub upload_bps: u64,

    /// Maximum number of swarms active at the same time. Adding more is
    /// rejected with a resource error.
    #[serde(default = "Limits::default_max_active_swarms")]
    pub max_active_swarms: usize,

    /// Maximum number of peer connections per swarm.
    #[serde(default = "Limits::default_max_peers_per_swarm")]
    pub max_peers_per_swarm: usize,

    /// Outstanding block requests per peer.
    #[serde(default = "Limits::default_request_queue_depth")]
    pub request_queue_depth: usize,

    /// Concurrently served uploads per swarm.
    #[serde(default = "Limits::default_active_uploads_per_swarm")]
    pub active_uploads_per_swarm: usize,

    /// Concurrently served uploads across all swarms.
    #[serde(default = "Limits::default_active_uploads_global")]
    pub active_uploads_global: usize,

    /// Peers kept unchoked by reciprocation, not counting the optimistic
    /// slot.
    #[serde(default = "Limits::default_unchoke_slots")]
    pub unchoke_slots: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            download_bps: Self::default_download_bps(),
            upload_bps: Self::default_upload_bps(),
            max_active_swarms: Self::default_max_active_swarms(),
            max_peers_per_swarm: Self::default_max_peers_per_swarm(),
            request_queue_depth: Self::default_request_queue_depth(),
            active_uploads_per_swarm: Self::default_active_uploads_per_swarm(),
            active_uploads_global: Self::default_active_uploads_global(),
            unchoke_slots: Self::default_unchoke_slots(),
        }
    }
}

impl Limits {
    fn default_download_bps() -> u64 {
        0
    }

    fn default_upload_bps() -> u64 {
        0
    }

    fn default_max_active_swarms() -> usize {
        25
    }

    fn default_max_peers_per_swarm() -> usize {
        50
    }

    fn default_request_queue_depth() -> usize {
        5
    }

    fn default_active_uploads_per_swarm() -> usize {
        4
    }

    fn default_active_uploads_global() -> usize {
        20
    }

    fn default_unchoke_slots() -> usize {
        3
    }
}

/// DHT (BEP 5) configuration.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Dht {
    /// Whether the DHT node runs at all. Private torrents never use the DHT
    /// regardless of this flag.
    #[serde(default = "Dht::default_enabled")]
    pub enabled: bool,

    /// UDP port the DHT node binds to. `0` picks a random free port.
    #[serde(default = "Dht::default_port")]
    pub port: u16,

    /// Well-known nodes used to join the network on a cold start.
    #[serde(default = "Dht::default_bootstrap_nodes")]
    pub bootstrap_nodes: Vec<String>,
}

impl Default for Dht {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            port: Self::default_port(),
            bootstrap_nodes: Self::default_bootstrap_nodes(),
        }
    }
}

impl Dht {
    fn default_enabled() -> bool {
        true
    }

    fn default_port() -> u16 {
        6881
    }

    fn default_bootstrap_nodes() -> Vec<String> {
        vec![
            "router.bittorrent.com:6881".to_owned(),
            "dht.transmissionbt.com:6881".to_owned(),
            "router.utorrent.com:6881".to_owned(),
        ]
    }
}

/// Optional bounds after which a seeding swarm stops by itself.
///
/// `None` disables the corresponding bound.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
pub struct Seeding {
    /// Stop when uploaded/downloaded crosses this ratio.
    #[serde(default)]
    pub max_ratio: Option<f64>,

    /// Stop after seeding for this many seconds.
    #[serde(default)]
    pub max_seed_time_secs: Option<u64>,

    /// Stop after this many seconds without serving any block.
    #[serde(default)]
    pub max_idle_time_secs: Option<u64>,
}

/// Errors that can occur when loading the configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to load from config file: {source}, {location}")]
    UnableToLoadFromConfigFile {
        source: std::io::Error,
        location: &'static Location<'static>,
    },

    #[error("unable to save to config file: {source}, {location}")]
    UnableToSaveToConfigFile {
        source: std::io::Error,
        location: &'static Location<'static>,
    },

    #[error("failed processing the configuration: {source}, {location}")]
    BadToml {
        source: toml::de::Error,
        location: &'static Location<'static>,
    },
}

#[cfg(test)]
mod tests {
    use crate::Configuration;

    #[test]
    fn configuration_should_have_working_defaults() {
        let configuration = Configuration::default();

        assert_eq!(configuration.network.port, 6881);
        assert_eq!(configuration.limits.request_queue_depth, 5);
        assert_eq!(configuration.limits.active_uploads_per_swarm, 4);
        assert_eq!(configuration.limits.active_uploads_global, 20);
        assert!(configuration.dht.enabled);
        assert_eq!(configuration.seeding.max_ratio, None);
    }

    #[test]
    fn an_empty_toml_document_should_yield_the_default_configuration() {
        let configuration = Configuration::from_toml("").expect("empty configuration should load");

        assert_eq!(configuration, Configuration::default());
    }

    #[test]
    fn configuration_should_round_trip_through_toml() {
        let configuration = Configuration::default();

        let reloaded = Configuration::from_toml(&configuration.to_toml()).unwrap();

        assert_eq!(reloaded, configuration);
    }

    #[test]
    fn individual_fields_should_be_overridable() {
        let configuration = Configuration::from_toml(
            r#"
            download_root = "/srv/torrents"

            [limits]
            download_bps = 1048576
            "#,
        )
        .unwrap();

        assert_eq!(configuration.download_root, "/srv/torrents");
        assert_eq!(configuration.limits.download_bps, 1_048_576);
        assert_eq!(configuration.limits.upload_bps, 0);
    }

    #[test]
    fn configuration_should_be_loaded_from_a_toml_config_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level = \"debug\"").unwrap();

        let configuration = Configuration::load_from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(configuration.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn loading_from_a_missing_file_should_fail() {
        assert!(Configuration::load_from_file("./does-not-exist.toml").is_err());
    }
}
