//! The tracker client: announcing over HTTP or UDP with multi-tracker
//! failover.
//!
//! A swarm usually knows several announce URLs (the primary `announce`, the
//! tiers of `announce-list`, the `tr` parameters of a magnet link). The
//! [`TrackerManager`] keeps one [`Endpoint`] per URL with a health state and
//! an empirical success rate, and tries them in order of
//! `(health, success rate)` until one returns peers.
//!
//! Health transitions: 2 consecutive failures mark an endpoint `Warning`,
//! 5 mark it `Error`. `Error` endpoints are retried at most once every five
//! minutes.
use std::net::SocketAddr;
use std::time::Duration;

use derive_more::Constructor;
use harbor_clock::clock::Time;
use harbor_primitives::announce_event::AnnounceEvent;
use harbor_primitives::info_hash::InfoHash;
use harbor_primitives::peer;
use harbor_primitives::DurationSinceUnixEpoch;
use tracing::{debug, warn};

use crate::CurrentClock;

pub mod http;
pub mod udp;

/// How long an `Error` endpoint rests before it may be tried again.
pub const ERROR_RETRY_COOLDOWN: Duration = Duration::from_secs(5 * 60);

const WARNING_THRESHOLD: u32 = 2;
const ERROR_THRESHOLD: u32 = 5;

/// Everything a tracker needs to know about us in an announce.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: peer::Id,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// What a tracker told us: the re-announce interval (when given) and the
/// peer candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Constructor)]
pub struct AnnounceData {
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported tracker URL scheme: {url}")]
    UnsupportedScheme { url: String },

    #[error("http tracker failed: {source}")]
    Http {
        #[from]
        source: http::Error,
    },

    #[error("udp tracker failed: {source}")]
    Udp {
        #[from]
        source: udp::Error,
    },

    #[error("all {attempted} tracker endpoint(s) failed")]
    AllEndpointsFailed { attempted: usize },
}

/// Health of one announce URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Health {
    Working,
    Warning,
    Error,
}

impl Health {
    fn rank(self) -> u8 {
        match self {
            Self::Working => 0,
            Self::Warning => 1,
            Self::Error => 2,
        }
    }
}

/// One announce URL and its service record.
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: String,
    health: Health,
    consecutive_failures: u32,
    attempts: u64,
    successes: u64,
    last_error_retry: Option<DurationSinceUnixEpoch>,
}

impl Endpoint {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url,
            health: Health::Working,
            consecutive_failures: 0,
            attempts: 0,
            successes: 0,
            last_error_retry: None,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn health(&self) -> Health {
        self.health
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            // Untried endpoints sort ahead of known-flaky ones.
            1.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.successes as f64 / self.attempts as f64
            }
        }
    }

    fn record_success(&mut self) {
        self.attempts += 1;
        self.successes += 1;
        self.consecutive_failures = 0;
        self.health = Health::Working;
    }

    fn record_failure(&mut self) {
        self.attempts += 1;
        self.consecutive_failures += 1;

        self.health = if self.consecutive_failures >= ERROR_THRESHOLD {
            Health::Error
        } else if self.consecutive_failures >= WARNING_THRESHOLD {
            Health::Warning
        } else {
            Health::Working
        };
    }

    /// `Error` endpoints rest for [`ERROR_RETRY_COOLDOWN`] between attempts.
    fn is_eligible(&self, now: DurationSinceUnixEpoch) -> bool {
        if self.health != Health::Error {
            return true;
        }

        match self.last_error_retry {
            None => true,
            Some(last) => now.saturating_sub(last) >= ERROR_RETRY_COOLDOWN,
        }
    }
}

/// Announces against a prioritized list of endpoints until one delivers.
pub struct TrackerManager {
    endpoints: Vec<Endpoint>,
    http: http::Client,
    udp: udp::Client,
}

impl TrackerManager {
    /// # Errors
    ///
    /// Will return an [`Error`] if the HTTP client cannot be constructed.
    pub fn new(urls: Vec<String>) -> Result<Self, Error> {
        Ok(Self {
            endpoints: urls.into_iter().map(Endpoint::new).collect(),
            http: http::Client::new()?,
            udp: udp::Client::new(),
        })
    }

    #[must_use]
    pub fn has_endpoints(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// The endpoints with their current health, for the stats surface.
    #[must_use]
    pub fn endpoint_health(&self) -> Vec<(String, Health)> {
        self.endpoints
            .iter()
            .map(|endpoint| (endpoint.url.clone(), endpoint.health))
            .collect()
    }

    /// Announces to the endpoints in `(health, success rate)` order and
    /// returns the first response carrying peers. A response without peers
    /// still counts as an endpoint success (and is returned when no endpoint
    /// does better, which is the normal case for `stopped` announces).
    ///
    /// # Errors
    ///
    /// Will return [`Error::AllEndpointsFailed`] when every eligible
    /// endpoint errored.
    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceData, Error> {
        let now = CurrentClock::now();
        let order = self.announce_order(now);

        let mut empty_response: Option<AnnounceData> = None;
        let mut attempted = 0;

        for index in order {
            let url = self.endpoints[index].url.clone();

            if self.endpoints[index].health == Health::Error {
                self.endpoints[index].last_error_retry = Some(now);
            }

            attempted += 1;
            debug!(%url, event = %params.event, "announcing");

            match self.dispatch(&url, params).await {
                Ok(data) => {
                    self.endpoints[index].record_success();

                    if !data.peers.is_empty() {
                        return Ok(data);
                    }
                    empty_response.get_or_insert(data);
                }
                Err(error) => {
                    warn!(%url, %error, "tracker announce failed");
                    self.endpoints[index].record_failure();
                }
            }
        }

        match empty_response {
            Some(data) => Ok(data),
            None => Err(Error::AllEndpointsFailed { attempted }),
        }
    }

    async fn dispatch(&self, url: &str, params: &AnnounceParams) -> Result<AnnounceData, Error> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(self.http.announce(url, params).await?)
        } else if url.starts_with("udp://") {
            Ok(self.udp.announce(url, params).await?)
        } else {
            Err(Error::UnsupportedScheme { url: url.to_owned() })
        }
    }

    /// Endpoint indices sorted by `(health rank, success rate descending)`,
    /// with resting `Error` endpoints filtered out.
    fn announce_order(&self, now: DurationSinceUnixEpoch) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.endpoints.len())
            .filter(|index| self.endpoints[*index].is_eligible(now))
            .collect();

        order.sort_by(|a, b| {
            let a = &self.endpoints[*a];
            let b = &self.endpoints[*b];

            a.health
                .rank()
                .cmp(&b.health.rank())
                .then_with(|| b.success_rate().total_cmp(&a.success_rate()))
        });

        order
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use harbor_clock::clock::stopped::Stopped as _;
    use harbor_clock::clock::Time;

    use super::{Endpoint, Health, TrackerManager, ERROR_RETRY_COOLDOWN};
    use crate::CurrentClock;

    #[test]
    fn a_fresh_endpoint_should_be_working_with_a_perfect_rate() {
        let endpoint = Endpoint::new("http://t/announce".to_owned());

        assert_eq!(endpoint.health(), Health::Working);
        assert!((endpoint.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn two_consecutive_failures_should_mark_an_endpoint_warning() {
        let mut endpoint = Endpoint::new("http://t/announce".to_owned());

        endpoint.record_failure();
        assert_eq!(endpoint.health(), Health::Working);

        endpoint.record_failure();
        assert_eq!(endpoint.health(), Health::Warning);
    }

    #[test]
    fn five_consecutive_failures_should_mark_an_endpoint_error() {
        let mut endpoint = Endpoint::new("http://t/announce".to_owned());

        for _ in 0..5 {
            endpoint.record_failure();
        }

        assert_eq!(endpoint.health(), Health::Error);
    }

    #[test]
    fn a_success_should_reset_the_failure_streak() {
        let mut endpoint = Endpoint::new("http://t/announce".to_owned());

        endpoint.record_failure();
        endpoint.record_failure();
        endpoint.record_success();

        assert_eq!(endpoint.health(), Health::Working);
        endpoint.record_failure();
        assert_eq!(endpoint.health(), Health::Working);
    }

    #[test]
    fn error_endpoints_should_rest_between_retries() {
        CurrentClock::local_set(&Duration::from_secs(1000));

        let mut endpoint = Endpoint::new("udp://t:6969".to_owned());
        for _ in 0..5 {
            endpoint.record_failure();
        }

        assert!(endpoint.is_eligible(CurrentClock::now()));
        endpoint.last_error_retry = Some(CurrentClock::now());

        assert!(!endpoint.is_eligible(CurrentClock::now()));

        CurrentClock::local_add(&ERROR_RETRY_COOLDOWN).unwrap();
        assert!(endpoint.is_eligible(CurrentClock::now()));
    }

    #[test]
    fn announce_order_should_put_healthy_and_successful_endpoints_first() {
        let mut manager = TrackerManager::new(vec![
            "http://flaky/announce".to_owned(),
            "http://good/announce".to_owned(),
            "http://dead/announce".to_owned(),
        ])
        .unwrap();

        // flaky: 1 success, 2 recent failures (Warning).
        manager.endpoints[0].record_success();
        manager.endpoints[0].record_failure();
        manager.endpoints[0].record_failure();

        // good: all successes.
        manager.endpoints[1].record_success();

        // dead: 5 failures (Error), resting.
        for _ in 0..5 {
            manager.endpoints[2].record_failure();
        }
        CurrentClock::local_set(&Duration::from_secs(5000));
        manager.endpoints[2].last_error_retry = Some(CurrentClock::now());

        let order = manager.announce_order(CurrentClock::now());

        assert_eq!(order, vec![1, 0]);
    }
}
