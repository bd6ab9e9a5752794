//! Per-swarm transfer accounting and speed estimation.
use std::collections::VecDeque;
use std::time::Duration;

use harbor_clock::clock::Time;
use harbor_primitives::DurationSinceUnixEpoch;

use crate::CurrentClock;

/// Speeds are averaged over a sliding window this long.
pub const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// A sliding-window rate estimator: byte arrivals are recorded with their
/// timestamp and the reported speed is the windowed sum divided by the
/// window length.
#[derive(Debug, Default)]
pub struct SpeedEstimator {
    samples: VecDeque<(DurationSinceUnixEpoch, u64)>,
}

impl SpeedEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bytes: u64) {
        self.samples.push_back((CurrentClock::now(), bytes));
        self.prune(CurrentClock::now());
    }

    /// Bytes per second over the window.
    #[must_use]
    pub fn bytes_per_second(&mut self) -> u64 {
        let now = CurrentClock::now();
        self.prune(now);

        let total: u64 = self.samples.iter().map(|(_, bytes)| bytes).sum();
        total / SPEED_WINDOW.as_secs()
    }

    fn prune(&mut self, now: DurationSinceUnixEpoch) {
        while let Some((stamp, _)) = self.samples.front() {
            if now.saturating_sub(*stamp) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Everything a swarm counts about itself.
#[derive(Debug)]
pub struct SwarmStatistics {
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    download_speed: SpeedEstimator,
    upload_speed: SpeedEstimator,
    /// When seeding began, for the seed-time limit.
    pub seeding_since: Option<DurationSinceUnixEpoch>,
    /// Last time we served a block, for the idle limit.
    pub last_upload_activity: DurationSinceUnixEpoch,
}

impl Default for SwarmStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmStatistics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            download_speed: SpeedEstimator::new(),
            upload_speed: SpeedEstimator::new(),
            seeding_since: None,
            last_upload_activity: CurrentClock::now(),
        }
    }

    pub fn record_downloaded(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
        self.download_speed.record(bytes);
    }

    pub fn record_uploaded(&mut self, bytes: u64) {
        self.uploaded_bytes += bytes;
        self.upload_speed.record(bytes);
        self.last_upload_activity = CurrentClock::now();
    }

    #[must_use]
    pub fn download_bps(&mut self) -> u64 {
        self.download_speed.bytes_per_second()
    }

    #[must_use]
    pub fn upload_bps(&mut self) -> u64 {
        self.upload_speed.bytes_per_second()
    }

    /// Uploaded over downloaded; `None` until anything was downloaded.
    #[must_use]
    pub fn ratio(&self) -> Option<f64> {
        if self.downloaded_bytes == 0 {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        Some(self.uploaded_bytes as f64 / self.downloaded_bytes as f64)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use harbor_clock::clock::stopped::Stopped as _;
    use harbor_clock::clock::Time;

    use super::{SpeedEstimator, SwarmStatistics, SPEED_WINDOW};
    use crate::CurrentClock;

    #[test]
    fn the_estimator_should_average_over_the_window() {
        CurrentClock::local_set(&Duration::from_secs(1_000));
        let mut estimator = SpeedEstimator::new();

        // 5000 bytes spread over the 5-second window: 1000 B/s.
        for _ in 0..5 {
            estimator.record(1_000);
            CurrentClock::local_add(&Duration::from_secs(1)).unwrap();
        }
        CurrentClock::local_sub(&Duration::from_secs(1)).unwrap();

        assert_eq!(estimator.bytes_per_second(), 1_000);
    }

    #[test]
    fn samples_older_than_the_window_should_fall_out() {
        CurrentClock::local_set(&Duration::from_secs(2_000));
        let mut estimator = SpeedEstimator::new();

        estimator.record(10_000);
        CurrentClock::local_add(&(SPEED_WINDOW + Duration::from_secs(1))).unwrap();

        assert_eq!(estimator.bytes_per_second(), 0);
    }

    #[test]
    fn an_idle_estimator_should_report_zero() {
        CurrentClock::local_set(&Duration::from_secs(3_000));
        let mut estimator = SpeedEstimator::new();

        assert_eq!(estimator.bytes_per_second(), 0);
    }

    #[test]
    fn the_ratio_should_be_none_until_something_was_downloaded() {
        CurrentClock::local_set(&Duration::from_secs(4_000));
        let mut statistics = SwarmStatistics::new();

        statistics.record_uploaded(100);
        assert_eq!(statistics.ratio(), None);

        statistics.record_downloaded(200);
        assert_eq!(statistics.ratio(), Some(0.5));
    }

    #[test]
    fn upload_activity_should_refresh_the_idle_stamp() {
        CurrentClock::local_set(&Duration::from_secs(5_000));
        let mut statistics = SwarmStatistics::new();
        let before = statistics.last_upload_activity;

        CurrentClock::local_add(&Duration::from_secs(60)).unwrap();
        statistics.record_uploaded(1);

        assert!(statistics.last_upload_activity > before);
    }
}
