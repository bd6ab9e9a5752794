use std::time::SystemTime;

use harbor_primitives::DurationSinceUnixEpoch;

use crate::clock;

#[allow(clippy::module_name_repetitions)]
pub struct WorkingClock;

impl clock::Time for clock::Working {
    fn now() -> DurationSinceUnixEpoch {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("the system clock predates the Unix epoch")
    }
}
