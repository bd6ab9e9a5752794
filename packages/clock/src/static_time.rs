//! Trait to capture the time when the application starts.
use std::time::SystemTime;

lazy_static! {
    /// The time when the application started.
    pub static ref TIME_AT_APP_START: SystemTime = SystemTime::now();
}
