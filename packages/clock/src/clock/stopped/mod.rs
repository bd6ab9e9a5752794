//! A clock stopped at a settable moment, for tests.
use std::num::IntErrorKind;
use std::time::Duration;

use harbor_primitives::DurationSinceUnixEpoch;

use super::Time;
use crate::clock;

#[allow(clippy::module_name_repetitions)]
pub struct StoppedClock {}

/// Extra operations available on the stopped clock only: moving the fixed
/// time around. The state is thread-local, so concurrent tests do not step
/// on each other.
#[allow(clippy::module_name_repetitions)]
pub trait Stopped: clock::Time {
    /// It sets the clock to a given time.
    fn local_set(unix_time: &DurationSinceUnixEpoch);

    /// It sets the clock to the Unix Epoch.
    fn local_set_to_unix_epoch() {
        Self::local_set(&DurationSinceUnixEpoch::ZERO);
    }

    /// It adds a `Duration` to the clock.
    ///
    /// # Errors
    ///
    /// Will return `IntErrorKind` if `duration` would overflow the internal `Duration`.
    fn local_add(duration: &Duration) -> Result<(), IntErrorKind>;

    /// It subtracts a `Duration` from the clock.
    ///
    /// # Errors
    ///
    /// Will return `IntErrorKind` if `duration` would underflow the internal `Duration`.
    fn local_sub(duration: &Duration) -> Result<(), IntErrorKind>;

    /// It resets the clock to the default fixed time (the Unix epoch when
    /// testing, the application start time otherwise).
    fn local_reset();
}

impl Time for clock::Stopped {
    fn now() -> DurationSinceUnixEpoch {
        detail::FIXED_TIME.with(|time| *time.borrow())
    }
}

impl Stopped for clock::Stopped {
    fn local_set(unix_time: &DurationSinceUnixEpoch) {
        detail::FIXED_TIME.with(|time| {
            *time.borrow_mut() = *unix_time;
        });
    }

    fn local_add(duration: &Duration) -> Result<(), IntErrorKind> {
        detail::FIXED_TIME.with(|time| {
            let now = *time.borrow();
            match now.checked_add(*duration) {
                Some(later) => {
                    *time.borrow_mut() = later;
                    Ok(())
                }
                None => Err(IntErrorKind::PosOverflow),
            }
        })
    }

    fn local_sub(duration: &Duration) -> Result<(), IntErrorKind> {
        detail::FIXED_TIME.with(|time| {
            let now = *time.borrow();
            match now.checked_sub(*duration) {
                Some(earlier) => {
                    *time.borrow_mut() = earlier;
                    Ok(())
                }
                None => Err(IntErrorKind::NegOverflow),
            }
        })
    }

    fn local_reset() {
        Self::local_set(&detail::get_default_fixed_time());
    }
}

mod detail {
    use std::cell::RefCell;
    use std::time::SystemTime;

    use harbor_primitives::DurationSinceUnixEpoch;

    use crate::static_time;

    thread_local!(pub static FIXED_TIME: RefCell<DurationSinceUnixEpoch> = RefCell::new(get_default_fixed_time()));

    pub fn get_app_start_time() -> DurationSinceUnixEpoch {
        (*static_time::TIME_AT_APP_START)
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("the system clock predates the Unix epoch")
    }

    #[cfg(not(test))]
    pub fn get_default_fixed_time() -> DurationSinceUnixEpoch {
        get_app_start_time()
    }

    #[cfg(test)]
    pub fn get_default_fixed_time() -> DurationSinceUnixEpoch {
        DurationSinceUnixEpoch::ZERO
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crate::clock::stopped::Stopped as _;
    use crate::clock::{Stopped, Time, Working};

    #[test]
    fn it_should_default_to_zero_when_testing() {
        assert_eq!(Stopped::now(), Duration::ZERO);
    }

    #[test]
    fn it_should_be_possible_to_move_the_time() {
        Stopped::local_reset();

        let timestamp = Working::now();
        Stopped::local_set(&timestamp);
        assert_eq!(Stopped::now(), timestamp);

        Stopped::local_add(&Duration::from_secs(30)).unwrap();
        assert_eq!(Stopped::now(), timestamp + Duration::from_secs(30));

        Stopped::local_sub(&Duration::from_secs(30)).unwrap();
        assert_eq!(Stopped::now(), timestamp);

        Stopped::local_reset();
        assert_eq!(Stopped::now(), Duration::ZERO);
    }

    #[test]
    fn each_thread_should_get_its_own_stopped_time() {
        Stopped::local_reset();
        Stopped::local_set(&Duration::from_secs(5));

        let handle = thread::spawn(|| {
            assert_eq!(Stopped::now(), Duration::ZERO);
        });
        handle.join().unwrap();

        assert_eq!(Stopped::now(), Duration::from_secs(5));
        Stopped::local_reset();
    }
}
