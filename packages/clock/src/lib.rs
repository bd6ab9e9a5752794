//! Time related functions and types.
//!
//! It's usually a good idea to control where the time comes from in an
//! application so that it can be mocked for testing and we get the intended
//! behavior without relying on the underlying system clock.
//!
//! Time-to-live and rotation logic (DHT announce tokens, stored-peer purges,
//! ban cool-downs) is driven by a `CurrentClock` alias that each crate
//! resolves to [`clock::Working`] in production and [`clock::Stopped`] under
//! `cfg(test)`, so tests can move time by hand.
//!
//! Clocks use the type `DurationSinceUnixEpoch` which is a
//! `std::time::Duration` since the Unix Epoch (a timestamp).
pub mod clock;
pub mod static_time;

#[macro_use]
extern crate lazy_static;

/// This code needs to be copied into each crate.
/// Working version, for production.
#[cfg(not(test))]
#[allow(dead_code)]
pub(crate) type CurrentClock = clock::Working;

/// Stopped version, for testing.
#[cfg(test)]
#[allow(dead_code)]
pub(crate) type CurrentClock = clock::Stopped;
