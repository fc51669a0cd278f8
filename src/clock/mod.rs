use chrono::{DateTime, Utc};
use std::thread;
use std::time::Duration;

/// Wall clock and blocking waits.
///
/// Every wait in the daemon (character pacing, the 20 s sampling cadence,
/// the long settle periods) goes through `sleep`, so tests can run the
/// whole state machine in virtual time.
pub trait SystemClock {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Block the calling thread for `d`.
    fn sleep(&self, d: Duration);
}

/// Elapsed wall time since `start`, clamped to zero if the clock stepped back.
pub fn elapsed_since<C: SystemClock + ?Sized>(clock: &C, start: DateTime<Utc>) -> Duration {
    (clock.now() - start).to_std().unwrap_or_default()
}

/// The host's real-time clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostClock;

impl SystemClock for HostClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}
