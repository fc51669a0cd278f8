//! Device health supervision.
//!
//! The device is healthy when the time daemon keeps consuming its output.
//! When it does not, one recovery stage is attempted per round, in order:
//! unresponsive device, invalid time flag, then a stale or incoherent
//! daemon. The number of rounds is bounded; running out of rounds is fatal.

use crate::clock::SystemClock;
use crate::config::SystemConfig;
use crate::error::RecoveryError;
use crate::ntp::PeerQuery;
use crate::protocol::{CrtcDriver, Validity};
use crate::traits::{Port, ReferenceSource};
use log::{error, info, warn};
use std::fmt;
use std::time::Duration;

/// Sum of two `when` readings at or above which the device is considered
/// stale: twice the nominal 16-17 s update cadence.
pub const STALE_SUM_SECS: u64 = 34;
pub const MAX_RECOVERY_ATTEMPTS: usize = 5;
pub const FILLER_BUDGET: usize = 10;
pub const VALIDITY_READS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Healthy,
    Unresponsive,
    InvalidFlag,
    StaleCadence,
    Fatal,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryState::Healthy => "healthy",
            RecoveryState::Unresponsive => "unresponsive",
            RecoveryState::InvalidFlag => "invalid-flag",
            RecoveryState::StaleCadence => "stale-cadence",
            RecoveryState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

pub struct HealthMonitor<C: SystemClock> {
    clock: C,
    device_peer: String,
    cadence_gap: Duration,
    invalid_settle: Duration,
    state: RecoveryState,
}

impl<C: SystemClock> HealthMonitor<C> {
    pub fn new(config: &SystemConfig, clock: C) -> Self {
        HealthMonitor {
            clock,
            device_peer: config.reference.device_peer.clone(),
            cadence_gap: Duration::from_secs(config.reference.sample_interval_secs),
            invalid_settle: Duration::from_secs(config.device.invalid_settle_secs),
            state: RecoveryState::Healthy,
        }
    }

    /// The stage handled most recently, or `Healthy`.
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Whether the daemon is still taking samples from the device.
    pub fn is_updating<S: ReferenceSource>(&self, source: &mut S) -> Result<bool, RecoveryError> {
        let first = source.poll(&self.device_peer, PeerQuery::when())?.when()?;
        self.clock.sleep(self.cadence_gap);
        let second = source.poll(&self.device_peer, PeerQuery::when())?.when()?;

        let sum = first.recovery_seconds().saturating_add(second.recovery_seconds());
        let updating = sum != 0 && sum < STALE_SUM_SECS;
        if !updating {
            warn!(
                "[Health] Device peer not updating (when: {:?}, {:?})",
                first, second
            );
        }
        Ok(updating)
    }

    /// Keep recovering until the device is updating again.
    ///
    /// Returns `Fatal` after [`MAX_RECOVERY_ATTEMPTS`] unsuccessful rounds.
    /// A round that fails with a transient error still uses up an attempt.
    /// Ending the process is left to the caller.
    pub fn check_and_recover<P: Port, D: SystemClock, S: ReferenceSource>(
        &mut self,
        driver: &mut CrtcDriver<P, D>,
        source: &mut S,
    ) -> Result<RecoveryState, RecoveryError> {
        let mut attempts = 0;
        loop {
            match self.is_updating(source) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!("[Health] Could not read device cadence: {}", e),
            }
            if attempts >= MAX_RECOVERY_ATTEMPTS {
                self.state = RecoveryState::Fatal;
                error!("[Health] Device still not updating after {} recovery attempts", attempts);
                return Err(RecoveryError::Fatal(format!(
                    "device not updating after {} recovery attempts",
                    attempts
                )));
            }
            attempts += 1;
            match self.attempt_fix(driver, source) {
                Ok(stage) => info!("[Health] Recovery attempt {} handled stage {}", attempts, stage),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("[Health] Recovery attempt {} failed: {}", attempts, e),
            }
        }
        if attempts > 0 {
            info!("[Health] Device updating again after {} attempt(s)", attempts);
        }
        self.state = RecoveryState::Healthy;
        Ok(RecoveryState::Healthy)
    }

    /// Handle the first failing stage and return which one it was.
    pub fn attempt_fix<P: Port, D: SystemClock, S: ReferenceSource>(
        &mut self,
        driver: &mut CrtcDriver<P, D>,
        source: &mut S,
    ) -> Result<RecoveryState, RecoveryError> {
        if driver.probe()?.is_none() {
            self.state = RecoveryState::Unresponsive;
            warn!("[Health] Device silent, assuming it waits for input");
            for pulse in 1..=FILLER_BUDGET {
                driver.send_filler()?;
                if driver.probe()?.is_some() {
                    info!("[Health] Device answered after {} filler pulse(s)", pulse);
                    return Ok(RecoveryState::Unresponsive);
                }
            }
            self.state = RecoveryState::Fatal;
            error!("[Health] Device silent after {} filler pulses", FILLER_BUDGET);
            return Err(RecoveryError::Fatal(format!(
                "device silent after {} filler pulses",
                FILLER_BUDGET
            )));
        }

        if !self.output_valid(driver)? {
            self.state = RecoveryState::InvalidFlag;
            warn!("[Health] Device flags its time as invalid, pushing date and time");
            driver.push_date_time(0.0)?;
            info!("[Health] Settling for {:?}", self.invalid_settle);
            self.clock.sleep(self.invalid_settle);
            return Ok(RecoveryState::InvalidFlag);
        }

        self.state = RecoveryState::StaleCadence;
        warn!("[Health] Device responsive and valid but not consumed, resyncing daemon");
        source.force_resync()?;
        driver.push_date_time(0.0)?;
        Ok(RecoveryState::StaleCadence)
    }

    /// Block until the device reports valid time, re-pushing date and time
    /// after each run of invalid readings.
    pub fn wait_until_valid<P: Port, D: SystemClock>(
        &mut self,
        driver: &mut CrtcDriver<P, D>,
    ) -> Result<(), RecoveryError> {
        while !self.output_valid(driver)? {
            self.state = RecoveryState::InvalidFlag;
            warn!("[Health] Device output invalid, sending date and time");
            driver.push_date_time(0.0)?;
            self.clock.sleep(self.invalid_settle);
        }
        info!("[Health] Device output valid");
        Ok(())
    }

    /// Up to [`VALIDITY_READS`] lines; serial noise can corrupt any one of them.
    fn output_valid<P: Port, D: SystemClock>(
        &self,
        driver: &mut CrtcDriver<P, D>,
    ) -> Result<bool, RecoveryError> {
        for _ in 0..VALIDITY_READS {
            if driver.read_validity()? == Some(Validity::Valid) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
