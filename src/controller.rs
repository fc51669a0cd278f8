use crate::clock::SystemClock;
use crate::config::{AdjustConfig, SystemConfig};
use crate::error::RecoveryError;
use crate::frequency::FrequencyCompensator;
use crate::health::HealthMonitor;
use crate::protocol::CrtcDriver;
use crate::stabilizer::{StabilityVerdict, Stabilizer};
use crate::state::StateStore;
use crate::traits::{Port, ReferenceSource};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Correction chosen for one trusted offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    /// Date and time re-pushed, shifted by the offset (ms).
    DateTime(f64),
    /// Output stepped by whole milliseconds.
    Milliseconds(f64),
    None,
}

/// Sequences health supervision, offset stabilization and corrections.
pub struct SyncController<P, S, C>
where
    P: Port,
    S: ReferenceSource,
    C: SystemClock,
{
    driver: CrtcDriver<P, C>,
    source: S,
    health: HealthMonitor<C>,
    stabilizer: Stabilizer<C>,
    compensator: FrequencyCompensator<C>,
    store: StateStore,
    clock: C,
    adjust: AdjustConfig,
    replay_pending: bool,
}

impl<P, S, C> SyncController<P, S, C>
where
    P: Port,
    S: ReferenceSource,
    C: SystemClock + Clone,
{
    pub fn new(config: &SystemConfig, port: P, source: S, clock: C) -> Self {
        let store = StateStore::new(&config.adjust.storage_path);
        SyncController {
            driver: CrtcDriver::new(port, clock.clone(), &config.device),
            source,
            health: HealthMonitor::new(config, clock.clone()),
            stabilizer: Stabilizer::new(&config.reference, clock.clone()),
            compensator: FrequencyCompensator::new(store.clone(), clock.clone()),
            store,
            clock,
            adjust: config.adjust.clone(),
            replay_pending: false,
        }
    }

    /// Boot checks: replay lost trims after a device power loss, wait for
    /// valid output, make sure the daemon consumes it.
    pub fn startup(&mut self) -> Result<(), RecoveryError> {
        self.store.load_or_init(self.clock.now())?;

        match self.driver.query_restart()? {
            Some(true) => {
                info!("[Controller] Device lost power since last query, replaying frequency trims");
                // the device answers Y only once
                self.replay_pending = true;
            }
            Some(false) => info!("[Controller] Device kept its trims"),
            None => warn!("[Controller] Device did not answer the restart query"),
        }
        if self.replay_pending {
            self.compensator.apply(&mut self.driver, true, 0.0)?;
            self.replay_pending = false;
        }

        self.health.wait_until_valid(&mut self.driver)?;
        self.health.check_and_recover(&mut self.driver, &mut self.source)?;
        Ok(())
    }

    /// Healthy device and one stabilization pass. `None` when the
    /// stabilizer abstained.
    pub fn trusted_offset(&mut self) -> Result<Option<f64>, RecoveryError> {
        self.health.check_and_recover(&mut self.driver, &mut self.source)?;
        debug!("[Controller] Device {}", self.health.state());
        match self.stabilizer.get_quality_offset(&mut self.source)? {
            StabilityVerdict::Stable(offset) => {
                self.store.update(self.clock.now(), |s| s.average = offset)?;
                Ok(Some(offset))
            }
            StabilityVerdict::Abstain(reason) => {
                warn!("[Controller] No trusted offset this round: {:?}", reason);
                Ok(None)
            }
        }
    }

    /// Correct until the trusted offset is within tolerance. Transient
    /// failures are retried after a cycle interval; only `Fatal` returns.
    pub fn converge(&mut self, stop: &AtomicBool) -> Result<(), RecoveryError> {
        info!("[Controller] Performing first time offset adjustment");
        while !stop.load(Ordering::SeqCst) {
            match self.converge_round() {
                Ok(true) => {
                    info!("[Controller] Converged, normal operation resumed");
                    break;
                }
                Ok(false) => {}
                Err(e) => self.absorb("Convergence round", e)?,
            }
        }
        Ok(())
    }

    fn converge_round(&mut self) -> Result<bool, RecoveryError> {
        let offset = match self.trusted_offset()? {
            Some(offset) => offset,
            None => {
                self.clock.sleep(self.cycle_interval());
                return Ok(false);
            }
        };
        info!("[Controller] Offset to reference: {:.3} ms", offset);
        if self.make_adjust(offset)? != Adjustment::None {
            return Ok(false);
        }
        self.store.update(self.clock.now(), |s| s.stable_system = true)?;
        Ok(true)
    }

    /// One steady-state round.
    pub fn run_cycle(&mut self) -> Result<Adjustment, RecoveryError> {
        let adjustment = match self.trusted_offset()? {
            Some(offset) => {
                info!("[Controller] Normal operation, offset {:.3} ms", offset);
                let adjustment = self.make_adjust(offset)?;
                let stable = adjustment == Adjustment::None;
                self.store.update(self.clock.now(), |s| s.stable_system = stable)?;
                if !stable && self.adjust.frequency_adjust {
                    let total = self.compensator.apply(&mut self.driver, false, offset)?;
                    debug!("[Controller] Cumulative frequency trim {}", total);
                }
                adjustment
            }
            None => Adjustment::None,
        };
        self.clock.sleep(self.cycle_interval());
        Ok(adjustment)
    }

    /// Beyond the coarse threshold the date and time are re-pushed and the
    /// stored average is reset; otherwise the output is stepped by whole
    /// milliseconds. Either correction is followed by a settle period.
    pub fn make_adjust(&mut self, offset_ms: f64) -> Result<Adjustment, RecoveryError> {
        let settle = Duration::from_secs(self.adjust.settle_secs);

        if offset_ms.abs() > self.adjust.coarse_threshold_ms {
            info!("[Controller] Offset {:.3} ms beyond coarse threshold, pushing date and time", offset_ms);
            self.driver.push_date_time(offset_ms)?;
            self.store.update(self.clock.now(), |s| {
                s.average = 0.0;
                s.stable_system = false;
            })?;
            self.clock.sleep(settle);
            return Ok(Adjustment::DateTime(offset_ms));
        }

        // tenths of a millisecond are below what the device can step
        let rounded = (offset_ms * 10.0).round() / 10.0;
        if rounded.abs() > self.adjust.tolerance_ms {
            self.driver.step_milliseconds(offset_ms)?;
            self.clock.sleep(settle);
            return Ok(Adjustment::Milliseconds(offset_ms));
        }

        debug!("[Controller] Offset {:.3} ms within tolerance", offset_ms);
        Ok(Adjustment::None)
    }

    /// Startup, convergence, then steady cycles until `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), RecoveryError> {
        while !stop.load(Ordering::SeqCst) {
            match self.startup() {
                Ok(()) => break,
                Err(e) => self.absorb("Startup", e)?,
            }
        }
        self.converge(stop)?;
        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.run_cycle() {
                self.absorb("Cycle", e)?;
            }
        }
        info!("[Controller] Stop requested");
        Ok(())
    }

    /// Pass `Fatal` on; log anything else and wait a cycle before retrying.
    fn absorb(&self, what: &str, e: RecoveryError) -> Result<(), RecoveryError> {
        if e.is_fatal() {
            return Err(e);
        }
        warn!("[Controller] {} failed, retrying: {}", what, e);
        self.clock.sleep(self.cycle_interval());
        Ok(())
    }

    fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.adjust.cycle_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock::TestClock;
    use crate::error::SourceError;
    use crate::link::scripted::ScriptedPort;
    use crate::ntp::{DaemonState, LastUpdate, PeerRecord, REACH_FULL};
    use crate::state::SyncState;
    use crate::traits::MockReferenceSource;

    const REFERENCE: &str = "158.112.160.8";
    const ACK: &str = "PSRFTXT,(ACK)\n";
    const VALID: &str = "054,A,0000\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: SystemConfig,
        clock: TestClock,
        port: ScriptedPort,
        store: StateStore,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = SystemConfig::default();
        config.adjust.storage_path = dir.path().join("state.json");
        let store = StateStore::new(&config.adjust.storage_path);
        Fixture {
            _dir: dir,
            config,
            clock: TestClock::new(),
            port: ScriptedPort::new(),
            store,
        }
    }

    /// Healthy daemon reporting `offsets` for the reference peer, one per
    /// poll; the last value repeats.
    fn source(offsets: Vec<f64>) -> MockReferenceSource {
        flaky_source(offsets, 0)
    }

    /// Like [`source`], but the first `failures` reference offset polls fail.
    fn flaky_source(offsets: Vec<f64>, failures: usize) -> MockReferenceSource {
        let mut source = MockReferenceSource::new();
        source.expect_ensure_running().returning(|| Ok(DaemonState::Running));
        source.expect_force_resync().never();
        let mut served = 0;
        let mut failed = 0;
        source.expect_poll().returning(move |peer, query| {
            if peer == REFERENCE && query.offset && failed < failures {
                failed += 1;
                return Err(SourceError::PeerNotListed(peer.to_string()));
            }
            let offset = if peer == REFERENCE {
                let value = offsets[served.min(offsets.len() - 1)];
                if query.offset {
                    served += 1;
                }
                value
            } else {
                0.0
            };
            Ok(PeerRecord {
                peer: peer.to_string(),
                offset_ms: Some(offset),
                jitter_ms: Some(0.0),
                reach: Some(REACH_FULL),
                when: Some(LastUpdate::Seconds(8)),
                stratum: Some(1),
            })
        });
        source
    }

    fn controller(f: &Fixture, source: MockReferenceSource) -> SyncController<ScriptedPort, MockReferenceSource, TestClock> {
        SyncController::new(&f.config, f.port.clone(), source, f.clock.clone())
    }

    fn stored(f: &Fixture) -> SyncState {
        f.store.load_or_init(f.clock.now()).unwrap()
    }

    #[test]
    fn test_coarse_offset_pushes_date_time() {
        let f = fixture();
        f.port.reply_on('t', &[Some(ACK)]);
        f.port.reply_on('d', &[Some(ACK)]);
        let mut ctl = controller(&f, source(vec![0.0]));
        f.store
            .update(f.clock.now(), |s| {
                s.average = 250.0;
                s.stable_system = true;
            })
            .unwrap();

        assert_eq!(ctl.make_adjust(250.0).unwrap(), Adjustment::DateTime(250.0));
        assert_eq!(f.port.count_written('t'), 1);
        assert_eq!(f.port.count_written('d'), 1);
        assert_eq!(f.port.count_written('+'), 0);

        let state = stored(&f);
        assert_eq!(state.average, 0.0);
        assert!(!state.stable_system);
        assert_eq!(f.clock.sleeps_at_least(Duration::from_secs(1800)).len(), 1);
    }

    #[test]
    fn test_fine_offset_steps_milliseconds() {
        let f = fixture();
        let mut ctl = controller(&f, source(vec![0.0]));

        assert_eq!(ctl.make_adjust(-3.4).unwrap(), Adjustment::Milliseconds(-3.4));
        assert_eq!(f.port.count_written('-'), 3);
        assert_eq!(f.clock.sleeps_at_least(Duration::from_secs(1800)).len(), 1);
    }

    #[test]
    fn test_offset_rounding_to_tolerance_is_left_alone() {
        let f = fixture();
        let mut ctl = controller(&f, source(vec![0.0]));

        assert_eq!(ctl.make_adjust(1.04).unwrap(), Adjustment::None);
        assert_eq!(ctl.make_adjust(-0.5).unwrap(), Adjustment::None);
        assert!(f.port.written().is_empty());
        assert!(f.clock.sleeps_at_least(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_startup_replays_trims_after_power_loss() {
        let f = fixture();
        let mut state = SyncState::fresh(f.clock.now());
        state.freq_adj.cumulative_steps = 2010;
        f.store.save(&state).unwrap();

        f.port.reply_on('p', &[Some("PSRFTXT,(Y)\n")]);
        f.port.set_idle(VALID);
        let mut ctl = controller(&f, source(vec![0.0]));

        ctl.startup().unwrap();
        assert_eq!(f.port.count_written('o'), 2);
        assert_eq!(f.port.count_written('x'), 1);
        assert_eq!(stored(&f).freq_adj.cumulative_steps, 2010);
    }

    #[test]
    fn test_startup_without_power_loss_keeps_trims() {
        let f = fixture();
        f.port.reply_on('p', &[Some("PSRFTXT,(N)\n")]);
        f.port.set_idle(VALID);
        let mut ctl = controller(&f, source(vec![0.0]));

        ctl.startup().unwrap();
        assert_eq!(f.port.written(), "p");
        assert_eq!(stored(&f).freq_adj.cumulative_steps, 0);
    }

    #[test]
    fn test_converge_corrects_until_within_tolerance() {
        let f = fixture();
        f.port.reply_on('t', &[Some(ACK)]);
        f.port.reply_on('d', &[Some(ACK)]);
        // one full stabilization pass at 250 ms, then settled output
        let mut offsets = vec![250.0; 11];
        offsets.push(0.25);
        let mut ctl = controller(&f, source(offsets));

        ctl.converge(&AtomicBool::new(false)).unwrap();
        assert_eq!(f.port.count_written('t'), 1);
        let state = stored(&f);
        assert!(state.stable_system);
        assert_eq!(state.average, 0.25);
    }

    #[test]
    fn test_converge_survives_transient_daemon_failure() {
        let f = fixture();
        let mut ctl = controller(&f, flaky_source(vec![0.25], 1));

        ctl.converge(&AtomicBool::new(false)).unwrap();
        let state = stored(&f);
        assert!(state.stable_system);
        assert_eq!(state.average, 0.25);
        // one cycle interval waited out after the failure
        assert!(f.clock.sleeps_at_least(Duration::from_secs(60)).contains(&Duration::from_secs(60)));
    }

    #[test]
    fn test_cycle_records_average_and_sleeps() {
        let f = fixture();
        let mut ctl = controller(&f, source(vec![0.5]));

        assert_eq!(ctl.run_cycle().unwrap(), Adjustment::None);
        let state = stored(&f);
        assert_eq!(state.average, 0.5);
        assert!(state.stable_system);
        assert_eq!(
            f.clock.sleeps_at_least(Duration::from_secs(60)).last(),
            Some(&Duration::from_secs(60))
        );
    }

    #[test]
    fn test_cycle_trims_frequency_when_enabled() {
        let mut f = fixture();
        f.config.adjust.frequency_adjust = true;
        let mut ctl = controller(&f, source(vec![2.0]));

        assert_eq!(ctl.run_cycle().unwrap(), Adjustment::Milliseconds(2.0));
        assert_eq!(f.port.count_written('+'), 2);
        let state = stored(&f);
        assert!(!state.stable_system);
        assert!(state.freq_adj.cumulative_steps > 0);
        assert!(f.port.count_written('o') + f.port.count_written('x') > 0);
    }

    #[test]
    fn test_run_returns_when_stopped() {
        let f = fixture();
        let mut ctl = controller(&f, MockReferenceSource::new());

        ctl.run(&AtomicBool::new(true)).unwrap();
        assert!(f.port.written().is_empty());
        assert!(f.clock.sleeps_at_least(Duration::from_millis(1)).is_empty());
    }
}
