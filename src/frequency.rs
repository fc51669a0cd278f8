//! Long-term oscillator drift compensation.
//!
//! The device oscillator is trimmed in discrete steps through two pulse
//! sizes per direction. The number of steps shrinks exponentially with how
//! slowly the offset built up since the previous trim.

use crate::clock::SystemClock;
use crate::error::CompensatorError;
use crate::protocol::CrtcDriver;
use crate::state::StateStore;
use crate::traits::Port;
use log::{debug, info};

/// Steps applied for an offset that built up instantly.
const MAX_STEPS: f64 = 20_000.0;
/// Seconds of drift per ms of offset at which the step count falls to 1/e.
const DECAY_SECS_PER_MS: f64 = 170_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimDirection {
    Up,
    Down,
}

impl TrimDirection {
    fn symbols(self) -> (&'static str, &'static str) {
        match self {
            TrimDirection::Up => ("o", "x"),
            TrimDirection::Down => ("i", "z"),
        }
    }
}

/// A signed step count split into thousand- and ten-step pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimPlan {
    pub direction: TrimDirection,
    pub thousands: u64,
    pub tens: u64,
}

impl TrimPlan {
    /// Round `steps` to the nearest ten and split it.
    pub fn from_steps(steps: f64) -> Self {
        let rounded = round_to_ten(steps);
        let direction = if rounded < 0 { TrimDirection::Down } else { TrimDirection::Up };
        let magnitude = rounded.unsigned_abs();
        let (thousands, rest) = (magnitude / 1000, magnitude % 1000);
        TrimPlan {
            direction,
            thousands,
            tens: rest / 10,
        }
    }

    /// Signed steps this plan applies.
    pub fn signed_steps(&self) -> i64 {
        let magnitude = (self.thousands * 1000 + self.tens * 10) as i64;
        match self.direction {
            TrimDirection::Up => magnitude,
            TrimDirection::Down => -magnitude,
        }
    }
}

fn round_to_ten(steps: f64) -> i64 {
    (steps / 10.0).round() as i64 * 10
}

/// Steps for an offset of `offset_ms` that accumulated over `elapsed_secs`.
pub fn steps_for(elapsed_secs: f64, offset_ms: f64) -> f64 {
    let error_size = elapsed_secs / offset_ms;
    let magnitude = MAX_STEPS * (-error_size.abs() / DECAY_SECS_PER_MS).exp();
    magnitude.copysign(offset_ms)
}

pub struct FrequencyCompensator<C: SystemClock> {
    store: StateStore,
    clock: C,
}

impl<C: SystemClock> FrequencyCompensator<C> {
    pub fn new(store: StateStore, clock: C) -> Self {
        FrequencyCompensator { store, clock }
    }

    /// Trim the oscillator and return the cumulative signed step count.
    ///
    /// With `restart_replay` the device lost its trims: the stored total is
    /// sent again and becomes the new baseline. Otherwise offsets within
    /// +-1 ms leave everything untouched.
    pub fn apply<P: Port, D: SystemClock>(
        &mut self,
        driver: &mut CrtcDriver<P, D>,
        restart_replay: bool,
        offset_ms: f64,
    ) -> Result<i64, CompensatorError> {
        let state = self.store.load_or_init(self.clock.now())?;
        let previous = state.freq_adj;

        let plan = if restart_replay {
            info!(
                "[Frequency] Device restarted, replaying {} steps",
                previous.cumulative_steps
            );
            TrimPlan::from_steps(previous.cumulative_steps as f64)
        } else if offset_ms > -1.0 && offset_ms < 1.0 {
            debug!("[Frequency] Offset {:.3} ms within tolerance, no trim", offset_ms);
            return Ok(previous.cumulative_steps);
        } else {
            let elapsed = (self.clock.now() - previous.last_adjustment).num_milliseconds() as f64 / 1000.0;
            let steps = steps_for(elapsed, offset_ms);
            info!(
                "[Frequency] Offset {:.3} ms over {:.0} s -> {:.1} steps",
                offset_ms, elapsed, steps
            );
            TrimPlan::from_steps(steps)
        };

        self.send_plan(driver, &plan)?;

        let applied = plan.signed_steps();
        let now = self.clock.now();
        let cumulative = self.store.update(now, |s| {
            let total = if restart_replay {
                applied
            } else {
                s.freq_adj.cumulative_steps + applied
            };
            s.freq_adj.last_adjustment = now;
            s.freq_adj.cumulative_steps = total;
            total
        })?;
        info!("[Frequency] Applied {} steps, cumulative {}", applied, cumulative);
        Ok(cumulative)
    }

    fn send_plan<P: Port, D: SystemClock>(
        &self,
        driver: &mut CrtcDriver<P, D>,
        plan: &TrimPlan,
    ) -> Result<(), CompensatorError> {
        let (thousand, ten) = plan.direction.symbols();
        debug!("[Frequency] Sending {:?}", plan);
        for _ in 0..plan.thousands {
            driver.send(thousand, None)?;
        }
        for _ in 0..plan.tens {
            driver.send(ten, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock::TestClock;
    use crate::config::DeviceConfig;
    use crate::link::scripted::ScriptedPort;
    use crate::state::SyncState;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: TestClock,
        port: ScriptedPort,
        driver: CrtcDriver<ScriptedPort, TestClock>,
        compensator: FrequencyCompensator<TestClock>,
        store: StateStore,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let clock = TestClock::new();
        let port = ScriptedPort::new();
        let driver = CrtcDriver::new(port.clone(), clock.clone(), &DeviceConfig::default());
        let compensator = FrequencyCompensator::new(store.clone(), clock.clone());
        Fixture {
            _dir: dir,
            clock,
            port,
            driver,
            compensator,
            store,
        }
    }

    fn seed(f: &Fixture, cumulative_steps: i64) {
        let mut state = SyncState::fresh(f.clock.now());
        state.freq_adj.cumulative_steps = cumulative_steps;
        f.store.save(&state).unwrap();
    }

    #[test]
    fn test_plan_split() {
        let plan = TrimPlan::from_steps(7357.6);
        assert_eq!(
            plan,
            TrimPlan {
                direction: TrimDirection::Up,
                thousands: 7,
                tens: 36
            }
        );
        assert_eq!(plan.signed_steps(), 7360);

        let plan = TrimPlan::from_steps(-1994.0);
        assert_eq!(plan.direction, TrimDirection::Down);
        assert_eq!((plan.thousands, plan.tens), (1, 99));
        assert_eq!(plan.signed_steps(), -1990);
    }

    #[test]
    fn test_one_ms_after_decay_interval() {
        let mut f = fixture();
        seed(&f, 0);
        f.clock.advance(Duration::from_secs(170_000));

        let total = f.compensator.apply(&mut f.driver, false, 1.0).unwrap();
        assert_eq!(total, 7360);
        assert_eq!(f.port.count_written('o'), 7);
        assert_eq!(f.port.count_written('x'), 36);

        // thousands before tens, nothing awaited
        let written = f.port.written();
        assert!(written.starts_with("ooooooox"));
        assert_eq!(written.len(), 43);

        let stored = f.store.load_or_init(f.clock.now()).unwrap().freq_adj;
        assert_eq!(stored.cumulative_steps, 7360);
        assert_eq!(stored.last_adjustment, f.clock.now());
    }

    #[test]
    fn test_offset_within_tolerance_is_noop() {
        let mut f = fixture();
        seed(&f, 420);
        let before = f.store.load_or_init(f.clock.now()).unwrap();
        f.clock.advance(Duration::from_secs(3600));

        let total = f.compensator.apply(&mut f.driver, false, 0.5).unwrap();
        assert_eq!(total, 420);
        assert!(f.port.written().is_empty());
        assert_eq!(f.store.load_or_init(f.clock.now()).unwrap(), before);
    }

    #[test]
    fn test_negative_offset_trims_down_and_accumulates() {
        let mut f = fixture();
        seed(&f, 5000);
        // instant drift: full magnitude
        let total = f.compensator.apply(&mut f.driver, false, -2.0).unwrap();
        assert_eq!(total, 5000 - 20_000);
        assert_eq!(f.port.count_written('i'), 20);
        assert_eq!(f.port.count_written('z'), 0);
        assert_eq!(f.port.count_written('o'), 0);
    }

    #[test]
    fn test_restart_replays_stored_total() {
        let mut f = fixture();
        seed(&f, -1230);
        f.clock.advance(Duration::from_secs(60));

        let total = f.compensator.apply(&mut f.driver, true, 0.0).unwrap();
        assert_eq!(total, -1230);
        assert_eq!(f.port.count_written('i'), 1);
        assert_eq!(f.port.count_written('z'), 23);

        // replay re-establishes the baseline instead of adding to it
        let stored = f.store.load_or_init(f.clock.now()).unwrap().freq_adj;
        assert_eq!(stored.cumulative_steps, -1230);
        assert_eq!(stored.last_adjustment, f.clock.now());
    }

    #[test]
    fn test_steps_shrink_with_slower_drift() {
        assert_eq!(steps_for(0.0, 3.0), 20_000.0);
        assert!(steps_for(1e6, 1.0) < steps_for(1e5, 1.0));
        assert!(steps_for(1e5, -1.0) < 0.0);
    }
}
