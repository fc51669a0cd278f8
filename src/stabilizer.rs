//! Trusted offset from noisy reference readings.
//!
//! A window of the ten most recent offsets is refined one sample at a
//! time until its spread is small and not growing. The acceptance limit
//! widens a little after every rejected round, so noisy data still ends
//! in a verdict.

use crate::clock::SystemClock;
use crate::config::ReferenceConfig;
use crate::error::SourceError;
use crate::ntp::{DaemonState, PeerQuery, REACH_FULL};
use crate::traits::ReferenceSource;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

pub const WINDOW_LEN: usize = 10;

/// Fixed-capacity FIFO of offsets (ms).
#[derive(Debug, Clone)]
pub struct OffsetWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl OffsetWindow {
    pub fn new(capacity: usize) -> Self {
        OffsetWindow {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append `offset`, evicting and returning the oldest sample when full.
    pub fn push(&mut self, offset: f64) -> Option<f64> {
        self.samples.push_back(offset);
        if self.samples.len() > self.capacity {
            self.samples.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }

    /// Population mean and standard deviation. `(0, 0)` when empty.
    pub fn mean_std(&self) -> (f64, f64) {
        if self.samples.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().sum::<f64>() / n;
        let variance = self.samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        (mean, variance.sqrt())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbstainReason {
    LocalOffset(f64),
    LocalJitter(f64),
    Unreachable(u8),
    DaemonRestarted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StabilityVerdict {
    Stable(f64),
    Abstain(AbstainReason),
}

pub struct Stabilizer<C: SystemClock> {
    clock: C,
    reference_peer: String,
    device_peer: String,
    local_offset_bound: f64,
    local_jitter_bound: f64,
    initial_std_limit: f64,
    std_limit_step: f64,
    sample_interval: Duration,
    limit_trace: Vec<f64>,
}

impl<C: SystemClock> Stabilizer<C> {
    pub fn new(config: &ReferenceConfig, clock: C) -> Self {
        Stabilizer {
            clock,
            reference_peer: config.reference_peer.clone(),
            device_peer: config.device_peer.clone(),
            local_offset_bound: config.local_offset_bound_ms,
            local_jitter_bound: config.local_jitter_bound_ms,
            initial_std_limit: config.std_limit_ms,
            std_limit_step: config.std_limit_step_ms,
            sample_interval: Duration::from_secs(config.sample_interval_secs),
            limit_trace: Vec::new(),
        }
    }

    /// The acceptance limit in force at each refinement round of the last call.
    pub fn limit_trace(&self) -> &[f64] {
        &self.limit_trace
    }

    pub fn get_quality_offset<S: ReferenceSource>(
        &mut self,
        source: &mut S,
    ) -> Result<StabilityVerdict, SourceError> {
        self.limit_trace.clear();

        if let Some(reason) = self.precheck(source)? {
            warn!("[Stabilizer] Local oscillator not trustworthy yet: {:?}", reason);
            return Ok(StabilityVerdict::Abstain(reason));
        }

        let mut window = OffsetWindow::new(WINDOW_LEN);
        while !window.is_full() {
            match self.sample(source)? {
                Some(offset) => window.push(offset),
                None => return Ok(StabilityVerdict::Abstain(AbstainReason::DaemonRestarted)),
            };
            self.clock.sleep(self.sample_interval);
        }
        debug!("[Stabilizer] Initial window {:?}", window);

        let mut std_limit = self.initial_std_limit;
        loop {
            self.limit_trace.push(std_limit);

            let reach = source.poll(&self.reference_peer, PeerQuery::reach())?.reach()?;
            if reach != REACH_FULL {
                warn!("[Stabilizer] Reference reach {:o}, not every poll succeeded", reach);
                return Ok(StabilityVerdict::Abstain(AbstainReason::Unreachable(reach)));
            }

            let (old_avg, old_std) = window.mean_std();
            let offset = match self.sample(source)? {
                Some(offset) => offset,
                None => return Ok(StabilityVerdict::Abstain(AbstainReason::DaemonRestarted)),
            };
            window.push(offset);
            let (new_avg, new_std) = window.mean_std();
            debug!(
                "[Stabilizer] avg {:.3} -> {:.3}, std {:.3} -> {:.3}, limit {:.2}",
                old_avg, new_avg, old_std, new_std, std_limit
            );

            let improving = new_std <= old_std && new_std <= std_limit;
            let converged = new_std <= std_limit / 3.0;
            if improving || converged {
                info!(
                    "[Stabilizer] Stable offset {:.3} ms (std {:.3}, limit {:.2})",
                    new_avg, new_std, std_limit
                );
                return Ok(StabilityVerdict::Stable(new_avg));
            }

            self.clock.sleep(self.sample_interval);
            std_limit += self.std_limit_step;
        }
    }

    /// Local oscillator bounds; `Some` means abstain.
    fn precheck<S: ReferenceSource>(&self, source: &mut S) -> Result<Option<AbstainReason>, SourceError> {
        let local = source.poll(&self.device_peer, PeerQuery::offset().with_jitter())?;
        let offset = local.offset()?;
        if offset.abs() > self.local_offset_bound {
            return Ok(Some(AbstainReason::LocalOffset(offset)));
        }
        let jitter = local.jitter()?;
        if jitter.abs() > self.local_jitter_bound {
            return Ok(Some(AbstainReason::LocalJitter(jitter)));
        }
        Ok(None)
    }

    /// One reference offset; `None` if the daemon had to be restarted first.
    fn sample<S: ReferenceSource>(&self, source: &mut S) -> Result<Option<f64>, SourceError> {
        if source.ensure_running()? == DaemonState::Restarted {
            warn!("[Stabilizer] Daemon restarted mid-sampling, discarding window");
            return Ok(None);
        }
        let offset = source.poll(&self.reference_peer, PeerQuery::offset())?.offset()?;
        Ok(Some(offset))
    }
}
