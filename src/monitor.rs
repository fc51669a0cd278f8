//! Long-running offset statistics kept by `peerlog`.
//!
//! Each sample is the device offset minus the reference offset (ms). The
//! record keeps the newest samples plus hourly, daily and weekly rollups,
//! and is persisted as JSON the same way as [`crate::state`].

use crate::error::StateError;
use chrono::{DateTime, Datelike, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Samples kept, newest first. 99 samples at 15 min cover the last day.
pub const MAX_SAMPLES: usize = 99;

/// Samples averaged for the last-hour mean.
pub const HOUR_SAMPLES: usize = 4;

/// Daily means kept for the running week.
pub const MAX_DAILY: usize = 7;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MonitorRecord {
    /// Newest first.
    pub samples: VecDeque<f64>,
    pub hour_mean: f64,
    pub day_mean: f64,
    /// One mean per finished UTC day, newest first.
    pub daily_means: VecDeque<f64>,
    pub running_week: f64,
    /// Running-week mean at the end of each ISO week, keyed `"{year}_{week}"`.
    pub weeks: BTreeMap<String, f64>,
    pub last_sample_at: Option<DateTime<Utc>>,
}

impl MonitorRecord {
    /// Add one sample taken at `now` and refresh every rollup.
    pub fn record(&mut self, offset: f64, now: DateTime<Utc>) {
        if let Some(previous) = self.last_sample_at {
            if now.date_naive() != previous.date_naive() && !self.samples.is_empty() {
                self.close_day(previous, now);
            }
        }

        self.samples.push_front(offset);
        self.samples.truncate(MAX_SAMPLES);
        self.hour_mean = mean(self.samples.iter().take(HOUR_SAMPLES));
        self.day_mean = mean(self.samples.iter());
        self.last_sample_at = Some(now);
    }

    fn close_day(&mut self, previous: DateTime<Utc>, now: DateTime<Utc>) {
        self.daily_means.push_front(self.day_mean);
        self.daily_means.truncate(MAX_DAILY);
        self.running_week = mean(self.daily_means.iter());
        info!(
            "[Monitor] Day {} closed at {:+.3} ms, running week {:+.3} ms",
            previous.date_naive(),
            self.day_mean,
            self.running_week
        );

        let last_week = previous.iso_week();
        if now.iso_week() != last_week {
            let key = week_key(previous);
            info!("[Monitor] Week {} closed at {:+.3} ms", key, self.running_week);
            self.weeks.insert(key, self.running_week);
        }
    }
}

fn week_key(at: DateTime<Utc>) -> String {
    let week = at.iso_week();
    format!("{}_{}", week.year(), week.week())
}

fn mean<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[derive(Debug, Clone)]
pub struct MonitorStore {
    path: PathBuf,
}

impl MonitorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MonitorStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. A missing file is an empty record.
    pub fn load(&self) -> Result<MonitorRecord, StateError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(MonitorRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, record: &MonitorRecord) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("[Monitor] Saved {} samples", record.samples.len());
        Ok(())
    }

    /// Load, add one sample, save. Returns the updated record.
    pub fn record(&self, offset: f64, now: DateTime<Utc>) -> Result<MonitorRecord, StateError> {
        let mut record = self.load()?;
        record.record(offset, now);
        self.save(&record)?;
        Ok(record)
    }

    pub fn reset(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
