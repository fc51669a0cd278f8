//! Durable record of what the daemon has learned about the device.
//!
//! Stored as one JSON object. Every logical update loads, mutates and
//! rewrites the whole file through a temp file + rename, so a crash mid
//! write leaves the previous record intact.

use crate::error::StateError;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// History of oscillator trims applied to the device.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FrequencyAdjustment {
    pub last_adjustment: DateTime<Utc>,
    pub cumulative_steps: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncState {
    /// Last offset (ms) certified as trustworthy.
    pub average: f64,
    pub freq_adj: FrequencyAdjustment,
    pub stable_system: bool,
}

impl SyncState {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        SyncState {
            average: 0.0,
            freq_adj: FrequencyAdjustment {
                last_adjustment: now,
                cumulative_steps: 0,
            },
            stable_system: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record, creating it with defaults on first run.
    pub fn load_or_init(&self, now: DateTime<Utc>) -> Result<SyncState, StateError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("[State] No state at {}, creating defaults", self.path.display());
                let state = SyncState::fresh(now);
                self.save(&state)?;
                Ok(state)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, state: &SyncState) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("[State] Saved {:?}", state);
        Ok(())
    }

    /// Read-modify-write of the record as one critical section.
    pub fn update<T>(
        &self,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut SyncState) -> T,
    ) -> Result<T, StateError> {
        let mut state = self.load_or_init(now)?;
        let out = f(&mut state);
        self.save(&state)?;
        Ok(out)
    }

    /// Explicit reset: forget everything.
    pub fn reset(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
