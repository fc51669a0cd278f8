use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub device: DeviceConfig,
    pub reference: ReferenceConfig,
    pub adjust: AdjustConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub serial_address: String,
    pub baud_rate: u32,
    pub char_delay_ms: u64,          // pacing between written characters
    pub response_timeout_ms: u64,
    pub latency_compensation_ms: u64, // serial transfer time before the device applies a time command
    pub date_settle_ms: u64,         // pause between the time and date commands
    pub pulse_delay_ms: u64,
    pub invalid_settle_secs: u64,    // wait after re-pushing date/time on an invalid flag
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub reference_peer: String,
    pub device_peer: String,
    pub local_offset_bound_ms: f64,
    pub local_jitter_bound_ms: f64,
    pub std_limit_ms: f64,
    pub std_limit_step_ms: f64,
    pub sample_interval_secs: u64,
    pub ntpq_command: String,
    pub ntpdate_command: String,
    pub daemon_script: String,
    pub daemon_process: String,
    pub restart_settle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjustConfig {
    pub coarse_threshold_ms: f64, // beyond this the date/time is re-pushed instead of stepped
    pub tolerance_ms: f64,
    pub frequency_adjust: bool,
    pub settle_secs: u64,
    pub cycle_interval_secs: u64,
    pub storage_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub storage_path: PathBuf,
    pub interval_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            serial_address: "/dev/ttyU0".to_string(),
            baud_rate: 4800,
            char_delay_ms: 10,
            response_timeout_ms: 3000,
            latency_compensation_ms: 343,
            date_settle_ms: 1000,
            pulse_delay_ms: 10,
            invalid_settle_secs: 1800,
        }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            reference_peer: "158.112.160.8".to_string(),
            device_peer: "127.127.20.0".to_string(),
            local_offset_bound_ms: 2.0,
            local_jitter_bound_ms: 2.0,
            std_limit_ms: 1.0,
            std_limit_step_ms: 0.05,
            sample_interval_secs: 20,
            ntpq_command: "/usr/bin/ntpq".to_string(),
            ntpdate_command: "ntpdate".to_string(),
            daemon_script: "/etc/rc.d/ntpd".to_string(),
            daemon_process: "ntpd".to_string(),
            restart_settle_secs: 120,
        }
    }
}

impl Default for AdjustConfig {
    fn default() -> Self {
        AdjustConfig {
            coarse_threshold_ms: 200.0,
            tolerance_ms: 1.0,
            frequency_adjust: false,
            settle_secs: 1800,
            cycle_interval_secs: 60,
            storage_path: PathBuf::from("/mnt/tmpfs/crtcsync-state.json"),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            storage_path: PathBuf::from("/var/db/crtcsync-monitor.json"),
            interval_secs: 900,
        }
    }
}

impl DeviceConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl SystemConfig {
    /// Load a JSON config file. Missing keys fall back to the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values the control loop cannot work with.
    pub fn check(&self) -> Result<()> {
        if self.reference.std_limit_ms <= 0.0 {
            bail!("reference.std_limit_ms must be positive");
        }
        if self.reference.std_limit_step_ms <= 0.0 {
            bail!("reference.std_limit_step_ms must be positive, otherwise sampling may never settle");
        }
        if self.reference.local_offset_bound_ms < 0.0 || self.reference.local_jitter_bound_ms < 0.0 {
            bail!("local peer bounds must not be negative");
        }
        if self.adjust.tolerance_ms <= 0.0 || self.adjust.coarse_threshold_ms <= self.adjust.tolerance_ms {
            bail!("adjust.coarse_threshold_ms must exceed adjust.tolerance_ms > 0");
        }
        if self.monitor.interval_secs == 0 {
            bail!("monitor.interval_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_pass_check() {
        let config = SystemConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.device.baud_rate, 4800);
        assert_eq!(config.reference.std_limit_ms, 1.0);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "device": {{ "serial_address": "/dev/ttyU3" }}, "adjust": {{ "frequency_adjust": true }} }}"#
        )
        .unwrap();

        let config = SystemConfig::from_file(file.path()).unwrap();
        assert_eq!(config.device.serial_address, "/dev/ttyU3");
        assert_eq!(config.device.response_timeout_ms, 3000);
        assert!(config.adjust.frequency_adjust);
        assert_eq!(config.reference.sample_interval_secs, 20);
        assert_eq!(config.monitor.interval_secs, 900);
    }

    #[test]
    fn test_zero_limit_step_rejected() {
        let mut config = SystemConfig::default();
        config.reference.std_limit_step_ms = 0.0;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_zero_monitor_interval_rejected() {
        let mut config = SystemConfig::default();
        config.monitor.interval_secs = 0;
        assert!(config.check().is_err());
    }
}
