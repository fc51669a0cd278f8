//! Reference source backed by the local ntpd.
//!
//! The daemon is queried through `ntpq -pn`. Each peer row carries the
//! fields the core needs: offset and jitter of the peer against the host,
//! the reachability register, the stratum and the seconds since the peer
//! last delivered a sample.

use crate::clock::SystemClock;
use crate::config::ReferenceConfig;
use crate::error::SourceError;
use crate::traits::ReferenceSource;
use log::{debug, info, warn};
use std::process::Command;
use std::time::Duration;

/// Reachability register value meaning the last eight polls all succeeded.
pub const REACH_FULL: u8 = 0o377;

/// Fields to read from a peer row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerQuery {
    pub offset: bool,
    pub jitter: bool,
    pub reach: bool,
    pub when: bool,
    pub stratum: bool,
}

impl PeerQuery {
    pub fn offset() -> Self {
        PeerQuery {
            offset: true,
            ..Default::default()
        }
    }

    pub fn reach() -> Self {
        PeerQuery {
            reach: true,
            ..Default::default()
        }
    }

    pub fn when() -> Self {
        PeerQuery {
            when: true,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn with_stratum(mut self) -> Self {
        self.stratum = true;
        self
    }
}

/// Time since a peer last contributed a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastUpdate {
    Seconds(u64),
    Never,
}

impl LastUpdate {
    /// Value used when summing readings over the recovery window: never counts as 0.
    pub fn recovery_seconds(self) -> u64 {
        match self {
            LastUpdate::Seconds(s) => s,
            LastUpdate::Never => 0,
        }
    }

    fn parse(field: &str) -> Option<Self> {
        if field == "-" {
            return Some(LastUpdate::Never);
        }
        let (digits, scale) = match field.as_bytes().last()? {
            b'm' => (&field[..field.len() - 1], 60),
            b'h' => (&field[..field.len() - 1], 3600),
            b'd' => (&field[..field.len() - 1], 86_400),
            _ => (field, 1),
        };
        digits
            .parse::<u64>()
            .ok()
            .and_then(|v| v.checked_mul(scale))
            .map(LastUpdate::Seconds)
    }
}

/// Answer to a [`PeerQuery`]. Only requested fields are populated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PeerRecord {
    pub peer: String,
    pub offset_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub reach: Option<u8>,
    pub when: Option<LastUpdate>,
    pub stratum: Option<u8>,
}

impl PeerRecord {
    pub fn offset(&self) -> Result<f64, SourceError> {
        self.offset_ms.ok_or_else(|| self.missing("offset"))
    }

    pub fn jitter(&self) -> Result<f64, SourceError> {
        self.jitter_ms.ok_or_else(|| self.missing("jitter"))
    }

    pub fn reach(&self) -> Result<u8, SourceError> {
        self.reach.ok_or_else(|| self.missing("reach"))
    }

    pub fn when(&self) -> Result<LastUpdate, SourceError> {
        self.when.ok_or_else(|| self.missing("when"))
    }

    pub fn stratum(&self) -> Result<u8, SourceError> {
        self.stratum.ok_or_else(|| self.missing("stratum"))
    }

    fn missing(&self, field: &'static str) -> SourceError {
        SourceError::Field {
            peer: self.peer.clone(),
            field,
        }
    }
}

/// Whether `ensure_running` found the daemon alive or had to bring it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Running,
    Restarted,
}

/// Find `peer` in `ntpq -pn` output and project the requested fields.
///
/// Columns: remote refid st t when poll reach delay offset jitter.
/// The remote column may carry a one-character tally prefix.
pub fn parse_peer(output: &str, peer: &str, query: PeerQuery) -> Result<PeerRecord, SourceError> {
    let row = output
        .lines()
        .map(|line| line.trim_start_matches([' ', '*', '+', '-', '#', '.', 'o', 'x']))
        .find(|line| line.split_whitespace().next() == Some(peer))
        .ok_or_else(|| SourceError::PeerNotListed(peer.to_string()))?;

    let cols: Vec<&str> = row.split_whitespace().collect();
    let field = |idx: usize, name: &'static str| {
        cols.get(idx).copied().ok_or(SourceError::Field {
            peer: peer.to_string(),
            field: name,
        })
    };
    let bad = |name: &'static str| SourceError::Field {
        peer: peer.to_string(),
        field: name,
    };

    let mut record = PeerRecord {
        peer: peer.to_string(),
        ..Default::default()
    };
    if query.stratum {
        record.stratum = Some(field(2, "stratum")?.parse().map_err(|_| bad("stratum"))?);
    }
    if query.when {
        record.when = Some(LastUpdate::parse(field(4, "when")?).ok_or_else(|| bad("when"))?);
    }
    if query.reach {
        record.reach = Some(u8::from_str_radix(field(6, "reach")?, 8).map_err(|_| bad("reach"))?);
    }
    if query.offset {
        record.offset_ms = Some(field(8, "offset")?.parse().map_err(|_| bad("offset"))?);
    }
    if query.jitter {
        record.jitter_ms = Some(field(9, "jitter")?.parse().map_err(|_| bad("jitter"))?);
    }
    Ok(record)
}

/// [`ReferenceSource`] that shells out to the ntp tooling.
pub struct NtpqSource<C: SystemClock> {
    config: ReferenceConfig,
    clock: C,
}

impl<C: SystemClock> NtpqSource<C> {
    pub fn new(config: &ReferenceConfig, clock: C) -> Self {
        NtpqSource {
            config: config.clone(),
            clock,
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String, SourceError> {
        let rendered = format!("{} {}", program, args.join(" "));
        debug!("[Reference] Running {}", rendered);
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| SourceError::command(&rendered, e))?;
        if !output.status.success() {
            return Err(SourceError::command(
                &rendered,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn resync(&self) -> Result<(), SourceError> {
        let script = &self.config.daemon_script;
        if let Err(e) = self.run(script, &["stop"]) {
            warn!("[Reference] Stopping daemon failed (continuing): {}", e);
        }
        self.run(&self.config.ntpdate_command, &["-u", &self.config.reference_peer])?;
        self.run(script, &["restart"])?;
        info!(
            "[Reference] Daemon restarted, settling for {}s",
            self.config.restart_settle_secs
        );
        self.clock
            .sleep(Duration::from_secs(self.config.restart_settle_secs));
        Ok(())
    }
}

impl<C: SystemClock> ReferenceSource for NtpqSource<C> {
    fn poll(&mut self, peer: &str, query: PeerQuery) -> Result<PeerRecord, SourceError> {
        let output = self.run(&self.config.ntpq_command, &["-pn"])?;
        parse_peer(&output, peer, query)
    }

    fn ensure_running(&mut self) -> Result<DaemonState, SourceError> {
        let status = Command::new("pgrep")
            .arg(&self.config.daemon_process)
            .output()
            .map_err(|e| SourceError::command("pgrep", e))?
            .status;
        if status.success() {
            return Ok(DaemonState::Running);
        }
        warn!(
            "[Reference] {} not running, restarting service",
            self.config.daemon_process
        );
        self.resync()?;
        Ok(DaemonState::Restarted)
    }

    fn force_resync(&mut self) -> Result<(), SourceError> {
        info!("[Reference] Forcing daemon resync against {}", self.config.reference_peer);
        self.resync()
    }
}
