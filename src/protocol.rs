//! CRTC command protocol.
//!
//! Commands are short ASCII strings sent one character at a time. The
//! device answers with newline-terminated status lines, interleaved with
//! its regular output:
//!
//! - `$PSRFTXT,ACK` acknowledges a command
//! - `$PSRFTXT,Y` / `$PSRFTXT,N` answers the restart query `p`
//! - `054,A,0000` / `054,V,0000` carries the time-valid flag
//!
//! Time is set with `t` + `HHMMSSfff`, the date with `d` + `DDMMYYYY`.
//! `+` / `-` step the output by one millisecond.

use crate::clock::{elapsed_since, SystemClock};
use crate::config::DeviceConfig;
use crate::error::LinkError;
use crate::link::DeviceLink;
use crate::traits::Port;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::time::Duration;

/// Sent when a command times out; the device can stall waiting for more input.
pub const UNBLOCK_SEQUENCE: &str = "1111111111";
pub const FILLER: &str = "1";

/// A response line shape with a single capture: `prefix (choice|...) suffix`.
///
/// The capture may also appear wrapped in parentheses, as some firmware
/// revisions echo `PSRFTXT,(ACK)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern {
    prefix: &'static str,
    choices: &'static [&'static str],
    suffix: &'static str,
}

pub const ACK: Pattern = Pattern::new("PSRFTXT,", &["ACK"], "");
pub const RESTART: Pattern = Pattern::new("PSRFTXT,", &["Y", "N"], "");
pub const VALIDITY: Pattern = Pattern::new("054,", &["A", "V"], ",0000");

impl Pattern {
    pub const fn new(
        prefix: &'static str,
        choices: &'static [&'static str],
        suffix: &'static str,
    ) -> Self {
        Pattern {
            prefix,
            choices,
            suffix,
        }
    }

    /// The captured alternative, if the pattern occurs anywhere in `line`.
    pub fn capture(&self, line: &str) -> Option<&'static str> {
        line.match_indices(self.prefix).find_map(|(idx, _)| {
            let rest = &line[idx + self.prefix.len()..];
            self.choices.iter().copied().find(|choice| {
                let bare = rest
                    .strip_prefix(*choice)
                    .map_or(false, |tail| tail.starts_with(self.suffix));
                let wrapped = rest
                    .strip_prefix('(')
                    .and_then(|r| r.strip_prefix(*choice))
                    .and_then(|r| r.strip_prefix(')'))
                    .map_or(false, |tail| tail.starts_with(self.suffix));
                bare || wrapped
            })
        })
    }
}

/// Result of [`CrtcDriver::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A line matched; carries the captured alternative.
    Ack(&'static str),
    /// Fire and forget: nothing was awaited.
    Raw,
    /// No matching line arrived; the unblock sequence was sent.
    /// Callers that need certainty must treat this as a failure.
    TimedOut,
}

impl Reply {
    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack(_))
    }
}

/// Device time-valid flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
}

pub struct CrtcDriver<P: Port, C: SystemClock> {
    link: DeviceLink<P, C>,
    response_timeout: Duration,
    latency: chrono::Duration,
    date_settle: Duration,
    pulse_delay: Duration,
}

impl<P: Port, C: SystemClock> CrtcDriver<P, C> {
    pub fn new(port: P, clock: C, config: &DeviceConfig) -> Self {
        CrtcDriver {
            link: DeviceLink::new(port, clock, Duration::from_millis(config.char_delay_ms)),
            response_timeout: config.response_timeout(),
            latency: chrono::Duration::milliseconds(config.latency_compensation_ms as i64),
            date_settle: Duration::from_millis(config.date_settle_ms),
            pulse_delay: Duration::from_millis(config.pulse_delay_ms),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Write `command` and, unless `expect` is `None`, wait for a matching line.
    pub fn send(&mut self, command: &str, expect: Option<Pattern>) -> Result<Reply, LinkError> {
        let timeout = self.response_timeout;
        self.link.session(|link| {
            link.write(command)?;
            let pattern = match expect {
                Some(p) => p,
                None => return Ok(Reply::Raw),
            };
            let start = link.clock().now();
            loop {
                let remaining = timeout.saturating_sub(elapsed_since(link.clock(), start));
                let line = if remaining.is_zero() {
                    None
                } else {
                    match link.read_line(remaining) {
                        Ok(line) => Some(line),
                        Err(LinkError::Timeout(_)) => None,
                        Err(e) => return Err(e),
                    }
                };
                match line {
                    Some(line) => {
                        if let Some(capture) = pattern.capture(&line) {
                            debug!("[Protocol] {:?} -> {}", command, capture);
                            return Ok(Reply::Ack(capture));
                        }
                    }
                    None => {
                        warn!("[Protocol] No reply to {:?}, sending unblock sequence", command);
                        link.write(UNBLOCK_SEQUENCE)?;
                        return Ok(Reply::TimedOut);
                    }
                }
            }
        })
    }

    /// Read one fresh line of regular device output; complete lines buffered
    /// during earlier exchanges are dropped first.
    /// `Ok(None)` means the device stayed silent for the response timeout.
    pub fn probe(&mut self) -> Result<Option<String>, LinkError> {
        let timeout = self.response_timeout;
        self.link.discard_stale_lines();
        match self.link.session(|link| link.read_line(timeout)) {
            Ok(line) => Ok(Some(line)),
            Err(LinkError::Timeout(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read one line and decode the time-valid flag, if the line carries it.
    pub fn read_validity(&mut self) -> Result<Option<Validity>, LinkError> {
        Ok(self.probe()?.and_then(|line| match VALIDITY.capture(&line) {
            Some("A") => Some(Validity::Valid),
            Some(_) => Some(Validity::Invalid),
            None => None,
        }))
    }

    /// Ask whether the device lost power since it was last asked.
    /// `None` when the answer could not be obtained.
    pub fn query_restart(&mut self) -> Result<Option<bool>, LinkError> {
        Ok(match self.send("p", Some(RESTART))? {
            Reply::Ack(answer) => Some(answer == "Y"),
            _ => None,
        })
    }

    /// Set the device's date and time to now + `delta_ms`.
    ///
    /// Time goes first: a date command disturbs an in-flight time command
    /// less than the reverse. Repeats until both are acknowledged.
    pub fn push_date_time(&mut self, delta_ms: f64) -> Result<(), LinkError> {
        let delta = chrono::Duration::microseconds((delta_ms * 1000.0).round() as i64);
        loop {
            let target = self.link.clock().now() + delta + self.latency;
            let time_reply = self.send(&time_command(target), Some(ACK))?;
            self.link.clock().sleep(self.date_settle);

            let target = self.link.clock().now() + delta;
            let date_reply = self.send(&date_command(target), Some(ACK))?;

            if time_reply.is_ack() && date_reply.is_ack() {
                info!("[Protocol] Date and time pushed (delta {:+.3} ms)", delta_ms);
                return Ok(());
            }
            warn!(
                "[Protocol] Date/time push not acknowledged (time {:?}, date {:?}), retrying",
                time_reply, date_reply
            );
        }
    }

    /// Step the output by `round(delta_ms)` single-millisecond pulses.
    pub fn step_milliseconds(&mut self, delta_ms: f64) -> Result<(), LinkError> {
        let steps = delta_ms.round() as i64;
        if steps == 0 {
            return Ok(());
        }
        let symbol = if steps > 0 { "+" } else { "-" };
        info!("[Protocol] Stepping {} ms ({})", steps, symbol);
        for _ in 0..steps.unsigned_abs() {
            self.send(symbol, None)?;
            self.link.clock().sleep(self.pulse_delay);
        }
        Ok(())
    }

    /// One fire-and-forget filler character, used to unstick a waiting device.
    pub fn send_filler(&mut self) -> Result<(), LinkError> {
        self.send(FILLER, None).map(|_| ())
    }
}

pub fn time_command(at: DateTime<Utc>) -> String {
    format!("t{}", at.format("%H%M%S%3f"))
}

pub fn date_command(at: DateTime<Utc>) -> String {
    format!("d{}", at.format("%d%m%Y"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock::TestClock;
    use crate::link::scripted::{ScriptedPort, StreamingPort};
    use chrono::TimeZone;

    fn driver(port: &ScriptedPort, clock: &TestClock) -> CrtcDriver<ScriptedPort, TestClock> {
        CrtcDriver::new(port.clone(), clock.clone(), &DeviceConfig::default())
    }

    #[test]
    fn test_pattern_capture() {
        assert_eq!(ACK.capture("$PSRFTXT,ACK*5F"), Some("ACK"));
        assert_eq!(ACK.capture("PSRFTXT,(ACK)"), Some("ACK"));
        assert_eq!(RESTART.capture("$PSRFTXT,Y"), Some("Y"));
        assert_eq!(VALIDITY.capture("$GPRMC,054,V,0000"), Some("V"));
        assert_eq!(VALIDITY.capture("054,A,0001"), None);
        assert_eq!(ACK.capture("$PSRFTXT,NAK"), None);
    }

    #[test]
    fn test_send_reassembles_split_ack() {
        let port = ScriptedPort::new();
        let clock = TestClock::new();
        port.push("PSRFTXT,(A");
        port.push("CK)\n");
        let reply = driver(&port, &clock).send("x", Some(ACK)).unwrap();
        assert_eq!(reply, Reply::Ack("ACK"));
        assert_eq!(port.written(), "x");
        assert!(!port.is_open());
    }

    #[test]
    fn test_send_skips_unrelated_lines() {
        let port = ScriptedPort::new();
        let clock = TestClock::new();
        port.push("054,A,0000\r\n$GPZDA,140507\r\n");
        port.push("$PSRFTXT,ACK\r\n");
        let reply = driver(&port, &clock).send("o", Some(ACK)).unwrap();
        assert_eq!(reply, Reply::Ack("ACK"));
    }

    #[test]
    fn test_timeout_sends_unblock_and_reports_degraded() {
        let port = ScriptedPort::new();
        let clock = TestClock::new();
        let start = clock.now();
        let reply = driver(&port, &clock).send("p", Some(RESTART)).unwrap();
        assert_eq!(reply, Reply::TimedOut);
        assert!(!reply.is_ack());
        assert_eq!(port.written(), format!("p{}", UNBLOCK_SEQUENCE));
        let waited = elapsed_since(&clock, start);
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
    }

    #[test]
    fn test_streaming_unrelated_lines_still_times_out() {
        let clock = TestClock::new();
        let port = StreamingPort {
            clock: clock.clone(),
            chunk: "$GPZDA,140507\n",
            per_read: Duration::from_millis(50),
            reads: 0,
        };
        let mut d = CrtcDriver::new(port, clock.clone(), &DeviceConfig::default());
        let start = clock.now();

        assert_eq!(d.send("p", Some(RESTART)).unwrap(), Reply::TimedOut);
        let waited = elapsed_since(&clock, start);
        // pacing of "p" plus the 3 s budget plus the unblock sequence
        assert!(waited < Duration::from_secs(4), "{:?}", waited);
    }

    #[test]
    fn test_status_read_skips_lines_left_by_a_command() {
        let port = ScriptedPort::new();
        let clock = TestClock::new();
        let mut d = driver(&port, &clock);
        port.push("$PSRFTXT,ACK\n054,V,0000\n");
        assert!(d.send("d", Some(ACK)).unwrap().is_ack());

        port.push("054,A,0000\n");
        assert_eq!(d.read_validity().unwrap(), Some(Validity::Valid));
    }

    #[test]
    fn test_fire_and_forget_does_not_read() {
        let port = ScriptedPort::new();
        let clock = TestClock::new();
        port.push("$PSRFTXT,ACK\n");
        assert_eq!(driver(&port, &clock).send("+", None).unwrap(), Reply::Raw);
        // the queued line is still unread
        let mut d = driver(&port, &clock);
        assert_eq!(d.probe().unwrap().as_deref(), Some("$PSRFTXT,ACK"));
    }

    #[test]
    fn test_command_formats() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 4, 5, 7).unwrap() + chrono::Duration::milliseconds(89);
        assert_eq!(time_command(at), "t040507089");
        assert_eq!(date_command(at), "d09032024");
    }

    #[test]
    fn test_push_date_time_sends_time_then_date() {
        let port = ScriptedPort::new();
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 58).unwrap());
        port.push("$PSRFTXT,ACK\n");
        port.push("$PSRFTXT,ACK\n");
        driver(&port, &clock).push_date_time(0.0).unwrap();

        let written = port.written();
        assert!(written.starts_with("t235958343"), "{}", written);
        assert_eq!(written.find('d'), Some(10));
        assert_eq!(written.len(), 19);
    }

    #[test]
    fn test_push_date_time_applies_delta_and_latency() {
        let port = ScriptedPort::new();
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap());
        port.push("$PSRFTXT,ACK\n");
        port.push("$PSRFTXT,ACK\n");
        driver(&port, &clock).push_date_time(1500.0).unwrap();
        // 12:00:00.000 + 1500 ms + 343 ms latency
        assert!(port.written().starts_with("t120001843"), "{}", port.written());
        assert!(port.written().ends_with("d09032024"));
    }

    #[test]
    fn test_push_date_time_retries_until_both_acknowledged() {
        let port = ScriptedPort::new();
        let clock = TestClock::new();
        port.reply_on('t', &[Some("$PSRFTXT,ACK\n"), Some("$PSRFTXT,ACK\n")]);
        port.reply_on('d', &[None, Some("$PSRFTXT,ACK\n")]);

        driver(&port, &clock).push_date_time(0.0).unwrap();
        assert_eq!(port.count_written('t'), 2);
        assert_eq!(port.count_written('d'), 2);
        assert!(port.count_written('1') >= UNBLOCK_SEQUENCE.len());
    }

    #[test]
    fn test_step_milliseconds() {
        let port = ScriptedPort::new();
        let clock = TestClock::new();
        let mut d = driver(&port, &clock);
        d.step_milliseconds(-3.4).unwrap();
        assert_eq!(port.written(), "---");
        d.step_milliseconds(0.4).unwrap();
        assert_eq!(port.written(), "---");
        d.step_milliseconds(2.6).unwrap();
        assert_eq!(port.written(), "---+++");
    }

    #[test]
    fn test_query_restart_and_validity() {
        let port = ScriptedPort::new();
        let clock = TestClock::new();
        let mut d = driver(&port, &clock);
        port.push("$PSRFTXT,Y\n");
        assert_eq!(d.query_restart().unwrap(), Some(true));
        port.push("$PSRFTXT,N\n");
        assert_eq!(d.query_restart().unwrap(), Some(false));
        assert_eq!(d.query_restart().unwrap(), None);

        port.push("054,V,0000\n");
        port.push("054,A,0000\n");
        port.push("$GPZDA\n");
        assert_eq!(d.read_validity().unwrap(), Some(Validity::Invalid));
        assert_eq!(d.read_validity().unwrap(), Some(Validity::Valid));
        assert_eq!(d.read_validity().unwrap(), None);
        assert_eq!(d.read_validity().unwrap(), None);
    }
}
