use crate::clock::{elapsed_since, SystemClock};
use crate::error::LinkError;
use crate::traits::Port;
use log::{debug, trace};
use std::time::Duration;

#[cfg(unix)]
mod tty;
#[cfg(unix)]
pub use self::tty::TtyPort;

/// Wait between empty reads while a line is pending.
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Unterminated bytes kept before the buffer is treated as line noise.
const MAX_PENDING: usize = 512;

/// Line-oriented, paced view of the serial port.
///
/// The receive buffer belongs to the link: a device line may arrive in
/// several fragments, and the unterminated tail is kept across calls until
/// a newline completes it.
pub struct DeviceLink<P: Port, C: SystemClock> {
    port: P,
    clock: C,
    char_delay: Duration,
    rx: String,
}

impl<P: Port, C: SystemClock> DeviceLink<P, C> {
    pub fn new(port: P, clock: C, char_delay: Duration) -> Self {
        DeviceLink {
            port,
            clock,
            char_delay,
            rx: String::new(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Open the port, run `f`, and close the port again whatever `f` returned.
    pub fn session<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        self.port.open()?;
        let result = f(self);
        self.port.close();
        result
    }

    /// Transmit `text` one character at a time; the device drops characters
    /// that arrive back to back.
    pub fn write(&mut self, text: &str) -> Result<(), LinkError> {
        trace!("[Link] -> {:?}", text);
        for byte in text.bytes() {
            self.clock.sleep(self.char_delay);
            self.port.write_byte(byte)?;
        }
        Ok(())
    }

    /// Next complete line from the device, without its terminator.
    ///
    /// Fails with `Timeout` once `timeout` has elapsed, even if the device
    /// keeps sending bytes that never form a line.
    pub fn read_line(&mut self, timeout: Duration) -> Result<String, LinkError> {
        let start = self.clock.now();
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                trace!("[Link] <- {:?}", line);
                return Ok(line);
            }
            if elapsed_since(&self.clock, start) >= timeout {
                debug!("[Link] No line within {:?} ({} bytes pending)", timeout, self.rx.len());
                return Err(LinkError::Timeout(timeout));
            }
            let n = self.port.read_available(&mut chunk)?;
            if n == 0 {
                self.clock.sleep(POLL_INTERVAL);
                continue;
            }
            self.rx.push_str(&String::from_utf8_lossy(&chunk[..n]));
            if !self.rx.contains('\n') && self.rx.len() > MAX_PENDING {
                debug!("[Link] Dropping {} bytes of unterminated noise", self.rx.len());
                self.rx.clear();
            }
        }
    }

    /// Forget complete lines left over from earlier exchanges, keeping an
    /// unterminated tail so a line in flight is still reassembled.
    pub fn discard_stale_lines(&mut self) {
        if let Some(idx) = self.rx.rfind('\n') {
            trace!("[Link] Discarding stale {:?}", &self.rx[..idx]);
            self.rx.replace_range(..=idx, "");
        }
    }

    /// Split the first complete line off the buffer. Blank lines are skipped.
    fn take_line(&mut self) -> Option<String> {
        while let Some(idx) = self.rx.find('\n') {
            let line = self.rx[..idx].trim_end_matches('\r').to_string();
            self.rx.replace_range(..=idx, "");
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }
}
