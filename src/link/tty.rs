use crate::error::LinkError;
use crate::traits::Port;
use log::debug;
use nix::fcntl::OFlag;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

/// Serial device node driven in raw mode.
///
/// Reads use VMIN=0/VTIME=1: a read returns whatever arrived, or nothing
/// after 100 ms, so the link above can enforce its own timeout.
pub struct TtyPort {
    path: PathBuf,
    baud: BaudRate,
    file: Option<File>,
}

impl TtyPort {
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32) -> Result<Self, LinkError> {
        Ok(TtyPort {
            path: path.into(),
            baud: baud_from(baud_rate)?,
            file: None,
        })
    }

    fn configure(&self, file: &File) -> io::Result<()> {
        let mut tio = termios::tcgetattr(file)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, self.baud)?;
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
        termios::tcsetattr(file, SetArg::TCSANOW, &tio)?;
        Ok(())
    }

    fn file(&mut self) -> Result<&mut File, LinkError> {
        self.file.as_mut().ok_or(LinkError::Closed)
    }
}

fn baud_from(rate: u32) -> Result<BaudRate, LinkError> {
    Ok(match rate {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => return Err(LinkError::BaudRate(other)),
    })
}

impl Port for TtyPort {
    fn open(&mut self) -> Result<(), LinkError> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NOCTTY.bits())
            .open(&self.path)?;
        self.configure(&file)?;
        debug!("[Link] Opened {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("[Link] Closed {}", self.path.display());
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        let file = self.file()?;
        file.write_all(&[byte])?;
        file.flush()?;
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match self.file()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
