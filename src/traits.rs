use crate::error::{LinkError, SourceError};
use crate::ntp::{DaemonState, PeerQuery, PeerRecord};

/// Raw serial byte channel underneath the device link.
#[cfg_attr(test, mockall::automock)]
pub trait Port {
    fn open(&mut self) -> Result<(), LinkError>;

    /// Release the port. Closing an already closed port is a no-op.
    fn close(&mut self);

    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError>;

    /// Copy whatever bytes are pending into `buf`.
    /// Returns Ok(0) when nothing arrived within the port's poll slice.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
}

/// The time daemon the device feeds and the reference peer is monitored through.
#[cfg_attr(test, mockall::automock)]
pub trait ReferenceSource {
    /// Read the requested fields of one peer's row.
    fn poll(&mut self, peer: &str, query: PeerQuery) -> Result<PeerRecord, SourceError>;

    /// Make sure the daemon is running, restarting it if it is not.
    fn ensure_running(&mut self) -> Result<DaemonState, SourceError>;

    /// Stop the daemon, step the host against the network reference, restart it.
    fn force_resync(&mut self) -> Result<(), SourceError>;
}
