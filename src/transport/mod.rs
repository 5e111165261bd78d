//! Transport abstraction layer.
//!
//! Defines the `Transport` and `TransportBackend` traits that allow both real
//! serial hardware and mock implementations to be used interchangeably by the
//! session layer, together with the fault taxonomy the session classifies.

mod mock;
mod serial;

pub use mock::{MockBackend, MockTransport, ReadStep};
pub use serial::{SerialBackend, SerialTransport};

use crate::registry::PresenceEvent;
use crate::signals::{InputSignals, SignalUpdate};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Stable identity of one physical serial device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A recoverable device-communication fault. The session supersedes the
/// faulted channel and keeps the transport open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransientFault {
    #[error("receive buffer overrun")]
    BufferOverrun,
    #[error("framing error")]
    Framing,
    #[error("parity error")]
    Parity,
}

/// An unrecoverable fault. The session releases the transport and becomes
/// permanently invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalFault {
    #[error("device removed")]
    DeviceRemoved,
    #[error("transport closed")]
    TransportClosed,
}

/// A fault reported by the transport during a read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportFault {
    #[error(transparent)]
    Transient(TransientFault),
    #[error(transparent)]
    Fatal(FatalFault),
}

/// Errors reported by transport collaborators outside the read/write path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The device cannot be claimed: absent, unauthorized, or held elsewhere.
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// A named control line is not writable on this transport.
    #[error("control line not writable: {0}")]
    UnsupportedSignal(String),

    /// The operation itself hit a device fault.
    #[error(transparent)]
    Fault(#[from] TransportFault),
}

impl TransportError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// One claimed, bidirectional connection to a physical device.
///
/// Read and write chunks may be called concurrently from independent tasks;
/// implementations provide their own interior synchronization. Bytes are
/// opaque to this layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Read the next chunk from the device.
    ///
    /// An empty chunk means "nothing arrived yet, try again" and lets
    /// implementations pace on their own timeout.
    async fn read_chunk(&self) -> Result<Vec<u8>, TransportFault>;

    /// Transmit a chunk to the device.
    async fn write_chunk(&self, data: &[u8]) -> Result<(), TransportFault>;

    /// Update the writable control lines named in `update`, leaving the rest
    /// unchanged.
    async fn set_lines(&self, update: &SignalUpdate) -> Result<(), TransportError>;

    /// Read the current input (read-only) control lines.
    async fn get_lines(&self) -> Result<InputSignals, TransportError>;
}

/// Factory and permission surface over a family of devices.
#[async_trait]
pub trait TransportBackend: Send + Sync + 'static {
    /// The set of device identities the caller is authorized to use.
    fn list_authorized(&self) -> Vec<DeviceId>;

    /// Claim exclusive use of a device with the given configuration.
    async fn claim(
        &self,
        device: &DeviceId,
        config: &crate::config::SessionConfig,
    ) -> Result<Arc<dyn Transport>, TransportError>;

    /// Release a previously claimed device.
    fn release(&self, device: &DeviceId);

    /// Subscribe to the raw connect/disconnect feed for authorized devices.
    fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = TransportFault::Transient(TransientFault::BufferOverrun);
        assert_eq!(fault.to_string(), "receive buffer overrun");

        let fault = TransportFault::Fatal(FatalFault::TransportClosed);
        assert_eq!(fault.to_string(), "transport closed");
    }

    #[test]
    fn test_device_id_roundtrip() {
        let id = DeviceId::from("/dev/ttyUSB0");
        assert_eq!(id.as_str(), "/dev/ttyUSB0");
        assert_eq!(id.to_string(), "/dev/ttyUSB0");
        assert_eq!(id, DeviceId::new("/dev/ttyUSB0"));
    }
}
