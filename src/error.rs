//! Unified error taxonomy for session, channel, and signal operations.
//!
//! Transport-level faults are defined in [`crate::transport`] and wrapped here
//! once they have been classified by the session.

use crate::transport::{FatalFault, TransientFault};
use thiserror::Error;

/// Convenient `Result` alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur on a port session or one of its channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The supplied configuration is unusable (e.g. zero baud rate).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `open()` was called while the session is already open.
    #[error("session is already open")]
    AlreadyOpen,

    /// The operation requires an open session.
    #[error("session is not open")]
    NotOpen,

    /// The session was permanently invalidated by a fatal fault and cannot be
    /// reopened until the device reconnects.
    #[error("session invalidated: {0}")]
    Invalidated(FatalFault),

    /// The transport could not be claimed (absent device, held elsewhere).
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A handle is already outstanding on this channel.
    #[error("channel is already locked")]
    AlreadyLocked,

    /// A read or write is still suspended on this handle.
    #[error("an operation is in progress on this handle")]
    OperationInProgress,

    /// `close()` was called while a channel handle is still outstanding.
    #[error("channels are still locked")]
    ChannelsStillLocked,

    /// The channel is closed, drained, or otherwise unusable.
    #[error("channel is closed")]
    ChannelClosed,

    /// The handle was released and can no longer be used.
    #[error("handle has been released")]
    HandleReleased,

    /// A named control line is not writable on this transport.
    #[error("control line not writable: {0}")]
    UnsupportedSignal(String),

    /// A recoverable device fault; the session has already installed a
    /// replacement channel for the affected direction.
    #[error("transient device fault: {0}")]
    Transient(TransientFault),

    /// An unrecoverable device fault; the session is invalidated.
    #[error("fatal device fault: {0}")]
    Fatal(FatalFault),

    /// A transform stage failed to map its input.
    #[error("transform failed: {0}")]
    Transform(String),
}

impl SessionError {
    /// Create an `InvalidConfig` error from a message.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a `DeviceUnavailable` error from a message.
    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self::DeviceUnavailable(message.into())
    }
}
