//! Serial Session Library
//!
//! This library provides exclusive, fault-aware streaming sessions over serial
//! devices: one session per device, lockable read/write channels, transient
//! fault recovery without byte loss, and device presence eventing.
//!
//! # Modules
//!
//! - `config`: Session configuration and line-format parameters
//! - `error`: Unified error handling
//! - `signals`: Control-line (DTR/RTS/break, CTS/DSR/RI/DCD) types
//! - `channel`: Lockable byte channels and their read/write handles
//! - `session`: Per-device session lifecycle and pump tasks
//! - `transform`: Byte-stream transform stages with cancellation plumbing
//! - `registry`: Device discovery, session memoization, presence events
//! - `transport`: Transport traits plus serial and mock backends

pub mod channel;
pub mod config;
pub mod error;
pub mod registry;
pub mod session;
pub mod signals;
pub mod transform;
pub mod transport;

// Re-export commonly used types for convenience
pub use channel::{ChannelStatus, Direction, ReadChannel, ReadHandle, ReadOutcome, WriteChannel, WriteHandle};
pub use config::{DataBits, FlowControl, Parity, SessionConfig, StopBits};
pub use error::{SessionError, SessionResult};
pub use registry::{DeviceRegistry, PresenceEvent, PresenceKind, PresenceSubscription};
pub use session::{PortSession, SessionMetrics, SessionState};
pub use signals::{ControlSignals, InputSignals, OutputSignals, SignalUpdate};
pub use transform::{
    ByteSink, ByteSource, ByteTransform, Completion, TransformReader, TransformWriter,
};
pub use transport::{
    DeviceId, FatalFault, MockBackend, MockTransport, ReadStep, SerialBackend, SerialTransport,
    TransientFault, Transport, TransportBackend, TransportError, TransportFault,
};
