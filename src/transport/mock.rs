//! Mock transport implementation for testing.
//!
//! Provides a scripted `MockTransport` that simulates device behavior without
//! hardware, and a `MockBackend` that simulates claiming, permission, and
//! hot-plug presence. Read behavior is a deterministic script of data chunks
//! and injected faults, so recovery sequences can be exercised exactly.

use super::{DeviceId, FatalFault, Transport, TransportBackend, TransportError, TransportFault};
use crate::config::SessionConfig;
use crate::registry::{PresenceEvent, PresenceKind};
use crate::signals::{InputSignals, OutputSignals, SignalUpdate};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

/// One scripted step of the read side.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Bytes delivered by the device.
    Data(Vec<u8>),
    /// A fault reported in place of data.
    Fault(TransportFault),
}

#[derive(Default)]
struct MockState {
    script: VecDeque<ReadStep>,
    write_log: Vec<Vec<u8>>,
    write_faults: VecDeque<TransportFault>,
    inputs: InputSignals,
    outputs: OutputSignals,
    break_writable: bool,
    disconnected: bool,
}

/// Mock transport with a scripted read side and a write log.
///
/// # Example
/// ```
/// use serial_session::transport::{MockTransport, Transport};
///
/// # async fn example() {
/// let transport = MockTransport::new("MOCK0");
/// transport.push_data(b"OK");
/// let chunk = transport.read_chunk().await.unwrap();
/// assert_eq!(chunk, b"OK");
/// # }
/// ```
pub struct MockTransport {
    name: String,
    state: Mutex<MockState>,
    read_ready: Notify,
    write_logged: Notify,
}

impl MockTransport {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(MockState {
                break_writable: true,
                ..MockState::default()
            }),
            read_ready: Notify::new(),
            write_logged: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a data chunk to the read script.
    pub fn push_data(&self, data: &[u8]) {
        self.state.lock().script.push_back(ReadStep::Data(data.to_vec()));
        self.read_ready.notify_one();
    }

    /// Append a fault to the read script.
    pub fn push_read_fault(&self, fault: TransportFault) {
        self.state.lock().script.push_back(ReadStep::Fault(fault));
        self.read_ready.notify_one();
    }

    /// Fail the next write with the given fault.
    pub fn push_write_fault(&self, fault: TransportFault) {
        self.state.lock().write_faults.push_back(fault);
    }

    /// Set the read-only input lines returned by `get_lines`.
    pub fn set_input_lines(&self, inputs: InputSignals) {
        self.state.lock().inputs = inputs;
    }

    /// Make the break line non-writable, so updates naming it fail with
    /// `UnsupportedSignal`.
    pub fn deny_break(&self) {
        self.state.lock().break_writable = false;
    }

    /// Output lines as last commanded through `set_lines`.
    pub fn output_lines(&self) -> OutputSignals {
        self.state.lock().outputs
    }

    /// Copy of every chunk written so far.
    pub fn write_log(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }

    /// All written bytes flattened in order.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state.lock().write_log.concat()
    }

    /// Wait until at least `total` bytes have been written.
    pub async fn wait_for_written(&self, total: usize) {
        loop {
            if self.state.lock().write_log.concat().len() >= total {
                return;
            }
            self.write_logged.notified().await;
        }
    }

    /// Simulate physical removal: pending and future I/O fails fatally.
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
        self.read_ready.notify_one();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_chunk(&self) -> Result<Vec<u8>, TransportFault> {
        loop {
            {
                let mut st = self.state.lock();
                if st.disconnected {
                    return Err(TransportFault::Fatal(FatalFault::DeviceRemoved));
                }
                match st.script.pop_front() {
                    Some(ReadStep::Data(bytes)) => return Ok(bytes),
                    Some(ReadStep::Fault(fault)) => return Err(fault),
                    None => {}
                }
            }
            self.read_ready.notified().await;
        }
    }

    async fn write_chunk(&self, data: &[u8]) -> Result<(), TransportFault> {
        let mut st = self.state.lock();
        if st.disconnected {
            return Err(TransportFault::Fatal(FatalFault::DeviceRemoved));
        }
        if let Some(fault) = st.write_faults.pop_front() {
            return Err(fault);
        }
        st.write_log.push(data.to_vec());
        self.write_logged.notify_one();
        Ok(())
    }

    async fn set_lines(&self, update: &SignalUpdate) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        if st.disconnected {
            return Err(TransportFault::Fatal(FatalFault::DeviceRemoved).into());
        }
        if update.break_level.is_some() && !st.break_writable {
            return Err(TransportError::UnsupportedSignal("break".into()));
        }
        st.outputs.apply(update);
        Ok(())
    }

    async fn get_lines(&self) -> Result<InputSignals, TransportError> {
        let st = self.state.lock();
        if st.disconnected {
            return Err(TransportFault::Fatal(FatalFault::DeviceRemoved).into());
        }
        Ok(st.inputs)
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("MockTransport")
            .field("name", &self.name)
            .field("scripted_steps", &st.script.len())
            .field("writes", &st.write_log.len())
            .finish()
    }
}

struct MockDevice {
    transport: Arc<MockTransport>,
    present: bool,
    claimed: bool,
}

/// Mock backend simulating permission, exclusive claiming, and hot-plug.
pub struct MockBackend {
    devices: Mutex<BTreeMap<DeviceId, MockDevice>>,
    presence_tx: broadcast::Sender<PresenceEvent>,
}

impl MockBackend {
    pub fn new() -> Self {
        let (presence_tx, _) = broadcast::channel(16);
        Self {
            devices: Mutex::new(BTreeMap::new()),
            presence_tx,
        }
    }

    /// Register an authorized, present device and return its transport.
    pub fn add_device(&self, id: DeviceId) -> Arc<MockTransport> {
        let transport = MockTransport::new(id.as_str());
        self.devices.lock().insert(
            id,
            MockDevice {
                transport: Arc::clone(&transport),
                present: true,
                claimed: false,
            },
        );
        transport
    }

    /// Current transport for a device, if registered.
    pub fn transport(&self, id: &DeviceId) -> Option<Arc<MockTransport>> {
        self.devices
            .lock()
            .get(id)
            .map(|device| Arc::clone(&device.transport))
    }

    /// Simulate physical removal: the device becomes unclaimable, in-flight
    /// I/O fails fatally, and a Disconnected presence event is emitted.
    pub fn unplug(&self, id: &DeviceId) {
        {
            let mut devices = self.devices.lock();
            let Some(device) = devices.get_mut(id) else {
                return;
            };
            device.present = false;
            device.claimed = false;
            device.transport.disconnect();
        }
        let _ = self.presence_tx.send(PresenceEvent {
            device: id.clone(),
            kind: PresenceKind::Disconnected,
        });
    }

    /// Simulate reattachment with a fresh transport and emit a Connected
    /// presence event.
    pub fn plug(&self, id: &DeviceId) -> Arc<MockTransport> {
        let transport = MockTransport::new(id.as_str());
        {
            let mut devices = self.devices.lock();
            devices.insert(
                id.clone(),
                MockDevice {
                    transport: Arc::clone(&transport),
                    present: true,
                    claimed: false,
                },
            );
        }
        let _ = self.presence_tx.send(PresenceEvent {
            device: id.clone(),
            kind: PresenceKind::Connected,
        });
        transport
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportBackend for MockBackend {
    fn list_authorized(&self) -> Vec<DeviceId> {
        self.devices.lock().keys().cloned().collect()
    }

    async fn claim(
        &self,
        device: &DeviceId,
        _config: &SessionConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let mut devices = self.devices.lock();
        let Some(entry) = devices.get_mut(device) else {
            return Err(TransportError::unavailable(format!(
                "unknown device: {device}"
            )));
        };
        if !entry.present {
            return Err(TransportError::unavailable(format!(
                "device not present: {device}"
            )));
        }
        if entry.claimed {
            return Err(TransportError::unavailable(format!(
                "device already claimed: {device}"
            )));
        }
        entry.claimed = true;
        Ok(Arc::clone(&entry.transport) as Arc<dyn Transport>)
    }

    fn release(&self, device: &DeviceId) {
        if let Some(entry) = self.devices.lock().get_mut(device) {
            entry.claimed = false;
        }
    }

    fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence_tx.subscribe()
    }
}
