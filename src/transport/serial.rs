//! serialport-backed transport and backend.
//!
//! Wraps the blocking `serialport` crate for async use with
//! `tokio::task::spawn_blocking`. The opened port is split into independent
//! read and write halves via `try_clone`, so the two pump directions never
//! contend. Presence is detected by polling `available_ports` and diffing
//! the result against the previously seen set.
//!
//! Must be constructed inside a Tokio runtime (the presence watcher is a
//! spawned task).

use super::{
    DeviceId, FatalFault, TransientFault, Transport, TransportBackend, TransportError,
    TransportFault,
};
use crate::config::SessionConfig;
use crate::registry::{PresenceEvent, PresenceKind};
use crate::signals::{InputSignals, SignalUpdate};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read buffer size per blocking read call.
const READ_CHUNK: usize = 4096;

/// Blocking read timeout; paces the read pump when the line is idle.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Default interval between presence polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

type PortHalf = Arc<Mutex<Box<dyn serialport::SerialPort>>>;

/// One claimed serial port, split into read and write halves.
pub struct SerialTransport {
    name: String,
    reader: PortHalf,
    writer: PortHalf,
}

impl SerialTransport {
    fn open(name: &str, config: &SessionConfig) -> Result<Self, TransportError> {
        let port = serialport::new(name, config.baud_rate)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(config.flow_control.into())
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => {
                    TransportError::unavailable(format!("no such device: {name}"))
                }
                _ => TransportError::unavailable(e.to_string()),
            })?;
        let writer = port
            .try_clone()
            .map_err(|e| TransportError::unavailable(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            reader: Arc::new(Mutex::new(port)),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Classify a read-path I/O error into the session fault taxonomy.
fn classify_read_error(err: &std::io::Error) -> Option<TransportFault> {
    use std::io::ErrorKind;
    match err.kind() {
        // Idle line; the pump just polls again.
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => None,
        ErrorKind::InvalidData => Some(TransportFault::Transient(TransientFault::Framing)),
        _ => Some(TransportFault::Fatal(FatalFault::DeviceRemoved)),
    }
}

fn classify_write_error(err: &std::io::Error) -> TransportFault {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            TransportFault::Transient(TransientFault::BufferOverrun)
        }
        _ => TransportFault::Fatal(FatalFault::DeviceRemoved),
    }
}

fn fatal_signal_error(err: serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => {
            TransportFault::Fatal(FatalFault::DeviceRemoved).into()
        }
        _ => TransportFault::Fatal(FatalFault::TransportClosed).into(),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read_chunk(&self) -> Result<Vec<u8>, TransportFault> {
        let reader = Arc::clone(&self.reader);
        tokio::task::spawn_blocking(move || {
            let mut port = reader.lock();
            let mut buf = vec![0u8; READ_CHUNK];
            match port.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(err) => match classify_read_error(&err) {
                    None => Ok(Vec::new()),
                    Some(fault) => Err(fault),
                },
            }
        })
        .await
        .map_err(|_| TransportFault::Fatal(FatalFault::TransportClosed))?
    }

    async fn write_chunk(&self, data: &[u8]) -> Result<(), TransportFault> {
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = writer.lock();
            port.write_all(&data).map_err(|e| classify_write_error(&e))?;
            port.flush().map_err(|e| classify_write_error(&e))
        })
        .await
        .map_err(|_| TransportFault::Fatal(FatalFault::TransportClosed))?
    }

    async fn set_lines(&self, update: &SignalUpdate) -> Result<(), TransportError> {
        // serialport exposes no portable break control at this version.
        if update.break_level.is_some() {
            return Err(TransportError::UnsupportedSignal("break".into()));
        }
        let writer = Arc::clone(&self.writer);
        let update = *update;
        tokio::task::spawn_blocking(move || {
            let mut port = writer.lock();
            if let Some(dtr) = update.data_terminal_ready {
                port.write_data_terminal_ready(dtr)
                    .map_err(fatal_signal_error)?;
            }
            if let Some(rts) = update.request_to_send {
                port.write_request_to_send(rts).map_err(fatal_signal_error)?;
            }
            Ok(())
        })
        .await
        .map_err(|_| TransportError::from(TransportFault::Fatal(FatalFault::TransportClosed)))?
    }

    async fn get_lines(&self) -> Result<InputSignals, TransportError> {
        let reader = Arc::clone(&self.reader);
        tokio::task::spawn_blocking(move || {
            let mut port = reader.lock();
            Ok(InputSignals {
                clear_to_send: port.read_clear_to_send().map_err(fatal_signal_error)?,
                data_set_ready: port.read_data_set_ready().map_err(fatal_signal_error)?,
                ring_indicator: port.read_ring_indicator().map_err(fatal_signal_error)?,
                data_carrier_detect: port.read_carrier_detect().map_err(fatal_signal_error)?,
            })
        })
        .await
        .map_err(|_| TransportError::from(TransportFault::Fatal(FatalFault::TransportClosed)))?
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.name)
            .finish()
    }
}

/// Backend over the host's physical serial ports.
pub struct SerialBackend {
    claimed: Mutex<HashSet<DeviceId>>,
    presence_tx: broadcast::Sender<PresenceEvent>,
    watcher: JoinHandle<()>,
}

impl SerialBackend {
    /// Create a backend with the default presence poll interval.
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(interval: Duration) -> Self {
        let (presence_tx, _) = broadcast::channel(64);
        let watcher = tokio::spawn(watch_ports(presence_tx.clone(), interval));
        Self {
            claimed: Mutex::new(HashSet::new()),
            presence_tx,
            watcher,
        }
    }
}

impl Default for SerialBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialBackend {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl TransportBackend for SerialBackend {
    fn list_authorized(&self) -> Vec<DeviceId> {
        serialport::available_ports()
            .map(|ports| {
                let mut ids: Vec<DeviceId> = ports
                    .into_iter()
                    .map(|p| DeviceId::new(p.port_name))
                    .collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    async fn claim(
        &self,
        device: &DeviceId,
        config: &SessionConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        {
            let mut claimed = self.claimed.lock();
            if !claimed.insert(device.clone()) {
                return Err(TransportError::unavailable(format!(
                    "device already claimed: {device}"
                )));
            }
        }
        let name = device.as_str().to_string();
        let cfg = config.clone();
        let opened = tokio::task::spawn_blocking(move || SerialTransport::open(&name, &cfg))
            .await
            .unwrap_or_else(|_| Err(TransportError::unavailable("open task failed")));
        match opened {
            Ok(transport) => {
                debug!(device = %device, "serial port claimed");
                Ok(Arc::new(transport) as Arc<dyn Transport>)
            }
            Err(err) => {
                self.claimed.lock().remove(device);
                Err(err)
            }
        }
    }

    fn release(&self, device: &DeviceId) {
        self.claimed.lock().remove(device);
    }

    fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence_tx.subscribe()
    }
}

async fn watch_ports(tx: broadcast::Sender<PresenceEvent>, interval: Duration) {
    let mut known = enumerate_ports().await;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let now = enumerate_ports().await;
        for name in now.difference(&known) {
            let _ = tx.send(PresenceEvent {
                device: DeviceId::new(name.clone()),
                kind: PresenceKind::Connected,
            });
        }
        for name in known.difference(&now) {
            let _ = tx.send(PresenceEvent {
                device: DeviceId::new(name.clone()),
                kind: PresenceKind::Disconnected,
            });
        }
        known = now;
    }
}

async fn enumerate_ports() -> HashSet<String> {
    tokio::task::spawn_blocking(|| match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(err) => {
            warn!(%err, "port enumeration failed");
            HashSet::new()
        }
    })
    .await
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_nonexistent_port_unavailable() {
        let backend = SerialBackend::with_poll_interval(Duration::from_secs(3600));
        let device = DeviceId::from("/dev/nonexistent_serial_port_12345");
        let result = backend.claim(&device, &SessionConfig::default()).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));

        // The failed claim must not leave the device marked as held.
        let result = backend.claim(&device, &SessionConfig::default()).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_double_claim_rejected_without_hardware() {
        let backend = SerialBackend::with_poll_interval(Duration::from_secs(3600));
        let device = DeviceId::from("COM_TEST");
        backend.claimed.lock().insert(device.clone());
        let result = backend.claim(&device, &SessionConfig::default()).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    #[test]
    fn test_read_error_classification() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            classify_read_error(&Error::new(ErrorKind::TimedOut, "idle")),
            None
        );
        assert_eq!(
            classify_read_error(&Error::new(ErrorKind::InvalidData, "framing")),
            Some(TransportFault::Transient(TransientFault::Framing))
        );
        assert_eq!(
            classify_read_error(&Error::new(ErrorKind::BrokenPipe, "gone")),
            Some(TransportFault::Fatal(FatalFault::DeviceRemoved))
        );
    }

    #[test]
    fn test_write_error_classification() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            classify_write_error(&Error::new(ErrorKind::TimedOut, "full")),
            TransportFault::Transient(TransientFault::BufferOverrun)
        );
        assert_eq!(
            classify_write_error(&Error::new(ErrorKind::NotFound, "gone")),
            TransportFault::Fatal(FatalFault::DeviceRemoved)
        );
    }
}
