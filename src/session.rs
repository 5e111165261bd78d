//! Port session lifecycle and error recovery.
//!
//! A `PortSession` owns the claimed transport, the current channel pair, and
//! the cached control-signal state. One pump task per direction moves bytes
//! between the transport and the channel buffers; faults they report are
//! classified here. A transient fault supersedes the affected channel under a
//! fresh generation while the transport stays claimed; a fatal fault releases
//! the transport and leaves the session terminally invalidated.

use crate::channel::{ChannelCore, ChannelStatus, Direction, ReadChannel, WriteChannel};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::signals::{ControlSignals, OutputSignals, SignalUpdate};
use crate::transport::{
    DeviceId, FatalFault, Transport, TransportBackend, TransportError, TransportFault,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Largest chunk the write pump hands to the transport at once.
const MAX_WRITE_CHUNK: usize = 4096;

/// Coarse lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Invalidated,
}

/// Cumulative traffic counters for one session, across channel generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMetrics {
    pub bytes_read_total: u64,
    pub bytes_written_total: u64,
    pub transient_faults: u64,
    /// Generation of the current read channel, if open.
    pub read_generation: Option<u64>,
    /// Generation of the current write channel, if open.
    pub write_generation: Option<u64>,
}

#[derive(Default)]
struct TrafficCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    transient_faults: AtomicU64,
}

struct OpenState {
    transport: Arc<dyn Transport>,
    read_core: Arc<ChannelCore>,
    write_core: Arc<ChannelCore>,
    outputs: OutputSignals,
    config: SessionConfig,
    next_generation: u64,
    /// Raised on close/invalidation; dropping the sender also stops pumps.
    shutdown: watch::Sender<bool>,
}

enum LifecycleState {
    Closed,
    Open(OpenState),
    Invalidated { cause: FatalFault },
}

pub(crate) struct SessionInner {
    device: DeviceId,
    backend: Arc<dyn TransportBackend>,
    state: Mutex<LifecycleState>,
    counters: TrafficCounters,
    weak: Weak<SessionInner>,
}

/// The logical open connection to one physical serial device.
///
/// Cheap to clone; all clones share the same underlying session.
#[derive(Clone)]
pub struct PortSession {
    inner: Arc<SessionInner>,
}

impl PortSession {
    /// Create a closed session for a device on the given backend.
    pub fn new(backend: Arc<dyn TransportBackend>, device: DeviceId) -> Self {
        let inner = Arc::new_cyclic(|weak| SessionInner {
            device,
            backend,
            state: Mutex::new(LifecycleState::Closed),
            counters: TrafficCounters::default(),
            weak: weak.clone(),
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Identity of the device this session is bound to.
    pub fn device(&self) -> &DeviceId {
        &self.inner.device
    }

    /// Claim the transport and allocate a fresh channel pair.
    ///
    /// Fails with `AlreadyOpen` while open, `InvalidConfig` for a non-positive
    /// baud rate, `Invalidated` after a fatal fault until the device
    /// reconnects, and `DeviceUnavailable` if the transport cannot be claimed.
    pub async fn open(
        &self,
        config: SessionConfig,
    ) -> SessionResult<(ReadChannel, WriteChannel)> {
        self.inner.open(config).await
    }

    /// Release the transport and return to Closed.
    ///
    /// Fails with `ChannelsStillLocked` while a handle is outstanding on
    /// either current channel. Idempotent on a closed session; an invalidated
    /// session stays invalidated.
    pub fn close(&self) -> SessionResult<()> {
        self.inner.close()
    }

    /// Current read-direction channel. After a transient read fault this
    /// yields the replacement generation; after a cancellation it supersedes
    /// the canceled channel with a fresh one, since cancel ends a handle but
    /// never the direction.
    pub fn read_channel(&self) -> SessionResult<ReadChannel> {
        let mut st = self.inner.state.lock();
        match &mut *st {
            LifecycleState::Open(open) => {
                if open.read_core.status() == ChannelStatus::Canceled {
                    let generation = open.next_generation;
                    open.next_generation += 1;
                    // Cancellation discards whatever the old channel held.
                    open.read_core.mark_closed();
                    let replacement =
                        ChannelCore::new(generation, open.config.effective_capacity());
                    open.read_core = Arc::clone(&replacement);
                    debug!(
                        device = %self.inner.device,
                        generation,
                        "canceled read channel superseded"
                    );
                    return Ok(ReadChannel { core: replacement });
                }
                Ok(ReadChannel {
                    core: Arc::clone(&open.read_core),
                })
            }
            _ => Err(SessionError::NotOpen),
        }
    }

    /// Current write-direction channel.
    pub fn write_channel(&self) -> SessionResult<WriteChannel> {
        let st = self.inner.state.lock();
        match &*st {
            LifecycleState::Open(open) => Ok(WriteChannel {
                core: Arc::clone(&open.write_core),
            }),
            _ => Err(SessionError::NotOpen),
        }
    }

    /// Update the writable control lines named in `update`, leaving the rest
    /// unchanged.
    pub async fn set_signals(&self, update: SignalUpdate) -> SessionResult<()> {
        let transport = self.inner.open_transport()?;
        match transport.set_lines(&update).await {
            Ok(()) => {
                let mut st = self.inner.state.lock();
                if let LifecycleState::Open(open) = &mut *st {
                    open.outputs.apply(&update);
                }
                Ok(())
            }
            Err(err) => Err(self.inner.map_transport_error(err)),
        }
    }

    /// Full control-signal snapshot: fresh input lines plus the last written
    /// output values.
    pub async fn get_signals(&self) -> SessionResult<ControlSignals> {
        let (transport, outputs) = {
            let st = self.inner.state.lock();
            match &*st {
                LifecycleState::Open(open) => (Arc::clone(&open.transport), open.outputs),
                _ => return Err(SessionError::NotOpen),
            }
        };
        let inputs = transport
            .get_lines()
            .await
            .map_err(|err| self.inner.map_transport_error(err))?;
        Ok(ControlSignals::merge(outputs, inputs))
    }

    /// Coarse lifecycle state.
    pub fn state(&self) -> SessionState {
        match &*self.inner.state.lock() {
            LifecycleState::Closed => SessionState::Closed,
            LifecycleState::Open(_) => SessionState::Open,
            LifecycleState::Invalidated { .. } => SessionState::Invalidated,
        }
    }

    /// Cumulative traffic counters.
    pub fn metrics(&self) -> SessionMetrics {
        let (read_generation, write_generation) = match &*self.inner.state.lock() {
            LifecycleState::Open(open) => (
                Some(open.read_core.generation()),
                Some(open.write_core.generation()),
            ),
            _ => (None, None),
        };
        SessionMetrics {
            bytes_read_total: self.inner.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written_total: self.inner.counters.bytes_written.load(Ordering::Relaxed),
            transient_faults: self.inner.counters.transient_faults.load(Ordering::Relaxed),
            read_generation,
            write_generation,
        }
    }
}

impl SessionInner {
    async fn open(&self, config: SessionConfig) -> SessionResult<(ReadChannel, WriteChannel)> {
        config.validate()?;
        {
            let st = self.state.lock();
            match &*st {
                LifecycleState::Closed => {}
                LifecycleState::Open(_) => return Err(SessionError::AlreadyOpen),
                LifecycleState::Invalidated { cause } => {
                    return Err(SessionError::Invalidated(*cause))
                }
            }
        }

        let transport = self
            .backend
            .claim(&self.device, &config)
            .await
            .map_err(|err| match err {
                TransportError::Unavailable(msg) => SessionError::DeviceUnavailable(msg),
                other => SessionError::device_unavailable(other.to_string()),
            })?;

        let mut st = self.state.lock();
        match &*st {
            LifecycleState::Closed => {}
            LifecycleState::Open(_) => {
                // Lost the open race while claiming.
                self.backend.release(&self.device);
                return Err(SessionError::AlreadyOpen);
            }
            LifecycleState::Invalidated { cause } => {
                let cause = *cause;
                self.backend.release(&self.device);
                return Err(SessionError::Invalidated(cause));
            }
        }

        let capacity = config.effective_capacity();
        let (shutdown, _) = watch::channel(false);
        let read_core = ChannelCore::new(0, capacity);
        let write_core = ChannelCore::new(1, capacity);
        self.spawn_read_pump(Arc::clone(&transport), shutdown.subscribe());
        self.spawn_write_pump(
            Arc::clone(&transport),
            Arc::clone(&write_core),
            shutdown.subscribe(),
        );
        info!(device = %self.device, baud = config.baud_rate, "session opened");
        *st = LifecycleState::Open(OpenState {
            transport,
            read_core: Arc::clone(&read_core),
            write_core: Arc::clone(&write_core),
            outputs: OutputSignals::default(),
            config,
            next_generation: 2,
            shutdown,
        });
        Ok((
            ReadChannel { core: read_core },
            WriteChannel { core: write_core },
        ))
    }

    fn close(&self) -> SessionResult<()> {
        let mut st = self.state.lock();
        let prev = std::mem::replace(&mut *st, LifecycleState::Closed);
        match prev {
            LifecycleState::Closed => Ok(()),
            LifecycleState::Invalidated { cause } => {
                // Terminal; transport was released at invalidation time.
                *st = LifecycleState::Invalidated { cause };
                Ok(())
            }
            LifecycleState::Open(open) => {
                if open.read_core.is_locked() || open.write_core.is_locked() {
                    *st = LifecycleState::Open(open);
                    return Err(SessionError::ChannelsStillLocked);
                }
                open.read_core.mark_closed();
                open.write_core.mark_closed();
                let _ = open.shutdown.send(true);
                self.backend.release(&self.device);
                info!(device = %self.device, "session closed");
                Ok(())
            }
        }
    }

    fn open_transport(&self) -> SessionResult<Arc<dyn Transport>> {
        let st = self.state.lock();
        match &*st {
            LifecycleState::Open(open) => Ok(Arc::clone(&open.transport)),
            _ => Err(SessionError::NotOpen),
        }
    }

    fn map_transport_error(&self, err: TransportError) -> SessionError {
        match err {
            TransportError::Unavailable(msg) => SessionError::DeviceUnavailable(msg),
            TransportError::UnsupportedSignal(line) => SessionError::UnsupportedSignal(line),
            TransportError::Fault(TransportFault::Transient(t)) => SessionError::Transient(t),
            TransportError::Fault(TransportFault::Fatal(f)) => {
                self.invalidate(f);
                SessionError::Fatal(f)
            }
        }
    }

    /// Classify a pump-reported fault. Reports from a superseded channel
    /// generation are ignored.
    fn handle_fault(&self, direction: Direction, generation: u64, fault: TransportFault) {
        let mut st = self.state.lock();
        {
            let LifecycleState::Open(open) = &*st else {
                return;
            };
            let core = match direction {
                Direction::Read => &open.read_core,
                Direction::Write => &open.write_core,
            };
            if core.generation() != generation {
                debug!(
                    device = %self.device,
                    %direction,
                    generation,
                    "ignoring fault from superseded channel"
                );
                return;
            }
        }
        match fault {
            TransportFault::Transient(t) => {
                let LifecycleState::Open(open) = &mut *st else {
                    return;
                };
                warn!(device = %self.device, %direction, fault = %t, "transient fault, superseding channel");
                self.counters.transient_faults.fetch_add(1, Ordering::Relaxed);
                let capacity = open.config.effective_capacity();
                let generation = open.next_generation;
                open.next_generation += 1;
                match direction {
                    Direction::Read => {
                        open.read_core.record_fault(SessionError::Transient(t));
                        let carry = open.read_core.drain_remaining();
                        let replacement = ChannelCore::with_buffer(generation, capacity, carry);
                        open.read_core = replacement;
                        // The read pump resolves the current channel on every
                        // chunk, so it picks up the replacement by itself.
                    }
                    Direction::Write => {
                        open.write_core.record_fault(SessionError::Transient(t));
                        let carry = open.write_core.drain_remaining();
                        let replacement = ChannelCore::with_buffer(generation, capacity, carry);
                        open.write_core = Arc::clone(&replacement);
                        self.spawn_write_pump(
                            Arc::clone(&open.transport),
                            replacement,
                            open.shutdown.subscribe(),
                        );
                    }
                }
            }
            TransportFault::Fatal(f) => {
                self.invalidate_locked(&mut st, f);
            }
        }
    }

    /// Permanently invalidate an open session. No-op unless Open.
    pub(crate) fn invalidate(&self, cause: FatalFault) {
        let mut st = self.state.lock();
        self.invalidate_locked(&mut st, cause);
    }

    fn invalidate_locked(&self, st: &mut LifecycleState, cause: FatalFault) {
        let prev = std::mem::replace(st, LifecycleState::Invalidated { cause });
        match prev {
            LifecycleState::Open(open) => {
                warn!(device = %self.device, %cause, "fatal fault, session invalidated");
                open.read_core.record_fault(SessionError::Fatal(cause));
                open.write_core.record_fault(SessionError::Fatal(cause));
                let _ = open.shutdown.send(true);
                self.backend.release(&self.device);
            }
            other => {
                // Only an open session can be invalidated.
                *st = other;
            }
        }
    }

    /// Re-arm an invalidated session after the device reconnects.
    pub(crate) fn reset_if_invalidated(&self) {
        let mut st = self.state.lock();
        if matches!(&*st, LifecycleState::Invalidated { .. }) {
            info!(device = %self.device, "device reconnected, session reset to closed");
            *st = LifecycleState::Closed;
        }
    }

    fn current_read_core(&self) -> Option<Arc<ChannelCore>> {
        match &*self.state.lock() {
            LifecycleState::Open(open) => Some(Arc::clone(&open.read_core)),
            _ => None,
        }
    }

    /// The read pump lives for the whole open phase: it resolves the current
    /// read channel for every chunk, so supersessions (transient fault or
    /// cancellation) swap the destination without restarting the pump. Faults
    /// are reported and classified; only shutdown ends the task.
    fn spawn_read_pump(&self, transport: Arc<dyn Transport>, mut shutdown: watch::Receiver<bool>) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            debug!("read pump started");
            loop {
                let chunk = tokio::select! {
                    _ = shutdown.changed() => break,
                    chunk = transport.read_chunk() => chunk,
                };
                let Some(session) = weak.upgrade() else { break };
                let Some(core) = session.current_read_core() else { break };
                match chunk {
                    Ok(bytes) if bytes.is_empty() => {}
                    Ok(bytes) => {
                        session
                            .counters
                            .bytes_read
                            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        let mut offset = 0;
                        while offset < bytes.len() {
                            let accepted = core.offer(&bytes[offset..]);
                            offset += accepted;
                            if accepted == 0 {
                                tokio::select! {
                                    _ = shutdown.changed() => return,
                                    _ = core.notified_space() => {}
                                }
                            }
                        }
                    }
                    Err(fault) => {
                        session.handle_fault(Direction::Read, core.generation(), fault);
                    }
                }
            }
            debug!("read pump stopped");
        });
    }

    fn spawn_write_pump(
        &self,
        transport: Arc<dyn Transport>,
        core: Arc<ChannelCore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let session = self.weak.clone();
        tokio::spawn(async move {
            debug!(generation = core.generation(), "write pump started");
            loop {
                let chunk = loop {
                    if core.is_terminal() {
                        return;
                    }
                    if let Some(chunk) = core.take(MAX_WRITE_CHUNK) {
                        break chunk;
                    }
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = core.notified_data() => {}
                    }
                };
                let result = tokio::select! {
                    _ = shutdown.changed() => return,
                    result = transport.write_chunk(&chunk) => result,
                };
                match result {
                    Ok(()) => {
                        if let Some(session) = session.upgrade() {
                            session
                                .counters
                                .bytes_written
                                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        }
                    }
                    Err(fault) => {
                        let Some(session) = session.upgrade() else { break };
                        session.handle_fault(Direction::Write, core.generation(), fault);
                        break;
                    }
                }
            }
            debug!(generation = core.generation(), "write pump stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBackend;

    fn backend_with(device: &str) -> (Arc<MockBackend>, DeviceId) {
        let backend = Arc::new(MockBackend::new());
        let id = DeviceId::from(device);
        backend.add_device(id.clone());
        (backend, id)
    }

    #[tokio::test]
    async fn test_open_close_cycle() {
        let (backend, id) = backend_with("MOCK0");
        let session = PortSession::new(backend, id);
        assert_eq!(session.state(), SessionState::Closed);

        session
            .open(SessionConfig::default())
            .await
            .expect("open succeeds");
        assert_eq!(session.state(), SessionState::Open);

        session.close().expect("close succeeds");
        assert_eq!(session.state(), SessionState::Closed);

        // Idempotent.
        session.close().expect("close is idempotent");
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let (backend, id) = backend_with("MOCK0");
        let session = PortSession::new(backend, id);
        session.open(SessionConfig::default()).await.unwrap();
        assert_eq!(
            session.open(SessionConfig::default()).await.err(),
            Some(SessionError::AlreadyOpen)
        );
    }

    #[tokio::test]
    async fn test_open_rejects_zero_baud() {
        let (backend, id) = backend_with("MOCK0");
        let session = PortSession::new(backend, id);
        assert!(matches!(
            session.open(SessionConfig::with_baud(0)).await,
            Err(SessionError::InvalidConfig(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_open_unknown_device_unavailable() {
        let backend = Arc::new(MockBackend::new());
        let session = PortSession::new(backend, DeviceId::from("GHOST"));
        assert!(matches!(
            session.open(SessionConfig::default()).await,
            Err(SessionError::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_across_sessions() {
        let (backend, id) = backend_with("MOCK0");
        let first = PortSession::new(backend.clone(), id.clone());
        let second = PortSession::new(backend, id);
        first.open(SessionConfig::default()).await.unwrap();
        assert!(matches!(
            second.open(SessionConfig::default()).await,
            Err(SessionError::DeviceUnavailable(_))
        ));

        first.close().unwrap();
        second
            .open(SessionConfig::default())
            .await
            .expect("claim freed by close");
    }

    #[tokio::test]
    async fn test_channel_accessors_require_open() {
        let (backend, id) = backend_with("MOCK0");
        let session = PortSession::new(backend, id);
        assert_eq!(session.read_channel().err(), Some(SessionError::NotOpen));
        assert_eq!(session.write_channel().err(), Some(SessionError::NotOpen));
        assert_eq!(
            session.get_signals().await.err(),
            Some(SessionError::NotOpen)
        );
    }

    #[tokio::test]
    async fn test_cancel_does_not_poison_read_direction() {
        let (backend, id) = backend_with("MOCK0");
        let session = PortSession::new(backend, id);
        let (read_channel, _) = session.open(SessionConfig::default()).await.unwrap();

        let reader = read_channel.acquire().unwrap();
        reader.cancel();
        assert_eq!(
            reader.read().await.unwrap(),
            crate::channel::ReadOutcome::End
        );
        reader.release().unwrap();

        // The canceled channel is superseded with a fresh generation; the
        // direction stays usable.
        let replacement = session.read_channel().expect("channel after cancel");
        assert!(replacement.generation() > read_channel.generation());
        replacement.acquire().expect("acquire after cancel");

        // Stable once superseded.
        let again = session.read_channel().unwrap();
        assert_eq!(again.generation(), replacement.generation());
    }

    #[tokio::test]
    async fn test_metrics_track_generations() {
        let (backend, id) = backend_with("MOCK0");
        let session = PortSession::new(backend, id);
        let metrics = session.metrics();
        assert_eq!(metrics.read_generation, None);

        session.open(SessionConfig::default()).await.unwrap();
        let metrics = session.metrics();
        assert_eq!(metrics.read_generation, Some(0));
        assert_eq!(metrics.write_generation, Some(1));
        assert_eq!(metrics.transient_faults, 0);
    }
}
