//! End-to-end session lifecycle tests over the mock backend.

use pretty_assertions::assert_eq;
use serial_session::{
    DeviceId, DeviceRegistry, InputSignals, MockBackend, MockTransport, PortSession, PresenceKind,
    ReadOutcome, SessionConfig, SessionError, SessionState, SignalUpdate, TransientFault,
    TransportFault,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TICK: Duration = Duration::from_millis(5);

fn fixture(name: &str) -> (Arc<MockBackend>, DeviceId, Arc<MockTransport>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let backend = Arc::new(MockBackend::new());
    let id = DeviceId::from(name);
    let transport = backend.add_device(id.clone());
    (backend, id, transport)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_command_response_round_trip() {
    let (backend, id, transport) = fixture("MOCK0");
    let session = PortSession::new(backend, id);
    let (read_channel, write_channel) = session
        .open(SessionConfig::with_baud(9600))
        .await
        .expect("open");

    let writer = write_channel.acquire().expect("write lock");
    writer.write(b"AT").await.expect("write");
    transport.wait_for_written(2).await;
    assert_eq!(transport.written_bytes(), b"AT");

    transport.push_data(b"OK");
    let reader = read_channel.acquire().expect("read lock");
    let mut received = Vec::new();
    while received.len() < 2 {
        match reader.read().await.expect("read") {
            ReadOutcome::Data(chunk) => received.extend(chunk),
            ReadOutcome::End => panic!("stream ended before response arrived"),
        }
    }
    assert_eq!(received, b"OK");

    reader.cancel();
    assert_eq!(reader.read().await.expect("read after cancel"), ReadOutcome::End);

    reader.release().expect("read release");
    writer.release().expect("write release");
    session.close().expect("close");
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_channel_lock_is_exclusive() {
    let (backend, id, _) = fixture("MOCK0");
    let session = PortSession::new(backend, id);
    let (read_channel, _) = session.open(SessionConfig::default()).await.unwrap();

    let handle = read_channel.acquire().expect("first lock");
    assert_eq!(read_channel.acquire().err(), Some(SessionError::AlreadyLocked));

    // A locked channel pins the session open.
    assert_eq!(session.close().err(), Some(SessionError::ChannelsStillLocked));

    handle.release().expect("release");
    let _handle = read_channel.acquire().expect("lock after release");
}

#[tokio::test]
async fn test_cancel_unblocks_pending_read() {
    let (backend, id, _) = fixture("MOCK0");
    let session = PortSession::new(backend, id);
    let (read_channel, _) = session.open(SessionConfig::default()).await.unwrap();

    let reader = Arc::new(read_channel.acquire().unwrap());
    let pending = {
        let reader = Arc::clone(&reader);
        tokio::spawn(async move { reader.read().await })
    };
    tokio::time::sleep(TICK).await;
    reader.cancel();

    let outcome = timeout(Duration::from_secs(2), pending)
        .await
        .expect("read resolves after cancel")
        .expect("task join")
        .expect("cancel is not an error");
    assert_eq!(outcome, ReadOutcome::End);
}

#[tokio::test]
async fn test_read_resumes_after_cancel_and_release() {
    let (backend, id, transport) = fixture("MOCK0");
    let session = PortSession::new(backend, id);
    let (read_channel, _) = session.open(SessionConfig::default()).await.unwrap();

    let reader = read_channel.acquire().expect("read lock");
    reader.cancel();
    assert_eq!(reader.read().await.expect("read after cancel"), ReadOutcome::End);
    reader.release().expect("release");

    // Cancel ends the handle, not the direction: the session hands out a
    // fresh-generation channel that delivers new device bytes.
    let replacement = session.read_channel().expect("channel after cancel");
    assert!(replacement.generation() > read_channel.generation());
    let reader = replacement.acquire().expect("acquire after cancel");

    transport.push_data(b"fresh");
    assert_eq!(
        reader.read().await.expect("read resumes"),
        ReadOutcome::Data(b"fresh".to_vec())
    );

    reader.release().expect("release");
    session.close().expect("close");
}

#[tokio::test]
async fn test_transient_fault_supersedes_channel_without_loss() {
    let (backend, id, transport) = fixture("MOCK0");
    let session = PortSession::new(backend, id);
    session.open(SessionConfig::default()).await.unwrap();

    // Bytes buffered but unread when the fault hits must survive into the
    // replacement channel.
    transport.push_data(b"hello");
    wait_until(|| session.metrics().bytes_read_total == 5).await;
    transport.push_read_fault(TransportFault::Transient(TransientFault::Framing));
    wait_until(|| session.metrics().read_generation == Some(2)).await;

    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(session.metrics().transient_faults, 1);

    let replacement = session.read_channel().expect("replacement channel");
    let reader = replacement.acquire().expect("lock replacement");
    assert_eq!(
        reader.read().await.expect("carried-over bytes"),
        ReadOutcome::Data(b"hello".to_vec())
    );
}

#[tokio::test]
async fn test_fault_reported_once_then_drained() {
    let (backend, id, transport) = fixture("MOCK0");
    let session = PortSession::new(backend, id);
    let (read_channel, _) = session.open(SessionConfig::default()).await.unwrap();

    let reader = read_channel.acquire().unwrap();
    transport.push_read_fault(TransportFault::Transient(TransientFault::Parity));

    assert_eq!(
        reader.read().await.err(),
        Some(SessionError::Transient(TransientFault::Parity))
    );
    assert_eq!(reader.read().await.err(), Some(SessionError::ChannelClosed));
    assert_eq!(reader.read().await.err(), Some(SessionError::ChannelClosed));
}

#[tokio::test]
async fn test_fatal_fault_invalidates_session() {
    let (backend, id, transport) = fixture("MOCK0");
    let session = PortSession::new(backend.clone(), id.clone());
    let (read_channel, _) = session.open(SessionConfig::default()).await.unwrap();
    let reader = read_channel.acquire().unwrap();

    backend.unplug(&id);
    wait_until(|| session.state() == SessionState::Invalidated).await;

    assert_eq!(
        reader.read().await.err(),
        Some(SessionError::Fatal(serial_session::FatalFault::DeviceRemoved))
    );
    assert_eq!(reader.read().await.err(), Some(SessionError::ChannelClosed));
    assert!(matches!(
        session.open(SessionConfig::default()).await,
        Err(SessionError::Invalidated(_))
    ));
    drop(transport);
}

#[tokio::test]
async fn test_registry_presence_and_reconnect() {
    let (backend, id, _) = fixture("MOCK0");
    let registry = DeviceRegistry::new(backend.clone());
    let mut events = registry.subscribe();

    let session = registry.session(&id).expect("authorized device");
    session.open(SessionConfig::default()).await.unwrap();

    backend.unplug(&id);
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event arrives")
        .expect("feed open");
    assert_eq!(event.device, id);
    assert_eq!(event.kind, PresenceKind::Disconnected);
    wait_until(|| session.state() == SessionState::Invalidated).await;

    backend.plug(&id);
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event arrives")
        .expect("feed open");
    assert_eq!(event.kind, PresenceKind::Connected);
    wait_until(|| session.state() == SessionState::Closed).await;

    // Same logical session can be opened against the replaced device.
    session
        .open(SessionConfig::default())
        .await
        .expect("reopen after reconnect");
    events.unsubscribe();
}

#[tokio::test]
async fn test_signal_updates_are_preserved() {
    let (backend, id, transport) = fixture("MOCK0");
    let session = PortSession::new(backend, id);
    session.open(SessionConfig::default()).await.unwrap();

    // Output lines assert on open.
    let signals = session.get_signals().await.expect("snapshot");
    assert!(signals.data_terminal_ready);
    assert!(signals.request_to_send);
    assert!(!signals.break_level);

    session
        .set_signals(SignalUpdate::data_terminal_ready(false))
        .await
        .expect("lower dtr");
    transport.set_input_lines(InputSignals {
        clear_to_send: true,
        ..InputSignals::default()
    });

    let signals = session.get_signals().await.expect("snapshot");
    assert!(!signals.data_terminal_ready);
    assert!(signals.request_to_send);
    assert!(signals.clear_to_send);
    assert!(!signals.data_set_ready);
    assert!(!transport.output_lines().data_terminal_ready);
}

#[tokio::test]
async fn test_unsupported_break_leaves_session_usable() {
    let (backend, id, transport) = fixture("MOCK0");
    let session = PortSession::new(backend, id);
    session.open(SessionConfig::default()).await.unwrap();
    transport.deny_break();

    assert_eq!(
        session.set_signals(SignalUpdate::break_level(true)).await.err(),
        Some(SessionError::UnsupportedSignal("break".into()))
    );

    // The failed update must not disturb the cached output values.
    let signals = session.get_signals().await.expect("snapshot");
    assert!(!signals.break_level);
    assert_eq!(session.state(), SessionState::Open);
}
