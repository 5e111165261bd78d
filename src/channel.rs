//! Single-owner, cancellable byte channels.
//!
//! Each open session carries one read-direction and one write-direction
//! channel. A channel is a bounded byte buffer between the caller and the
//! transport pump, guarded by an at-most-one-handle lock. Handles take
//! `&self` so that `cancel()` can race an in-flight `read()` on the same
//! handle (share the handle through an `Arc` for that pattern).
//!
//! Status transitions: Active -> Locked (acquire), Locked -> Active (release
//! without fault), Locked -> Errored (device fault), Locked -> Canceled
//! (cancel), any -> Closed (session close or supersession).

use crate::error::{SessionError, SessionResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Largest chunk handed out by a single `read()` call.
const MAX_READ_CHUNK: usize = 4096;

/// Direction of a byte channel relative to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Externally observable channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Active,
    Locked,
    Errored,
    Canceled,
    Closed,
}

/// Result of a single read: either buffered bytes or orderly end-of-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    End,
}

struct ChannelState {
    status: ChannelStatus,
    buffer: VecDeque<u8>,
    /// Fault recorded by the session; surfaced exactly once to the handle.
    fault: Option<SessionError>,
    fault_reported: bool,
    /// Set by `cancel()`; independent of `status` so a pending fault is still
    /// reported once before reads resolve as end-of-stream.
    canceled: bool,
    op_in_progress: bool,
}

/// Shared core of one channel, owned by the session and referenced by the
/// facade and any outstanding handle.
pub(crate) struct ChannelCore {
    generation: u64,
    capacity: usize,
    state: Mutex<ChannelState>,
    /// Signaled when bytes are added or the channel reaches a terminal state.
    data_ready: Notify,
    /// Signaled when buffer space is freed or the channel reaches a terminal
    /// state.
    space_ready: Notify,
}

impl ChannelCore {
    pub(crate) fn new(generation: u64, capacity: usize) -> Arc<Self> {
        Self::with_buffer(generation, capacity, VecDeque::new())
    }

    /// Build a channel pre-seeded with bytes carried over from a superseded
    /// generation.
    pub(crate) fn with_buffer(
        generation: u64,
        capacity: usize,
        buffer: VecDeque<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            generation,
            // Carryover may exceed the hint; never drop bytes for it.
            capacity: capacity.max(buffer.len()),
            state: Mutex::new(ChannelState {
                status: ChannelStatus::Active,
                buffer,
                fault: None,
                fault_reported: false,
                canceled: false,
                op_in_progress: false,
            }),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        self.state.lock().status
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().status == ChannelStatus::Locked
    }

    /// Push transport bytes into the buffer, up to available space.
    /// Returns how many bytes were accepted; zero means the buffer is full
    /// (await `space_ready` and retry) or the channel is terminal.
    pub(crate) fn offer(&self, bytes: &[u8]) -> usize {
        let mut st = self.state.lock();
        if matches!(st.status, ChannelStatus::Errored | ChannelStatus::Closed) || st.canceled {
            // Terminal: pretend everything was taken so the pump stops.
            return bytes.len();
        }
        let space = self.capacity.saturating_sub(st.buffer.len());
        let n = space.min(bytes.len());
        if n > 0 {
            st.buffer.extend(&bytes[..n]);
            self.data_ready.notify_one();
        }
        n
    }

    /// Pop up to `max` buffered bytes for transmission by the write pump.
    pub(crate) fn take(&self, max: usize) -> Option<Vec<u8>> {
        let mut st = self.state.lock();
        if st.buffer.is_empty() {
            return None;
        }
        let n = st.buffer.len().min(max);
        let bytes: Vec<u8> = st.buffer.drain(..n).collect();
        self.space_ready.notify_one();
        Some(bytes)
    }

    /// True once the channel can produce nothing further for the write pump.
    pub(crate) fn is_terminal(&self) -> bool {
        let st = self.state.lock();
        st.canceled
            || matches!(
                st.status,
                ChannelStatus::Errored | ChannelStatus::Canceled | ChannelStatus::Closed
            )
    }

    /// Record a classified fault. The outstanding handle (if any) observes it
    /// exactly once on its next operation.
    pub(crate) fn record_fault(&self, fault: SessionError) {
        let mut st = self.state.lock();
        if st.fault.is_none() {
            st.fault = Some(fault);
        }
        if st.status != ChannelStatus::Closed {
            st.status = ChannelStatus::Errored;
        }
        self.data_ready.notify_one();
        self.space_ready.notify_one();
    }

    /// Close the channel outright (session close or generation supersession).
    pub(crate) fn mark_closed(&self) {
        let mut st = self.state.lock();
        st.status = ChannelStatus::Closed;
        st.buffer.clear();
        self.data_ready.notify_one();
        self.space_ready.notify_one();
    }

    /// Move any unconsumed bytes out, for carryover into a replacement
    /// channel.
    pub(crate) fn drain_remaining(&self) -> VecDeque<u8> {
        let mut st = self.state.lock();
        std::mem::take(&mut st.buffer)
    }

    pub(crate) fn notified_data(&self) -> tokio::sync::futures::Notified<'_> {
        self.data_ready.notified()
    }

    pub(crate) fn notified_space(&self) -> tokio::sync::futures::Notified<'_> {
        self.space_ready.notified()
    }

    fn acquire(self: &Arc<Self>) -> SessionResult<()> {
        let mut st = self.state.lock();
        match st.status {
            ChannelStatus::Active => {
                st.status = ChannelStatus::Locked;
                Ok(())
            }
            _ => Err(SessionError::AlreadyLocked),
        }
    }

    fn release(&self) -> SessionResult<()> {
        let mut st = self.state.lock();
        if st.op_in_progress {
            return Err(SessionError::OperationInProgress);
        }
        if st.status == ChannelStatus::Locked {
            st.status = ChannelStatus::Active;
        }
        Ok(())
    }

    fn begin_op(&self) -> SessionResult<()> {
        let mut st = self.state.lock();
        if st.op_in_progress {
            return Err(SessionError::OperationInProgress);
        }
        st.op_in_progress = true;
        Ok(())
    }

    fn end_op(&self) {
        self.state.lock().op_in_progress = false;
    }

    fn cancel(&self) {
        let mut st = self.state.lock();
        st.canceled = true;
        if st.status == ChannelStatus::Locked {
            st.status = ChannelStatus::Canceled;
        }
        self.data_ready.notify_one();
        self.space_ready.notify_one();
    }
}

/// Clears `op_in_progress` even when the owning future is dropped mid-await.
struct OpGuard<'a> {
    core: &'a ChannelCore,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.core.end_op();
    }
}

/// Read-direction channel facade handed out by the session.
///
/// Cheap to clone; all clones resolve against the same underlying channel
/// generation. After a transient fault, fetch the replacement facade from the
/// session.
#[derive(Clone)]
pub struct ReadChannel {
    pub(crate) core: Arc<ChannelCore>,
}

impl ReadChannel {
    /// Acquire the exclusive read handle.
    ///
    /// Never suspends; fails fast with `AlreadyLocked` if a handle is
    /// outstanding or the channel is no longer Active.
    pub fn acquire(&self) -> SessionResult<ReadHandle> {
        self.core.acquire()?;
        Ok(ReadHandle {
            core: Arc::clone(&self.core),
            released: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> ChannelStatus {
        self.core.status()
    }

    /// Generation of this channel within its session; bumped on every
    /// replacement.
    pub fn generation(&self) -> u64 {
        self.core.generation()
    }
}

/// Write-direction channel facade handed out by the session.
#[derive(Clone)]
pub struct WriteChannel {
    pub(crate) core: Arc<ChannelCore>,
}

impl WriteChannel {
    /// Acquire the exclusive write handle.
    pub fn acquire(&self) -> SessionResult<WriteHandle> {
        self.core.acquire()?;
        Ok(WriteHandle {
            core: Arc::clone(&self.core),
            released: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> ChannelStatus {
        self.core.status()
    }

    pub fn generation(&self) -> u64 {
        self.core.generation()
    }
}

/// Exclusive capability to read from one channel generation.
pub struct ReadHandle {
    core: Arc<ChannelCore>,
    released: AtomicBool,
}

impl ReadHandle {
    /// Wait for buffered bytes, cancellation, or a recorded fault.
    ///
    /// A recorded fault is propagated exactly once; afterwards the instance is
    /// drained and every further read fails with `ChannelClosed`. After
    /// `cancel()`, resolves with [`ReadOutcome::End`] forever.
    pub async fn read(&self) -> SessionResult<ReadOutcome> {
        if self.released.load(Ordering::Acquire) {
            return Err(SessionError::HandleReleased);
        }
        self.core.begin_op()?;
        let _guard = OpGuard { core: &self.core };
        loop {
            {
                let mut st = self.core.state.lock();
                if let Some(fault) = Self::take_unreported_fault(&mut st) {
                    return Err(fault);
                }
                if st.canceled || st.status == ChannelStatus::Canceled {
                    return Ok(ReadOutcome::End);
                }
                if st.fault_reported {
                    return Err(SessionError::ChannelClosed);
                }
                if !st.buffer.is_empty() {
                    let n = st.buffer.len().min(MAX_READ_CHUNK);
                    let bytes: Vec<u8> = st.buffer.drain(..n).collect();
                    self.core.space_ready.notify_one();
                    return Ok(ReadOutcome::Data(bytes));
                }
                if st.status == ChannelStatus::Closed {
                    return Err(SessionError::ChannelClosed);
                }
            }
            self.core.data_ready.notified().await;
        }
    }

    /// Cancel this handle: any in-flight or future `read()` resolves with
    /// `End` in bounded time. Never fails; a pending fault is still reported
    /// once before the end-of-stream behavior takes over.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Release the handle, returning the channel to unlocked Active status if
    /// no fault or cancel occurred.
    pub fn release(&self) -> SessionResult<()> {
        self.core.release()?;
        self.released.store(true, Ordering::Release);
        Ok(())
    }

    fn take_unreported_fault(st: &mut ChannelState) -> Option<SessionError> {
        if st.fault_reported {
            return None;
        }
        let fault = st.fault.clone()?;
        st.fault_reported = true;
        Some(fault)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            let _ = self.core.release();
        }
    }
}

/// Exclusive capability to write to one channel generation.
pub struct WriteHandle {
    core: Arc<ChannelCore>,
    released: AtomicBool,
}

impl WriteHandle {
    /// Enqueue bytes for transmission, suspending while the buffer is full.
    ///
    /// A recorded fault is propagated exactly once; afterwards the instance
    /// fails with `ChannelClosed`.
    pub async fn write(&self, bytes: &[u8]) -> SessionResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(SessionError::HandleReleased);
        }
        self.core.begin_op()?;
        let _guard = OpGuard { core: &self.core };
        let mut offset = 0;
        loop {
            {
                let mut st = self.core.state.lock();
                if !st.fault_reported {
                    if let Some(fault) = st.fault.clone() {
                        st.fault_reported = true;
                        return Err(fault);
                    }
                }
                if st.fault_reported
                    || matches!(st.status, ChannelStatus::Errored | ChannelStatus::Closed)
                {
                    return Err(SessionError::ChannelClosed);
                }
                let space = self.core.capacity.saturating_sub(st.buffer.len());
                let n = space.min(bytes.len() - offset);
                if n > 0 {
                    st.buffer.extend(&bytes[offset..offset + n]);
                    offset += n;
                    self.core.data_ready.notify_one();
                }
                if offset == bytes.len() {
                    return Ok(());
                }
            }
            self.core.space_ready.notified().await;
        }
    }

    /// Release the handle, returning the channel to unlocked Active status if
    /// no fault occurred.
    pub fn release(&self) -> SessionResult<()> {
        self.core.release()?;
        self.released.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            let _ = self.core.release();
        }
    }
}
