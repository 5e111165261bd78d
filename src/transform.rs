//! Transform stages: framing/encoding layers composed in front of a channel.
//!
//! A stage wraps any [`ByteSource`] or [`ByteSink`] (a channel handle or
//! another stage) and maps bytes through a [`ByteTransform`]. Cancel and
//! close signals propagate upstream through the chain, and each stage exposes
//! a [`Completion`] that resolves once teardown has fully drained, so a
//! caller can await it before closing the underlying session.
//!
//! Teardown is two-phase: signal close (`cancel` / `finish`), then await
//! drained (`Completion::wait` or `shutdown`). Upstream errors observed after
//! a cancel are swallowed at this boundary; cancellation is not an error.

use crate::channel::{ReadHandle, ReadOutcome, WriteHandle};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// A pure or stateful byte mapping applied by a stage.
pub trait ByteTransform: Send + 'static {
    /// Map one input chunk, appending any output to `out`. Producing no
    /// output is valid (e.g. a framer waiting for a delimiter).
    fn apply(&mut self, input: &[u8], out: &mut Vec<u8>) -> SessionResult<()>;

    /// Emit any buffered tail when the stream ends.
    fn finish(&mut self, out: &mut Vec<u8>) -> SessionResult<()> {
        let _ = out;
        Ok(())
    }
}

/// Anything a read-side stage can pull from.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn read(&self) -> SessionResult<ReadOutcome>;
    fn cancel(&self);
}

#[async_trait]
impl ByteSource for ReadHandle {
    async fn read(&self) -> SessionResult<ReadOutcome> {
        ReadHandle::read(self).await
    }

    fn cancel(&self) {
        ReadHandle::cancel(self);
    }
}

/// Anything a write-side stage can push into.
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> SessionResult<()>;
    /// Signal close upstream; called once at the end of teardown.
    fn close(&self) -> SessionResult<()>;
}

#[async_trait]
impl ByteSink for WriteHandle {
    async fn write(&self, bytes: &[u8]) -> SessionResult<()> {
        WriteHandle::write(self, bytes).await
    }

    fn close(&self) -> SessionResult<()> {
        self.release()
    }
}

/// Resolves once a stage's teardown has fully drained.
pub struct Completion {
    rx: oneshot::Receiver<()>,
}

impl Completion {
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

fn completion_pair() -> (Mutex<Option<oneshot::Sender<()>>>, Completion) {
    let (tx, rx) = oneshot::channel();
    (Mutex::new(Some(tx)), Completion { rx })
}

struct ReaderState {
    canceled: bool,
    finished: bool,
}

/// Read-side stage: pulls from an upstream source and maps bytes through a
/// transform.
pub struct TransformReader<S: ByteSource, T: ByteTransform> {
    source: S,
    transform: Mutex<T>,
    state: Mutex<ReaderState>,
    completion_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl<S: ByteSource, T: ByteTransform> TransformReader<S, T> {
    pub fn new(source: S, transform: T) -> (Self, Completion) {
        let (completion_tx, completion) = completion_pair();
        (
            Self {
                source,
                transform: Mutex::new(transform),
                state: Mutex::new(ReaderState {
                    canceled: false,
                    finished: false,
                }),
                completion_tx,
            },
            completion,
        )
    }

    /// Read the next transformed chunk, or `End` after cancellation or
    /// upstream end-of-stream.
    pub async fn read(&self) -> SessionResult<ReadOutcome> {
        loop {
            let (canceled, finished) = {
                let st = self.state.lock();
                (st.canceled, st.finished)
            };
            if finished {
                self.fire_completion();
                return Ok(ReadOutcome::End);
            }
            if canceled {
                // Drain upstream so every stage in the chain observes the
                // teardown; whatever it yields is discarded and its errors
                // are swallowed (cancellation is not an error).
                loop {
                    match self.source.read().await {
                        Ok(ReadOutcome::Data(_)) => continue,
                        Ok(ReadOutcome::End) => break,
                        Err(err) => {
                            debug!(%err, "swallowing upstream error after cancel");
                            break;
                        }
                    }
                }
                self.state.lock().finished = true;
                self.fire_completion();
                return Ok(ReadOutcome::End);
            }
            match self.source.read().await {
                Ok(ReadOutcome::Data(bytes)) => {
                    let mut out = Vec::new();
                    self.transform.lock().apply(&bytes, &mut out)?;
                    if !out.is_empty() {
                        return Ok(ReadOutcome::Data(out));
                    }
                    // Transform consumed the chunk without output; pull more.
                }
                Ok(ReadOutcome::End) => {
                    let mut out = Vec::new();
                    self.transform.lock().finish(&mut out)?;
                    self.state.lock().finished = true;
                    self.fire_completion();
                    if !out.is_empty() {
                        return Ok(ReadOutcome::Data(out));
                    }
                    return Ok(ReadOutcome::End);
                }
                Err(err) => {
                    if self.state.lock().canceled {
                        // Cancellation is not an error; swallow it here.
                        debug!(%err, "swallowing upstream error after cancel");
                        self.fire_completion();
                        return Ok(ReadOutcome::End);
                    }
                    self.state.lock().finished = true;
                    self.fire_completion();
                    return Err(err);
                }
            }
        }
    }

    /// Phase one of teardown: propagate cancellation upstream. Any pending
    /// or future `read` resolves with `End`.
    pub fn cancel(&self) {
        self.state.lock().canceled = true;
        self.source.cancel();
    }

    /// Full teardown: cancel, then drain until the chain reports end.
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.cancel();
        loop {
            match self.read().await {
                Ok(ReadOutcome::End) => return Ok(()),
                Ok(ReadOutcome::Data(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn fire_completion(&self) {
        if let Some(tx) = self.completion_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl<S: ByteSource, T: ByteTransform> ByteSource for TransformReader<S, T> {
    async fn read(&self) -> SessionResult<ReadOutcome> {
        TransformReader::read(self).await
    }

    fn cancel(&self) {
        TransformReader::cancel(self);
    }
}

/// Write-side stage: maps bytes through a transform before pushing them to an
/// upstream sink.
pub struct TransformWriter<S: ByteSink, T: ByteTransform> {
    sink: S,
    transform: Mutex<T>,
    finished: Mutex<bool>,
    completion_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl<S: ByteSink, T: ByteTransform> TransformWriter<S, T> {
    pub fn new(sink: S, transform: T) -> (Self, Completion) {
        let (completion_tx, completion) = completion_pair();
        (
            Self {
                sink,
                transform: Mutex::new(transform),
                finished: Mutex::new(false),
                completion_tx,
            },
            completion,
        )
    }

    /// Transform and forward one chunk.
    pub async fn write(&self, bytes: &[u8]) -> SessionResult<()> {
        if *self.finished.lock() {
            return Err(SessionError::ChannelClosed);
        }
        let mut out = Vec::new();
        self.transform.lock().apply(bytes, &mut out)?;
        if out.is_empty() {
            return Ok(());
        }
        self.sink.write(&out).await
    }

    /// Two-phase teardown: flush the transform tail downstream, then close
    /// the upstream sink. The stage's `Completion` resolves afterwards.
    pub async fn finish(&self) -> SessionResult<()> {
        {
            let mut finished = self.finished.lock();
            if *finished {
                return Ok(());
            }
            *finished = true;
        }
        let mut tail = Vec::new();
        self.transform.lock().finish(&mut tail)?;
        if !tail.is_empty() {
            self.sink.write(&tail).await?;
        }
        let result = self.sink.close();
        if let Some(tx) = self.completion_tx.lock().take() {
            let _ = tx.send(());
        }
        result
    }
}

#[async_trait]
impl<S: ByteSink, T: ByteTransform> ByteSink for TransformWriter<S, T> {
    async fn write(&self, bytes: &[u8]) -> SessionResult<()> {
        TransformWriter::write(self, bytes).await
    }

    fn close(&self) -> SessionResult<()> {
        // Synchronous seam: mark finished and close upstream; tail bytes must
        // be flushed by `finish` before chaining closes.
        *self.finished.lock() = true;
        let result = self.sink.close();
        if let Some(tx) = self.completion_tx.lock().take() {
            let _ = tx.send(());
        }
        result
    }
}
