//! Bounded byte channels connecting pipeline stages
//!
//! A [`Channel`] is the in-process replacement for an OS pipe: it carries
//! chunks of bytes from producers to one consumer, applies backpressure once
//! `capacity` chunks are buffered and can be failed to wake every task that is
//! blocked on it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::{HalError, HalResult};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a bounded FIFO byte channel.
///
/// Clones share the same underlying stream and compare equal, which is how a
/// sub-shell writes to literally the same stdout as its parent.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: u64,
    capacity: usize,
    chunk_size: usize,
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    receiver: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    // Serializes multi-chunk writes from producers sharing the handle.
    write_lock: AsyncMutex<()>,
    failure: Mutex<Option<String>>,
    failed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Channel {
    /// Create a channel buffering at most `capacity` chunks of at most
    /// `chunk_size` bytes. Zero values are clamped to 1.
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(ChannelInner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                capacity,
                chunk_size: chunk_size.max(1),
                sender: Mutex::new(Some(tx)),
                receiver: AsyncMutex::new(rx),
                write_lock: AsyncMutex::new(()),
                failure: Mutex::new(None),
                failed: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// True once the producer side closed (normally or in the error state).
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.is_cancelled()
    }

    /// Reason passed to the first [`Channel::fail`] call, if any.
    pub fn failure(&self) -> Option<String> {
        lock(&self.inner.failure).clone()
    }

    /// Write `bytes` as consecutive chunks of at most `chunk_size` bytes.
    ///
    /// Suspends while the buffer is full. Fails with `ClosedChannel` when the
    /// channel was closed before the call and with `ChannelFailed` when the
    /// channel is failed while this write is pending. A close that lands
    /// mid-write lets the chunk in flight through and rejects the rest with
    /// `ClosedChannel`.
    pub async fn write(&self, bytes: &[u8]) -> HalResult<()> {
        let _guard = tokio::select! {
            biased;
            _ = self.inner.failed.cancelled() => return Err(self.failed_error()),
            guard = self.inner.write_lock.lock() => guard,
        };
        let sender = self.sender()?;

        for (index, piece) in bytes.chunks(self.inner.chunk_size).enumerate() {
            if index > 0 && self.is_closed() {
                tracing::debug!(channel = self.inner.id, "channel closed during write");
                return Err(if self.is_failed() {
                    self.failed_error()
                } else {
                    HalError::ClosedChannel { channel: self.inner.id }
                });
            }
            tokio::select! {
                biased;
                _ = self.inner.failed.cancelled() => {
                    tracing::debug!(channel = self.inner.id, "pending write cancelled");
                    return Err(self.failed_error());
                }
                sent = sender.send(piece.to_vec()) => {
                    if sent.is_err() {
                        return Err(HalError::ClosedChannel { channel: self.inner.id });
                    }
                }
            }
        }
        Ok(())
    }

    /// Read the next chunk.
    ///
    /// Returns `Ok(None)` once the channel is closed and drained.
    pub async fn read(&self) -> HalResult<Option<Vec<u8>>> {
        let mut receiver = tokio::select! {
            biased;
            _ = self.inner.failed.cancelled() => return Err(self.failed_error()),
            receiver = self.inner.receiver.lock() => receiver,
        };
        tokio::select! {
            biased;
            _ = self.inner.failed.cancelled() => Err(self.failed_error()),
            chunk = receiver.recv() => Ok(chunk),
        }
    }

    /// Read until end of stream and concatenate every chunk.
    pub async fn read_to_end(&self) -> HalResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Signal normal completion to the reader. Idempotent.
    ///
    /// A write already in progress stops after its current chunk.
    pub fn close(&self) {
        if lock(&self.inner.sender).take().is_some() {
            tracing::trace!(channel = self.inner.id, "channel closed");
        }
    }

    /// Close the channel in the error state, waking every blocked reader and
    /// writer. The first reason is kept.
    pub fn fail(&self, reason: impl Into<String>) {
        {
            let mut failure = lock(&self.inner.failure);
            if failure.is_none() {
                let reason = reason.into();
                tracing::debug!(channel = self.inner.id, %reason, "channel failed");
                *failure = Some(reason);
            }
        }
        lock(&self.inner.sender).take();
        self.inner.failed.cancel();
    }

    fn sender(&self) -> HalResult<mpsc::Sender<Vec<u8>>> {
        if self.is_failed() {
            return Err(self.failed_error());
        }
        lock(&self.inner.sender)
            .clone()
            .ok_or(HalError::ClosedChannel {
                channel: self.inner.id,
            })
    }

    fn failed_error(&self) -> HalError {
        HalError::ChannelFailed {
            channel: self.inner.id,
            reason: self.failure().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("chunk_size", &self.inner.chunk_size)
            .field("closed", &self.is_closed())
            .field("failed", &self.is_failed())
            .finish()
    }
}
