//! Async push queue
//!
//! Ordered multi-producer, single-consumer channel used for both directions
//! of session traffic: user turns flowing into the engine and permission
//! requests flowing out to the caller.
//!
//! - `push` never blocks and buffers without bound
//! - `end` lets the consumer drain what is buffered, then observe completion
//! - the consumer holds an exclusive [`QueueStream`]; dropping it cancels the
//!   read immediately and leaves undelivered values in the queue

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Error, Result};

pub struct PushQueue<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Default for PushQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PushQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    /// Enqueue a value for the consumer
    ///
    /// Fails with [`Error::QueueClosed`] once [`end`](Self::end) was called.
    pub fn push(&self, value: T) -> Result<()> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(value).map_err(|_| Error::QueueClosed),
            None => Err(Error::QueueClosed),
        }
    }

    /// Mark the end of the stream; returns false if it had already ended
    pub fn end(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Take exclusive read access
    ///
    /// Only one consumer may read at a time; a second concurrent caller gets
    /// [`Error::InvalidState`]. Once the first stream is dropped a new one can
    /// pick up where it left off.
    pub fn consume(&self) -> Result<QueueStream<T>> {
        let guard = self
            .rx
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::InvalidState("queue already has a consumer".to_string()))?;
        Ok(QueueStream { guard })
    }
}

/// Exclusive reading end of a [`PushQueue`]
pub struct QueueStream<T> {
    guard: OwnedMutexGuard<mpsc::UnboundedReceiver<T>>,
}

impl<T> Stream for QueueStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.guard.poll_recv(cx)
    }
}
