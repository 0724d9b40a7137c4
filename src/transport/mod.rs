//! Framed request/response channel between the supervisor and one worker.
//!
//! A [`Transport`] owns both halves of a byte stream (child stdio, or an in-memory
//! duplex for in-process workers). Requests are tagged with ids and matched against
//! responses by a background reader, so a heartbeat and a task can be outstanding at
//! the same time. The transport never retries; callers decide what a failure means.

pub mod protocol;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};

use crate::error::TransportError;
use protocol::{frame_codec, Request, RequestBody, Response, ResponseBody};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>>;
type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

/// Supervisor side of a worker channel.
pub struct Transport {
    writer: tokio::sync::Mutex<FrameWriter>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl Transport {
    /// Wraps a byte stream. Must be called inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_responses(
            FramedRead::new(reader, frame_codec()),
            pending.clone(),
            closed.clone(),
        ));
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            writer: tokio::sync::Mutex::new(FramedWrite::new(writer, frame_codec())),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader,
        }
    }

    /// Sends `body` and waits for the matching response.
    ///
    /// `timeout` bounds the whole exchange, including a write blocked on a full pipe.
    pub async fn request(
        &self,
        body: RequestBody,
        timeout: Option<Duration>,
    ) -> Result<ResponseBody, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Request { id, body }.encode()?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        // The reader cancels before draining, so a request registered after the
        // drain still observes the closed flag here.
        if self.is_closed() {
            lock(&self.pending).remove(&id);
            return Err(TransportError::Closed);
        }

        let exchange = async {
            self.write(frame).await?;
            rx.await.map_err(|_| TransportError::Closed)
        };
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => exchange.await,
        };
        if result.is_err() {
            lock(&self.pending).remove(&id);
        }
        result
    }

    /// Sends `body` without waiting for a response.
    pub async fn notify(&self, body: RequestBody) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Request { id, body }.encode()?;
        self.write(frame).await
    }

    async fn write(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.send(Bytes::from(frame)).await {
            tracing::debug!(%error, "worker channel write failed");
            self.close();
            return Err(TransportError::Io(error.to_string()));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed, by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Closes the channel and fails every outstanding request. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
        self.reader.abort();
        lock(&self.pending).clear();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_responses<R>(
    mut frames: FramedRead<R, LengthDelimitedCodec>,
    pending: Pending,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => match Response::decode(&bytes) {
                Ok(response) => {
                    let waiter = lock(&pending).remove(&response.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response.body);
                        }
                        None => {
                            tracing::trace!(id = response.id, "dropping response to abandoned request")
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "malformed frame from worker, closing channel");
                    break;
                }
            },
            Some(Err(error)) => {
                tracing::debug!(%error, "worker channel read failed");
                break;
            }
            None => {
                tracing::debug!("worker channel reached end of stream");
                break;
            }
        }
    }
    closed.cancel();
    lock(&pending).clear();
}
