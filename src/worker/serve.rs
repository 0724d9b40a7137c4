//! Worker side of the protocol.
//!
//! Heartbeats are answered from the serve loop itself while the extraction runs on
//! its own task, so a slow parse never looks like a dead worker. A wedged parse is
//! the deadline monitor's job.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinSet,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    error::TransportError,
    transport::protocol::{frame_codec, Request, RequestBody, Response, ResponseBody},
};

/// Structured failure reported by an [`Extractor`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExtractFault {
    pub message: String,
}

impl ExtractFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The risky work a worker performs: payload in, content out.
#[async_trait]
pub trait Extractor: Send + Sync + 'static {
    async fn extract(&self, payload: Vec<u8>) -> Result<Vec<u8>, ExtractFault>;
}

#[async_trait]
impl<F, Fut> Extractor for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, ExtractFault>> + Send + 'static,
{
    async fn extract(&self, payload: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
        (self)(payload).await
    }
}

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("i/o error on supervisor channel: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] TransportError),

    #[error("extractor panicked while handling request {request_id:?}")]
    ExtractorPanicked { request_id: Option<u64> },
}

/// Serves requests until the supervisor sends `exit` or closes the channel.
///
/// A panicking extractor ends the loop with [`ServeError::ExtractorPanicked`]: the
/// worker's state is unknown at that point and it must be replaced.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    extractor: Arc<dyn Extractor>,
) -> Result<(), ServeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, frame_codec());
    let mut responses = FramedWrite::new(writer, frame_codec());
    let mut running: JoinSet<(u64, Result<Vec<u8>, ExtractFault>)> = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = running.join_next() => {
                let (id, outcome) = joined.map_err(|_| ServeError::ExtractorPanicked { request_id: None })?;
                let body = match outcome {
                    Ok(payload) => ResponseBody::Success { payload },
                    Err(fault) => ResponseBody::Fault { message: fault.message },
                };
                send(&mut responses, Response { id, body }).await?;
            }
            frame = requests.next() => {
                let Some(frame) = frame else {
                    tracing::debug!("supervisor closed the channel");
                    return Ok(());
                };
                let request = match Request::decode(&frame?) {
                    Ok(request) => request,
                    Err(error) => {
                        tracing::warn!(%error, "ignoring undecodable request");
                        continue;
                    }
                };
                match request.body {
                    RequestBody::Ping => {
                        send(&mut responses, Response { id: request.id, body: ResponseBody::Pong }).await?;
                    }
                    RequestBody::Task { payload } => {
                        if !running.is_empty() {
                            let body = ResponseBody::Fault { message: "worker is busy".into() };
                            send(&mut responses, Response { id: request.id, body }).await?;
                            continue;
                        }
                        let extractor = extractor.clone();
                        let id = request.id;
                        running.spawn(async move { (id, extractor.extract(payload).await) });
                    }
                    RequestBody::Exit => {
                        tracing::debug!("exit requested");
                        running.abort_all();
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn send<W>(
    responses: &mut FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
    response: Response,
) -> Result<(), ServeError>
where
    W: AsyncWrite + Unpin,
{
    responses.send(Bytes::from(response.encode()?)).await?;
    Ok(())
}

/// Entry point for a worker child process. Never returns.
///
/// Speaks the protocol on stdin/stdout and logs to stderr. Exits with status 0 after a
/// clean shutdown, 1 otherwise.
pub fn run_worker_main<E: Extractor>(extractor: E) -> ! {
    crate::logging::init_worker_logging();
    let code = match run_worker(Arc::new(extractor)) {
        Ok(()) => 0,
        Err(error) => {
            tracing::error!(error = format!("{error:#}"), "worker stopped");
            1
        }
    };
    std::process::exit(code)
}

fn run_worker(extractor: Arc<dyn Extractor>) -> anyhow::Result<()> {
    use anyhow::Context;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build worker runtime")?;
    let result = runtime
        .block_on(serve(tokio::io::stdin(), tokio::io::stdout(), extractor))
        .context("worker serve loop failed");
    // A wedged blocking extraction must not keep the process alive.
    runtime.shutdown_background();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    use crate::transport::Transport;

    fn spawn_worker(
        extractor: Arc<dyn Extractor>,
    ) -> (Transport, tokio::task::JoinHandle<Result<(), ServeError>>) {
        let (ours, theirs) = duplex(64 * 1024);
        let (read, write) = split(ours);
        let (worker_read, worker_write) = split(theirs);
        let handle = tokio::spawn(serve(worker_read, worker_write, extractor));
        (Transport::new(read, write), handle)
    }

    async fn upper(payload: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
        Ok(payload.to_ascii_uppercase())
    }

    async fn encrypted(_: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
        Err(ExtractFault::new("encrypted document"))
    }

    async fn never(_: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
        std::future::pending().await
    }

    async fn explode(_: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
        panic!("parser blew up")
    }

    #[tokio::test]
    async fn test_ping_and_task() {
        let (transport, _worker) = spawn_worker(Arc::new(upper));
        assert_eq!(
            transport.request(RequestBody::Ping, None).await.unwrap(),
            ResponseBody::Pong
        );
        let response = transport
            .request(
                RequestBody::Task {
                    payload: b"abc".to_vec(),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            ResponseBody::Success {
                payload: b"ABC".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_fault_is_reported() {
        let (transport, _worker) = spawn_worker(Arc::new(encrypted));
        let response = transport
            .request(RequestBody::Task { payload: vec![1] }, None)
            .await
            .unwrap();
        assert_eq!(
            response,
            ResponseBody::Fault {
                message: "encrypted document".into()
            }
        );
    }

    #[tokio::test]
    async fn test_pings_answered_while_task_runs() {
        let (transport, _worker) = spawn_worker(Arc::new(never));
        let transport = Arc::new(transport);
        let stuck = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .request(RequestBody::Task { payload: vec![] }, None)
                    .await
            })
        };
        for _ in 0..3 {
            let pong = transport
                .request(RequestBody::Ping, Some(std::time::Duration::from_secs(1)))
                .await;
            assert_eq!(pong, Ok(ResponseBody::Pong));
        }
        assert!(!stuck.is_finished());
    }

    #[tokio::test]
    async fn test_exit_request_stops_loop() {
        let (transport, worker) = spawn_worker(Arc::new(upper));
        transport.notify(RequestBody::Exit).await.unwrap();
        assert!(worker.await.unwrap().is_ok());
        transport.closed().await;
    }

    #[tokio::test]
    async fn test_extractor_panic_ends_worker() {
        let (transport, worker) = spawn_worker(Arc::new(explode));
        let result = transport
            .request(RequestBody::Task { payload: vec![] }, None)
            .await;
        assert_eq!(result, Err(TransportError::Closed));
        assert!(matches!(
            worker.await.unwrap(),
            Err(ServeError::ExtractorPanicked { .. })
        ));
    }
}
