//! Disposable workers that run the risky extraction work.
//!
//! A [`WorkerLauncher`] produces one [`WorkerProcess`] per generation. Two launchers
//! ship with the crate:
//!
//! - [`ProcessLauncher`]: an OS child process speaking the protocol over stdin/stdout,
//!   with an optional address-space ceiling. Crashes stay in the child.
//! - [`LocalLauncher`]: the same serve loop on a tokio task behind an in-memory pipe.
//!   Hangs and panics are contained, native crashes are not.
//!
//! A child binary only needs to call [`run_worker_main`] with its [`Extractor`].

mod local;
mod process;
mod serve;

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::watch, time::Instant};

use crate::{
    error::{SpawnError, TransportError},
    transport::{
        protocol::{RequestBody, ResponseBody},
        Transport,
    },
    GenerationId,
};

pub use local::LocalLauncher;
pub use process::{ProcessLauncher, WorkerCommand, GENERATION_ENV, MAX_MEMORY_ENV};
pub use serve::{run_worker_main, serve, ExtractFault, Extractor, ServeError};

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited with a status code.
    Code(i32),
    /// Terminated by a signal.
    Signal(i32),
    /// Forcibly stopped by the supervisor.
    Killed,
    /// The exit could not be observed.
    Unknown,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Killed => write!(f, "killed"),
            Self::Unknown => write!(f, "unknown exit"),
        }
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => WorkerExit::Code(code),
            (None, Some(signal)) => WorkerExit::Signal(signal),
            (None, None) => WorkerExit::Unknown,
        }
    }
}

/// Cheap, cloneable view of a worker's exit status.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<WorkerExit>>,
}

impl ExitWatch {
    /// Publishes the output of `exit` once it resolves.
    pub fn spawn<F>(exit: F) -> Self
    where
        F: Future<Output = WorkerExit> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = exit.await;
            let _ = tx.send(Some(status));
        });
        Self { rx }
    }

    /// `None` while the worker is still running.
    pub fn status(&self) -> Option<WorkerExit> {
        *self.rx.borrow()
    }

    pub async fn wait(&self) -> WorkerExit {
        let mut rx = self.rx.clone();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(WorkerExit::Unknown),
            Err(_) => WorkerExit::Unknown,
        };
        status
    }
}

/// One running worker and its channel.
#[async_trait]
pub trait WorkerProcess: Send + Sync + 'static {
    fn transport(&self) -> &Transport;

    /// The worker's exit, if it has already ended. Independent of the ping protocol.
    fn exit_status(&self) -> Option<WorkerExit>;

    /// Resolves when the worker ends.
    async fn exited(&self) -> WorkerExit;

    /// Asks the worker to stop, escalating to a forced stop after `grace`.
    /// Releases the channel. Calling it on a stopped worker does nothing.
    async fn terminate(&self, grace: Duration);

    /// OS process id, if any.
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        self.exit_status().is_none()
    }
}

/// Produces fresh workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Starts a worker for `generation`. Returns as soon as it is started; the
    /// handshake is the caller's job.
    async fn launch(&self, generation: GenerationId) -> Result<Arc<dyn WorkerProcess>, SpawnError>;
}

/// Initial round-trip probe. Returns the round-trip time.
pub async fn handshake(worker: &dyn WorkerProcess, bound: Duration) -> Result<Duration, SpawnError> {
    let started = Instant::now();
    match worker.transport().request(RequestBody::Ping, Some(bound)).await {
        Ok(ResponseBody::Pong) => Ok(started.elapsed()),
        Ok(other) => Err(SpawnError::Handshake(format!(
            "unexpected reply to handshake: {other}"
        ))),
        Err(TransportError::Timeout(_)) => Err(SpawnError::StartupTimeout { bound }),
        Err(error) => Err(SpawnError::Handshake(error.to_string())),
    }
}
