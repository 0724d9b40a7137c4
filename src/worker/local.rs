//! In-process workers, used when process spawning is disabled.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{duplex, split},
    task::AbortHandle,
};

use super::{serve, ExitWatch, Extractor, WorkerExit, WorkerLauncher, WorkerProcess};
use crate::{
    error::SpawnError, transport::protocol::RequestBody, transport::Transport, GenerationId,
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Runs each generation's serve loop on a tokio task behind an in-memory pipe.
pub struct LocalLauncher {
    extractor: Arc<dyn Extractor>,
}

impl LocalLauncher {
    pub fn new(extractor: impl Extractor) -> Self {
        Self {
            extractor: Arc::new(extractor),
        }
    }

    pub fn from_arc(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(&self, generation: GenerationId) -> Result<Arc<dyn WorkerProcess>, SpawnError> {
        let (supervisor_end, worker_end) = duplex(PIPE_CAPACITY);
        let (worker_read, worker_write) = split(worker_end);
        let (read, write) = split(supervisor_end);

        let serving = tokio::spawn(serve(worker_read, worker_write, self.extractor.clone()));
        let abort = serving.abort_handle();
        let exit = ExitWatch::spawn(async move {
            match serving.await {
                Ok(Ok(())) => WorkerExit::Code(0),
                Ok(Err(error)) => {
                    tracing::warn!(generation, %error, "in-process worker failed");
                    WorkerExit::Code(1)
                }
                Err(joined) if joined.is_cancelled() => WorkerExit::Killed,
                Err(_) => WorkerExit::Code(101),
            }
        });

        Ok(Arc::new(LocalWorker {
            transport: Transport::new(read, write),
            exit,
            abort,
        }))
    }
}

struct LocalWorker {
    transport: Transport,
    exit: ExitWatch,
    abort: AbortHandle,
}

#[async_trait]
impl WorkerProcess for LocalWorker {
    fn transport(&self) -> &Transport {
        &self.transport
    }

    fn exit_status(&self) -> Option<WorkerExit> {
        self.exit.status()
    }

    async fn exited(&self) -> WorkerExit {
        self.exit.wait().await
    }

    async fn terminate(&self, grace: Duration) {
        if self.exit.status().is_none() {
            let _ = tokio::time::timeout(grace, self.transport.notify(RequestBody::Exit)).await;
            if tokio::time::timeout(grace, self.exit.wait()).await.is_err() {
                self.abort.abort();
                let _ = tokio::time::timeout(grace, self.exit.wait()).await;
            }
        }
        self.transport.close();
    }
}
