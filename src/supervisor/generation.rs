use std::{fmt, sync::Arc};

use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{messaging::TaskOutcome, worker::WorkerProcess, GenerationId, TaskId};

/// Lifecycle of one worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Starting,
    Ready,
    Busy,
    Dead,
}

impl GenerationStatus {
    /// Ready or busy: the generation is the one serving requests.
    pub fn is_active(&self) -> bool {
        matches!(self, GenerationStatus::Ready | GenerationStatus::Busy)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, GenerationStatus::Dead)
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// One spawned worker. Never reused once dead.
pub(crate) struct WorkerGeneration {
    pub(crate) id: GenerationId,
    pub(crate) worker: Arc<dyn WorkerProcess>,
    pub(crate) spawned_at: Instant,
    pub(crate) status: GenerationStatus,
    /// Cancelled when the generation dies; scopes its monitors.
    pub(crate) token: CancellationToken,
}

impl WorkerGeneration {
    pub(crate) fn new(
        id: GenerationId,
        worker: Arc<dyn WorkerProcess>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            worker,
            spawned_at: Instant::now(),
            status: GenerationStatus::Starting,
            token,
        }
    }

    pub(crate) fn mark(&mut self, status: GenerationStatus) {
        self.status = status;
        if status.is_dead() {
            self.token.cancel();
        }
    }
}

impl fmt::Debug for WorkerGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGeneration")
            .field("id", &self.id)
            .field("pid", &self.worker.pid())
            .field("status", &self.status)
            .finish()
    }
}

/// The task currently assigned to the active generation.
#[derive(Debug)]
pub(crate) struct InFlightTask {
    pub(crate) id: TaskId,
    pub(crate) generation: GenerationId,
    pub(crate) submitted_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) reply: oneshot::Sender<TaskOutcome>,
}

impl InFlightTask {
    pub(crate) fn resolve(self, outcome: TaskOutcome) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(outcome);
    }
}
