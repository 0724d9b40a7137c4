use std::time::Duration;

use tokio::{sync::oneshot, time::Instant};

use crate::{
    error::{SupervisorError, TaskFailure},
    supervisor::{generation::WorkerGeneration, SupervisorStatus},
    transport::protocol::ResponseBody,
    worker::WorkerExit,
    GenerationId, TaskId,
};

/// Result delivered to a caller.
pub type TaskOutcome = Result<Vec<u8>, TaskFailure>;

/// A request waiting to be dispatched.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) payload: Vec<u8>,
    pub(crate) reply: oneshot::Sender<TaskOutcome>,
    pub(crate) received_at: Instant,
}

/// Sent by handles to the supervisor.
#[derive(Debug)]
pub(crate) enum SupervisorMessage {
    Submit(PendingRequest),
    GetStatus(oneshot::Sender<SupervisorStatus>),
    Shutdown,
}

/// What a monitor or dispatcher observed about a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FaultKind {
    LivenessTimeout { timeout: Duration },
    TaskDeadlineExceeded { task_id: TaskId, elapsed: Duration },
    AbnormalExit(WorkerExit),
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FaultSignal {
    pub(crate) generation: GenerationId,
    pub(crate) kind: FaultKind,
}

/// Sent to the supervisor by its own execution units. Only the supervisor loop
/// mutates state; everything else reports here.
#[derive(Debug)]
pub(crate) enum InternalMessage {
    Fault(FaultSignal),
    TaskCompleted {
        task_id: TaskId,
        generation: GenerationId,
        response: ResponseBody,
    },
    Pong {
        generation: GenerationId,
        rtt: Duration,
    },
    Spawning(GenerationId),
    GenerationReady(WorkerGeneration),
    RecoveryFailed(SupervisorError),
}
