//! Error types surfaced by the watchdog.
//!
//! - [`TaskFailure`]: what a caller of [`SupervisorHandle::submit`](crate::SupervisorHandle::submit) sees.
//! - [`SupervisorError`]: why the supervisor itself stopped.
//! - [`SpawnError`]: a worker generation failed to start.
//! - [`TransportError`]: the framed channel to a worker broke or timed out.
//! - [`ConfigError`]: rejected configuration.

use std::time::Duration;

use thiserror::Error;

use crate::{worker::WorkerExit, GenerationId, TaskId};

/// Failure of a single submitted task.
///
/// Worker-level faults (`LivenessTimeout`, `TaskDeadlineExceeded`, `AbnormalExit`,
/// `TransportError`) are retryable: the worker was replaced and a resubmission
/// will run on a fresh generation. The core never resubmits on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The worker stopped answering heartbeats while the task was in flight.
    #[error("worker generation {generation} missed a heartbeat (timeout {timeout:?})")]
    LivenessTimeout {
        generation: GenerationId,
        timeout: Duration,
    },

    /// The task ran past its deadline; the worker was discarded.
    #[error("task {task_id} exceeded its deadline of {timeout:?} on generation {generation} (ran {elapsed:?})")]
    TaskDeadlineExceeded {
        task_id: TaskId,
        generation: GenerationId,
        elapsed: Duration,
        timeout: Duration,
    },

    /// The worker process terminated on its own (crash, OOM kill, ...).
    #[error("worker generation {generation} exited unexpectedly: {exit}")]
    AbnormalExit {
        generation: GenerationId,
        exit: WorkerExit,
    },

    /// The channel to the worker failed while the process was still around.
    #[error("transport to worker generation {generation} failed: {reason}")]
    TransportError {
        generation: GenerationId,
        reason: String,
    },

    /// The worker is healthy but reported a structured extraction fault.
    #[error("extraction failed: {message}")]
    Extraction { message: String },

    /// The bounded request queue was full.
    #[error("request queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// No worker can be produced anymore.
    #[error("service unavailable: restart budget exhausted after {attempts} attempts")]
    Unavailable { attempts: u32 },

    /// The supervisor was shut down before the task resolved.
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// The supervisor is no longer running.
    #[error("supervisor is not running")]
    SupervisorStopped,
}

impl TaskFailure {
    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskFailure::LivenessTimeout { .. }
                | TaskFailure::TaskDeadlineExceeded { .. }
                | TaskFailure::AbnormalExit { .. }
                | TaskFailure::TransportError { .. }
        )
    }

    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskFailure::LivenessTimeout { .. } => "liveness_timeout",
            TaskFailure::TaskDeadlineExceeded { .. } => "task_deadline_exceeded",
            TaskFailure::AbnormalExit { .. } => "abnormal_exit",
            TaskFailure::TransportError { .. } => "transport_error",
            TaskFailure::Extraction { .. } => "extraction_fault",
            TaskFailure::QueueFull { .. } => "queue_full",
            TaskFailure::Unavailable { .. } => "unavailable",
            TaskFailure::ShuttingDown => "shutting_down",
            TaskFailure::SupervisorStopped => "supervisor_stopped",
        }
    }
}

/// Why the supervisor stopped serving.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// Consecutive spawn failures used up the restart budget.
    #[error("restart budget exhausted after {attempts} consecutive failed spawns; last error: {last_error}")]
    RestartBudgetExhausted { attempts: u32, last_error: String },

    /// The supervisor loop ended without reporting a result.
    #[error("supervisor loop aborted")]
    Aborted,
}

/// A worker generation could not be brought to READY.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("worker did not complete its handshake within {bound:?}")]
    StartupTimeout { bound: Duration },

    #[error("worker handshake failed: {0}")]
    Handshake(String),
}

/// Failures of the framed channel to a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Rejected configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("spawn_worker is enabled but no worker command was given")]
    MissingWorkerCommand,

    #[error("spawn_worker is disabled but no in-process extractor was given")]
    MissingExtractor,

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },
}
