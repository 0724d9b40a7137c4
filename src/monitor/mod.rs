//! The two independent failure detectors.
//!
//! Neither monitor touches supervisor state. Each reports a [`FaultSignal`](crate::messaging::FaultSignal) on the
//! supervisor's internal channel and the supervisor decides whether it still applies.

pub(crate) mod deadline;
pub(crate) mod liveness;

use std::time::Duration;

use crate::{messaging::FaultKind, worker::WorkerProcess};

/// How long a lost channel waits for the process exit before blaming the transport.
const EXIT_REAP_WINDOW: Duration = Duration::from_millis(200);

/// Decides whether a broken channel means the worker died or only the pipe broke.
pub(crate) async fn classify_loss(worker: &dyn WorkerProcess) -> FaultKind {
    match tokio::time::timeout(EXIT_REAP_WINDOW, worker.exited()).await {
        Ok(exit) => FaultKind::AbnormalExit(exit),
        Err(_) => FaultKind::Transport("worker channel closed".into()),
    }
}

pub(crate) use deadline::TaskDeadlineMonitor;
pub(crate) use liveness::LivenessMonitor;
