use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};

use crate::{
    error::{SupervisorError, TaskFailure},
    messaging::{PendingRequest, SupervisorMessage, TaskOutcome},
    supervisor::SupervisorStatus,
};

#[derive(Debug, Error)]
pub enum SupervisorHandleError {
    #[error("Failed to send message to supervisor: {0}")]
    SendError(String),
    #[error("Supervisor dropped the reply")]
    RecvError,
    #[error("Status reporting is disabled")]
    StatusDisabled,
}

/// Resolves to the outcome of one submitted request.
///
/// The request is queued when [`SupervisorHandle::submit`] returns, so tickets
/// created one after the other are served in that order even if they are awaited
/// in a different one. Dropping the ticket abandons the request.
#[derive(Debug)]
#[must_use = "dropping a ticket abandons the request"]
pub struct TaskTicket {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl Future for TaskTicket {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskFailure::SupervisorStopped)))
    }
}

/// Cloneable front door of a running [`Supervisor`](crate::Supervisor).
///
/// The supervisor shuts down once every handle is dropped.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorMessage>,
    result: watch::Receiver<Option<Result<(), SupervisorError>>>,
    status_enabled: bool,
}

impl SupervisorHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<SupervisorMessage>,
        result: watch::Receiver<Option<Result<(), SupervisorError>>>,
        status_enabled: bool,
    ) -> Self {
        Self {
            tx,
            result,
            status_enabled,
        }
    }

    /// Submits one extraction request.
    ///
    /// Worker faults resolve the ticket with a retryable [`TaskFailure`]; the
    /// request is never resubmitted on the caller's behalf.
    pub fn submit(&self, payload: impl Into<Vec<u8>>) -> TaskTicket {
        let (reply, rx) = oneshot::channel();
        let request = PendingRequest {
            payload: payload.into(),
            reply,
            received_at: Instant::now(),
        };
        // On failure the reply sender is dropped with the message and the ticket
        // resolves to `SupervisorStopped`.
        let _ = self.tx.send(SupervisorMessage::Submit(request));
        TaskTicket { rx }
    }

    /// Returns a snapshot of the supervisor's state.
    pub async fn status(&self) -> Result<SupervisorStatus, SupervisorHandleError> {
        if !self.status_enabled {
            return Err(SupervisorHandleError::StatusDisabled);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMessage::GetStatus(reply))
            .map_err(|e| SupervisorHandleError::SendError(e.to_string()))?;
        rx.await.map_err(|_| SupervisorHandleError::RecvError)
    }

    /// Stops the supervisor. Pending and queued requests fail with
    /// [`TaskFailure::ShuttingDown`] and the active worker is terminated.
    pub fn shutdown(&self) -> Result<(), SupervisorHandleError> {
        self.tx
            .send(SupervisorMessage::Shutdown)
            .map_err(|e| SupervisorHandleError::SendError(e.to_string()))
    }

    /// Waits until the supervisor stops. Any number of handles may wait.
    ///
    /// Returns an error when the supervisor gave up because no worker could be started.
    pub async fn wait(&self) -> Result<(), SupervisorError> {
        let mut result = self.result.clone();
        let outcome = match result.wait_for(Option::is_some).await {
            Ok(finished) => (*finished).clone().unwrap_or(Err(SupervisorError::Aborted)),
            Err(_) => Err(SupervisorError::Aborted),
        };
        outcome
    }

    /// Whether the supervisor loop has ended.
    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some() || self.tx.is_closed()
    }
}
