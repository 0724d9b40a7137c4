use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::classify_loss;
use crate::{
    error::TransportError,
    messaging::{FaultKind, FaultSignal, InternalMessage},
    transport::protocol::{RequestBody, ResponseBody},
    worker::WorkerProcess,
    GenerationId,
};

enum Probe {
    Healthy(Duration),
    Failed(FaultKind),
    Cancelled,
}

/// Heartbeats one generation until it faults or its token is cancelled.
///
/// Also watches the process exit and the channel directly, so a worker that dies
/// between pulses is reported without waiting for the next probe. Reports at most
/// one fault per generation.
pub(crate) struct LivenessMonitor {
    pub(crate) generation: GenerationId,
    pub(crate) worker: Arc<dyn WorkerProcess>,
    pub(crate) pulse: Duration,
    pub(crate) timeout: Duration,
    pub(crate) tx: mpsc::UnboundedSender<InternalMessage>,
    pub(crate) token: CancellationToken,
}

impl LivenessMonitor {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.pulse, self.pulse);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let fault = loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                exit = self.worker.exited() => break FaultKind::AbnormalExit(exit),
                _ = self.worker.transport().closed() => break classify_loss(&*self.worker).await,
                _ = ticker.tick() => match self.probe().await {
                    Probe::Healthy(rtt) => {
                        tracing::trace!(generation = self.generation, rtt_ms = rtt.as_millis() as u64, "heartbeat");
                        let pong = InternalMessage::Pong { generation: self.generation, rtt };
                        if self.tx.send(pong).is_err() {
                            return;
                        }
                    }
                    Probe::Failed(fault) => break fault,
                    Probe::Cancelled => return,
                },
            }
        };

        if self.token.is_cancelled() {
            return;
        }
        tracing::warn!(generation = self.generation, ?fault, "liveness check failed");
        let _ = self.tx.send(InternalMessage::Fault(FaultSignal {
            generation: self.generation,
            kind: fault,
        }));
    }

    async fn probe(&self) -> Probe {
        let started = Instant::now();
        let reply = tokio::select! {
            _ = self.token.cancelled() => return Probe::Cancelled,
            reply = self.worker.transport().request(RequestBody::Ping, Some(self.timeout)) => reply,
        };
        match reply {
            Ok(ResponseBody::Pong) => Probe::Healthy(started.elapsed()),
            Ok(other) => Probe::Failed(FaultKind::Transport(format!(
                "unexpected reply to heartbeat: {other}"
            ))),
            Err(TransportError::Timeout(_)) => Probe::Failed(FaultKind::LivenessTimeout {
                timeout: self.timeout,
            }),
            Err(_) => Probe::Failed(classify_loss(&*self.worker).await),
        }
    }
}
