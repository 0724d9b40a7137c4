use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    messaging::{FaultKind, FaultSignal, InternalMessage},
    GenerationId, TaskId,
};

/// The deadline of the single in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArmedDeadline {
    pub(crate) task_id: TaskId,
    pub(crate) generation: GenerationId,
    pub(crate) started: Instant,
    pub(crate) deadline: Instant,
}

/// Polls the armed deadline every pulse. A deadline is reported at most once and
/// within one pulse of passing.
pub(crate) struct TaskDeadlineMonitor {
    armed: watch::Sender<Option<ArmedDeadline>>,
}

impl TaskDeadlineMonitor {
    pub(crate) fn new() -> Self {
        let (armed, _) = watch::channel(None);
        Self { armed }
    }

    pub(crate) fn arm(&self, deadline: ArmedDeadline) {
        self.armed.send_replace(Some(deadline));
    }

    pub(crate) fn disarm(&self) {
        self.armed.send_replace(None);
    }

    #[cfg(test)]
    pub(crate) fn armed(&self) -> Option<ArmedDeadline> {
        *self.armed.borrow()
    }

    pub(crate) fn spawn(
        &self,
        pulse: Duration,
        tx: mpsc::UnboundedSender<InternalMessage>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(watch_deadlines(self.armed.subscribe(), pulse, tx, token))
    }
}

async fn watch_deadlines(
    armed: watch::Receiver<Option<ArmedDeadline>>,
    pulse: Duration,
    tx: mpsc::UnboundedSender<InternalMessage>,
    token: CancellationToken,
) {
    let mut ticker = interval(pulse);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut fired: Option<TaskId> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(current) = *armed.borrow() else {
            continue;
        };
        let now = Instant::now();
        if now < current.deadline || fired == Some(current.task_id) {
            continue;
        }
        fired = Some(current.task_id);
        let elapsed = now.duration_since(current.started);
        tracing::warn!(
            task_id = current.task_id,
            generation = current.generation,
            elapsed_ms = elapsed.as_millis() as u64,
            "task deadline exceeded"
        );
        let signal = FaultSignal {
            generation: current.generation,
            kind: FaultKind::TaskDeadlineExceeded {
                task_id: current.task_id,
                elapsed,
            },
        };
        if tx.send(InternalMessage::Fault(signal)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_at(task_id: TaskId, timeout: Duration) -> ArmedDeadline {
        let now = Instant::now();
        ArmedDeadline {
            task_id,
            generation: 1,
            started: now,
            deadline: now + timeout,
        }
    }

    #[tokio::test]
    async fn test_fires_within_one_pulse() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = TaskDeadlineMonitor::new();
        let token = CancellationToken::new();
        monitor.spawn(Duration::from_millis(50), tx, token.clone());

        let started = Instant::now();
        monitor.arm(armed_at(7, Duration::from_millis(120)));

        let Some(InternalMessage::Fault(signal)) = rx.recv().await else {
            panic!("expected a fault");
        };
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(120));
        assert!(waited <= Duration::from_millis(170));
        assert!(matches!(
            signal.kind,
            FaultKind::TaskDeadlineExceeded { task_id: 7, .. }
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn test_fires_once_per_task() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = TaskDeadlineMonitor::new();
        let token = CancellationToken::new();
        monitor.spawn(Duration::from_millis(10), tx, token.clone());
        monitor.arm(armed_at(1, Duration::from_millis(20)));

        assert!(rx.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn test_disarmed_deadline_never_fires() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = TaskDeadlineMonitor::new();
        let token = CancellationToken::new();
        monitor.spawn(Duration::from_millis(10), tx, token.clone());
        monitor.arm(armed_at(1, Duration::from_millis(50)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.disarm();
        assert!(monitor.armed().is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        token.cancel();
    }
}
