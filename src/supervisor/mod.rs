pub(crate) mod builder;
pub(crate) mod generation;
pub(crate) mod handle;
pub(crate) mod router;

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::WatchdogConfig,
    error::{SpawnError, SupervisorError, TaskFailure},
    messaging::{FaultKind, FaultSignal, InternalMessage, PendingRequest, SupervisorMessage},
    monitor::{classify_loss, deadline::ArmedDeadline, LivenessMonitor, TaskDeadlineMonitor},
    transport::protocol::{RequestBody, ResponseBody},
    worker::{handshake, WorkerLauncher, WorkerProcess},
    GenerationId, TaskId,
};
use generation::{GenerationStatus, InFlightTask, WorkerGeneration};
use handle::SupervisorHandle;
use router::RequestRouter;

/// Point-in-time view of the supervisor, returned by [`SupervisorHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// The active generation, or the one being started during recovery.
    pub generation: Option<GenerationId>,
    pub state: GenerationStatus,
    /// Round-trip time of the latest successful heartbeat of the active generation.
    pub last_ping_rtt: Option<Duration>,
    /// Generations discarded because of a fault.
    pub restarts: u64,
    pub queued: usize,
    pub in_flight: Option<TaskId>,
}

/// Keeps exactly one healthy worker generation serving requests.
///
/// The supervisor owns every piece of mutable state: the active generation, the
/// in-flight task and the request queue. Monitors, dispatchers and recovery run as
/// separate tasks and only report back through the internal channel, so the first
/// fault reported for a generation wins and later ones find it already dead.
pub struct Supervisor {
    config: WatchdogConfig,
    launcher: Arc<dyn WorkerLauncher>,
    active: Option<WorkerGeneration>,
    starting: Option<GenerationId>,
    in_flight: Option<InFlightTask>,
    router: RequestRouter,
    deadlines: TaskDeadlineMonitor,
    next_generation: Arc<AtomicU64>,
    restarts: u64,
    last_ping_rtt: Option<Duration>,
    recovery: Option<JoinHandle<()>>,
    monitors: CancellationToken,
    tx: mpsc::UnboundedSender<InternalMessage>,
    rx: mpsc::UnboundedReceiver<InternalMessage>,
}

impl Supervisor {
    pub(crate) fn new(config: WatchdogConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            router: RequestRouter::new(config.queue_capacity),
            config,
            launcher,
            active: None,
            starting: None,
            in_flight: None,
            deadlines: TaskDeadlineMonitor::new(),
            next_generation: Arc::new(AtomicU64::new(1)),
            restarts: 0,
            last_ping_rtt: None,
            recovery: None,
            monitors: CancellationToken::new(),
            tx,
            rx,
        }
    }

    /// Runs the supervisor, consuming it and returning a handle for external control.
    ///
    /// The first worker generation is started in the background; requests submitted
    /// before it is ready are queued.
    pub fn run(self) -> SupervisorHandle {
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = watch::channel(None);
        let status_enabled = self.config.status;
        tokio::spawn(async move {
            let result = self.run_and_supervise(external_rx).await;
            if let Err(error) = &result {
                tracing::error!(%error, "supervisor stopped");
            }
            let _ = result_tx.send(Some(result));
        });
        SupervisorHandle::new(external_tx, result_rx, status_enabled)
    }

    async fn run_and_supervise(
        mut self,
        mut external_rx: mpsc::UnboundedReceiver<SupervisorMessage>,
    ) -> Result<(), SupervisorError> {
        self.deadlines
            .spawn(self.config.task_pulse(), self.tx.clone(), self.monitors.clone());
        self.begin_recovery(None);

        let result = loop {
            tokio::select! {
                Some(internal_msg) = self.rx.recv() => {
                    if let ControlFlow::Break(result) = self.handle_internal_message(internal_msg) {
                        break result;
                    }
                },
                user_msg = external_rx.recv() => {
                    let Some(user_msg) = user_msg else {
                        tracing::info!("all supervisor handles dropped; shutting down");
                        break Ok(());
                    };
                    if let ControlFlow::Break(result) = self.handle_user_message(user_msg) {
                        break result;
                    }
                }
            }
        };

        let failure = match &result {
            Ok(()) => TaskFailure::ShuttingDown,
            Err(SupervisorError::RestartBudgetExhausted { attempts, .. }) => {
                TaskFailure::Unavailable {
                    attempts: *attempts,
                }
            }
            Err(SupervisorError::Aborted) => TaskFailure::SupervisorStopped,
        };
        self.stop(failure, &mut external_rx).await;
        result
    }

    fn handle_internal_message(
        &mut self,
        msg: InternalMessage,
    ) -> ControlFlow<Result<(), SupervisorError>> {
        match msg {
            InternalMessage::Fault(signal) => self.handle_fault(signal),
            InternalMessage::TaskCompleted {
                task_id,
                generation,
                response,
            } => self.handle_task_completion(task_id, generation, response),
            InternalMessage::Pong { generation, rtt } => {
                if self.active_id() == Some(generation) {
                    self.last_ping_rtt = Some(rtt);
                }
            }
            InternalMessage::Spawning(generation) => {
                self.starting = Some(generation);
            }
            InternalMessage::GenerationReady(generation) => self.activate(generation),
            InternalMessage::RecoveryFailed(error) => return ControlFlow::Break(Err(error)),
        }
        ControlFlow::Continue(())
    }

    /// Processes commands received via the `SupervisorHandle`.
    fn handle_user_message(
        &mut self,
        msg: SupervisorMessage,
    ) -> ControlFlow<Result<(), SupervisorError>> {
        match msg {
            SupervisorMessage::Submit(request) => {
                self.admit(request);
                self.dispatch_next();
            }
            SupervisorMessage::GetStatus(reply) => {
                let _ = reply.send(self.status());
            }
            SupervisorMessage::Shutdown => {
                tracing::info!("shutdown requested");
                return ControlFlow::Break(Ok(()));
            }
        }
        ControlFlow::Continue(())
    }

    fn admit(&mut self, request: PendingRequest) {
        if let Err(rejected) = self.router.admit(request) {
            let capacity = self.router.capacity();
            tracing::warn!(capacity, "request queue is full; rejecting request");
            let _ = rejected
                .reply
                .send(Err(TaskFailure::QueueFull { capacity }));
        }
    }

    fn active_id(&self) -> Option<GenerationId> {
        self.active.as_ref().map(|generation| generation.id)
    }

    fn status(&self) -> SupervisorStatus {
        let state = match (&self.active, self.starting) {
            (Some(active), _) => active.status,
            (None, Some(_)) => GenerationStatus::Starting,
            (None, None) => GenerationStatus::Dead,
        };
        SupervisorStatus {
            generation: self.active_id().or(self.starting),
            state,
            last_ping_rtt: self.last_ping_rtt,
            restarts: self.restarts,
            queued: self.router.len(),
            in_flight: self.in_flight.as_ref().map(|task| task.id),
        }
    }

    /// Makes a freshly handshaken generation the active one and resumes routing.
    fn activate(&mut self, mut generation: WorkerGeneration) {
        debug_assert!(self.active.is_none(), "two generations active at once");
        self.recovery = None;
        self.starting = None;
        self.last_ping_rtt = None;
        generation.mark(GenerationStatus::Ready);
        tracing::info!(
            generation = generation.id,
            pid = generation.worker.pid(),
            startup_ms = generation.spawned_at.elapsed().as_millis() as u64,
            "worker generation ready"
        );

        LivenessMonitor {
            generation: generation.id,
            worker: generation.worker.clone(),
            pulse: self.config.ping_pulse(),
            timeout: self.config.ping_timeout(),
            tx: self.tx.clone(),
            token: generation.token.clone(),
        }
        .spawn();

        self.active = Some(generation);
        self.dispatch_next();
    }

    /// Tears down the active generation if `signal` still applies to it.
    fn handle_fault(&mut self, signal: FaultSignal) {
        if self.active_id() != Some(signal.generation) {
            tracing::debug!(generation = signal.generation, kind = ?signal.kind, "ignoring fault for stale generation");
            return;
        }
        if let FaultKind::TaskDeadlineExceeded { task_id, .. } = &signal.kind {
            if self.in_flight.as_ref().map(|task| task.id) != Some(*task_id) {
                tracing::debug!(task_id, "ignoring deadline of a task that already resolved");
                return;
            }
        }
        let Some(mut generation) = self.active.take() else {
            return;
        };

        generation.mark(GenerationStatus::Dead);
        self.deadlines.disarm();
        self.last_ping_rtt = None;
        self.restarts = self.restarts.saturating_add(1);

        let failure = self.failure_for(signal);
        tracing::warn!(
            generation = generation.id,
            reason = failure.as_label(),
            uptime_ms = generation.spawned_at.elapsed().as_millis() as u64,
            error = %failure,
            "worker generation failed; replacing it"
        );
        if let Some(task) = self.in_flight.take() {
            task.resolve(Err(failure));
        }
        self.begin_recovery(Some(generation));
    }

    fn failure_for(&self, signal: FaultSignal) -> TaskFailure {
        let generation = signal.generation;
        match signal.kind {
            FaultKind::LivenessTimeout { timeout } => TaskFailure::LivenessTimeout {
                generation,
                timeout,
            },
            FaultKind::TaskDeadlineExceeded { task_id, elapsed } => {
                TaskFailure::TaskDeadlineExceeded {
                    task_id,
                    generation,
                    elapsed,
                    timeout: self.config.task_timeout(),
                }
            }
            FaultKind::AbnormalExit(exit) => TaskFailure::AbnormalExit { generation, exit },
            FaultKind::Transport(reason) => TaskFailure::TransportError { generation, reason },
        }
    }

    fn handle_task_completion(
        &mut self,
        task_id: TaskId,
        generation: GenerationId,
        response: ResponseBody,
    ) {
        let current = self
            .in_flight
            .as_ref()
            .is_some_and(|task| task.id == task_id && task.generation == generation);
        if !current {
            tracing::debug!(task_id, generation, "ignoring stale task completion");
            return;
        }

        let outcome = match response {
            ResponseBody::Success { payload } => Ok(payload),
            ResponseBody::Fault { message } => Err(TaskFailure::Extraction { message }),
            ResponseBody::Pong => {
                // A worker that answers a task with a heartbeat can't be trusted.
                self.handle_fault(FaultSignal {
                    generation,
                    kind: FaultKind::Transport(format!("task {task_id} was answered with a pong")),
                });
                return;
            }
        };
        let Some(task) = self.in_flight.take() else {
            return;
        };
        self.deadlines.disarm();
        let now = Instant::now();
        tracing::debug!(
            task_id,
            generation,
            latency_ms = now.duration_since(task.submitted_at).as_millis() as u64,
            slack_ms = task.deadline.saturating_duration_since(now).as_millis() as u64,
            ok = outcome.is_ok(),
            "task resolved"
        );
        task.resolve(outcome);

        if let Some(active) = self.active.as_mut() {
            active.mark(GenerationStatus::Ready);
        }
        self.dispatch_next();
    }

    /// Hands the oldest queued request to the active generation if it is idle.
    fn dispatch_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.status != GenerationStatus::Ready {
            return;
        }
        let Some(request) = self.router.next() else {
            return;
        };

        let task_id = self.router.assign_task_id();
        let generation = active.id;
        let started = Instant::now();
        let deadline = started + self.config.task_timeout();
        active.mark(GenerationStatus::Busy);
        self.deadlines.arm(ArmedDeadline {
            task_id,
            generation,
            started,
            deadline,
        });
        self.in_flight = Some(InFlightTask {
            id: task_id,
            generation,
            submitted_at: request.received_at,
            deadline,
            reply: request.reply,
        });
        tracing::debug!(
            task_id,
            generation,
            queued_ms = started.duration_since(request.received_at).as_millis() as u64,
            "dispatching task"
        );

        let worker = active.worker.clone();
        let token = active.token.clone();
        let tx = self.tx.clone();
        let payload = request.payload;
        tokio::spawn(async move {
            let reply = tokio::select! {
                _ = token.cancelled() => return,
                reply = worker.transport().request(RequestBody::Task { payload }, None) => reply,
            };
            let msg = match reply {
                Ok(response) => InternalMessage::TaskCompleted {
                    task_id,
                    generation,
                    response,
                },
                Err(error) => {
                    tracing::debug!(task_id, generation, %error, "task exchange failed");
                    InternalMessage::Fault(FaultSignal {
                        generation,
                        kind: classify_loss(&*worker).await,
                    })
                }
            };
            let _ = tx.send(msg);
        });
    }

    /// Terminates `dead` (if any) and brings up a replacement in the background.
    ///
    /// Termination of `dead` always runs to completion; [`stop`](Self::stop) waits
    /// for it instead of aborting the task.
    fn begin_recovery(&mut self, dead: Option<WorkerGeneration>) {
        let launcher = self.launcher.clone();
        let config = self.config.clone();
        let next_generation = self.next_generation.clone();
        let tx = self.tx.clone();
        let monitors = self.monitors.clone();
        let first_delay = config
            .restart
            .first_delay(dead.as_ref().map(|generation| generation.spawned_at.elapsed()));
        self.recovery = Some(tokio::spawn(async move {
            if let Some(generation) = dead {
                generation.worker.terminate(config.terminate_grace()).await;
                tracing::debug!(generation = generation.id, "failed generation terminated");
            }
            let msg = match bring_up(
                &*launcher,
                &config,
                first_delay,
                &next_generation,
                &tx,
                &monitors,
            )
            .await
            {
                Ok(generation) => InternalMessage::GenerationReady(generation),
                Err(error) => InternalMessage::RecoveryFailed(error),
            };
            let _ = tx.send(msg);
        }));
    }

    /// Fails everything still pending with `failure` and releases the active worker.
    async fn stop(
        &mut self,
        failure: TaskFailure,
        external_rx: &mut mpsc::UnboundedReceiver<SupervisorMessage>,
    ) {
        self.monitors.cancel();
        self.deadlines.disarm();

        if let Some(task) = self.in_flight.take() {
            task.resolve(Err(failure.clone()));
        }
        self.router.fail_all(&failure);
        external_rx.close();
        while let Ok(msg) = external_rx.try_recv() {
            if let SupervisorMessage::Submit(request) = msg {
                let _ = request.reply.send(Err(failure.clone()));
            }
        }

        // Cancelling `monitors` makes recovery give up any spawn in progress once
        // the failed generation is terminated.
        if let Some(recovery) = self.recovery.take() {
            if let Err(error) = recovery.await {
                tracing::warn!(%error, "recovery task failed");
            }
        }

        let grace = self.config.terminate_grace();
        let mut leftovers: Vec<Arc<dyn WorkerProcess>> = Vec::new();
        if let Some(mut generation) = self.active.take() {
            generation.mark(GenerationStatus::Dead);
            leftovers.push(generation.worker);
        }
        while let Ok(msg) = self.rx.try_recv() {
            if let InternalMessage::GenerationReady(generation) = msg {
                leftovers.push(generation.worker);
            }
        }
        for worker in leftovers {
            worker.terminate(grace).await;
        }
        tracing::info!(restarts = self.restarts, "supervisor stopped");
    }
}

/// Spawns generations until one completes its handshake or the restart budget runs out.
///
/// Every attempt consumes a fresh generation id, so ids stay unique even across
/// failed spawns.
async fn bring_up(
    launcher: &dyn WorkerLauncher,
    config: &WatchdogConfig,
    first_delay: Duration,
    next_generation: &AtomicU64,
    tx: &mpsc::UnboundedSender<InternalMessage>,
    monitors: &CancellationToken,
) -> Result<WorkerGeneration, SupervisorError> {
    let policy = &config.restart;
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        let delay = if attempt == 0 {
            first_delay
        } else {
            policy.delay_before(attempt)
        };
        if !delay.is_zero() {
            tokio::select! {
                _ = monitors.cancelled() => return Err(SupervisorError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if monitors.is_cancelled() {
            return Err(SupervisorError::Aborted);
        }
        let id = next_generation.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(InternalMessage::Spawning(id));
        tracing::info!(generation = id, attempt, "spawning worker");

        match start_generation(launcher, id, config, monitors).await {
            Ok(worker) => return Ok(WorkerGeneration::new(id, worker, monitors.child_token())),
            Err(_) if monitors.is_cancelled() => return Err(SupervisorError::Aborted),
            Err(error) => {
                tracing::warn!(generation = id, attempt, %error, "worker failed to start");
                last_error = Some(error);
            }
        }
    }

    Err(SupervisorError::RestartBudgetExhausted {
        attempts: policy.max_attempts,
        last_error: last_error
            .map(|error| error.to_string())
            .unwrap_or_default(),
    })
}

/// Launches generation `id` and waits for its handshake. Gives up early when
/// `monitors` is cancelled, terminating whatever was launched.
async fn start_generation(
    launcher: &dyn WorkerLauncher,
    id: GenerationId,
    config: &WatchdogConfig,
    monitors: &CancellationToken,
) -> Result<Arc<dyn WorkerProcess>, SpawnError> {
    let worker = tokio::select! {
        _ = monitors.cancelled() => return Err(SpawnError::Launch("supervisor stopped".into())),
        launched = launcher.launch(id) => launched?,
    };
    let outcome = tokio::select! {
        _ = monitors.cancelled() => Err(SpawnError::Handshake("supervisor stopped".into())),
        outcome = handshake(&*worker, config.max_startup()) => outcome,
    };
    match outcome {
        Ok(rtt) => {
            tracing::debug!(generation = id, rtt_ms = rtt.as_millis() as u64, "handshake complete");
            Ok(worker)
        }
        Err(error) => {
            worker.terminate(config.terminate_grace()).await;
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        messaging::TaskOutcome,
        worker::{ExtractFault, LocalLauncher, WorkerExit},
    };

    async fn echo(payload: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
        Ok(payload)
    }

    /// A supervisor with generation 1 active and task 7 in flight on it.
    async fn busy_supervisor() -> (Supervisor, oneshot::Receiver<TaskOutcome>) {
        let launcher = LocalLauncher::new(echo);
        let worker = launcher.launch(1).await.unwrap();
        let mut supervisor = Supervisor::new(WatchdogConfig::default(), Arc::new(launcher));
        supervisor.next_generation.store(2, Ordering::SeqCst);
        let generation = WorkerGeneration::new(1, worker, supervisor.monitors.child_token());
        supervisor.activate(generation);

        let (reply, rx) = oneshot::channel();
        let now = Instant::now();
        supervisor.in_flight = Some(InFlightTask {
            id: 7,
            generation: 1,
            submitted_at: now,
            deadline: now + Duration::from_secs(1),
            reply,
        });
        if let Some(active) = supervisor.active.as_mut() {
            active.mark(GenerationStatus::Busy);
        }
        (supervisor, rx)
    }

    fn fault(generation: GenerationId, kind: FaultKind) -> InternalMessage {
        InternalMessage::Fault(FaultSignal { generation, kind })
    }

    #[tokio::test]
    async fn test_only_first_fault_of_a_generation_counts() {
        let (mut supervisor, mut rx) = busy_supervisor().await;

        let signals = [
            fault(
                1,
                FaultKind::TaskDeadlineExceeded {
                    task_id: 7,
                    elapsed: Duration::from_millis(1_100),
                },
            ),
            fault(
                1,
                FaultKind::LivenessTimeout {
                    timeout: Duration::from_millis(100),
                },
            ),
            fault(1, FaultKind::AbnormalExit(WorkerExit::Killed)),
            fault(0, FaultKind::Transport("old pipe".into())),
        ];
        for signal in signals {
            assert!(supervisor.handle_internal_message(signal).is_continue());
        }

        assert_eq!(supervisor.restarts, 1);
        assert!(supervisor.active.is_none());
        assert!(supervisor.in_flight.is_none());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TaskFailure::TaskDeadlineExceeded {
                task_id: 7,
                generation: 1,
                ..
            })
        ));
        supervisor.monitors.cancel();
    }

    #[tokio::test]
    async fn test_deadline_of_resolved_task_is_ignored() {
        let (mut supervisor, mut rx) = busy_supervisor().await;

        let completed = InternalMessage::TaskCompleted {
            task_id: 7,
            generation: 1,
            response: ResponseBody::Success {
                payload: b"done".to_vec(),
            },
        };
        assert!(supervisor.handle_internal_message(completed).is_continue());
        assert_eq!(rx.try_recv().unwrap(), Ok(b"done".to_vec()));

        let late = fault(
            1,
            FaultKind::TaskDeadlineExceeded {
                task_id: 7,
                elapsed: Duration::from_secs(2),
            },
        );
        assert!(supervisor.handle_internal_message(late).is_continue());

        let stale = InternalMessage::TaskCompleted {
            task_id: 7,
            generation: 1,
            response: ResponseBody::Fault {
                message: "late".into(),
            },
        };
        assert!(supervisor.handle_internal_message(stale).is_continue());

        assert_eq!(supervisor.restarts, 0);
        assert_eq!(supervisor.active_id(), Some(1));
        assert_eq!(supervisor.status().state, GenerationStatus::Ready);
        supervisor.monitors.cancel();
    }
}
