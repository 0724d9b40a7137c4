use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use worker_watchdog::transport::protocol::{frame_codec, Request, RequestBody, Response, ResponseBody};
use worker_watchdog::transport::Transport;
use worker_watchdog::{
    ExtractFault, Extractor, GenerationId, LocalLauncher, SpawnError, SupervisorBuilder,
    SupervisorHandle, SupervisorStatus, WorkerExit, WorkerLauncher, WorkerProcess,
};

#[allow(unused)]
pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

// Short timings so paused-clock tests stay readable:
// ping every 50ms with a 100ms budget, deadline 500ms checked every 20ms.
#[allow(unused)]
pub fn fast_builder() -> SupervisorBuilder {
    SupervisorBuilder::new()
        .with_max_startup(ms(1000))
        .with_ping_pulse(ms(50))
        .with_ping_timeout(ms(100))
        .with_task_pulse(ms(20))
        .with_task_timeout(ms(500))
        .with_terminate_grace(ms(50))
        .with_queue_capacity(16)
        .with_max_spawn_attempts(3)
        .with_base_restart_delay(ms(10))
}

#[allow(unused)]
pub fn local_supervisor(extractor: ScriptedExtractor) -> SupervisorHandle {
    fast_builder()
        .with_local_extractor(extractor)
        .build()
        .unwrap()
        .run()
}

/// Polls until `generation` is the active one.
#[allow(unused)]
pub async fn wait_for_generation(handle: &SupervisorHandle, generation: GenerationId) -> SupervisorStatus {
    for _ in 0..500 {
        let status = handle.status().await.unwrap();
        if status.generation == Some(generation) && status.state.is_active() {
            return status;
        }
        tokio::time::sleep(ms(5)).await;
    }
    panic!("generation {generation} never became active");
}

/// Polls until the active generation has answered a heartbeat.
#[allow(unused)]
pub async fn wait_for_heartbeat(handle: &SupervisorHandle) -> SupervisorStatus {
    for _ in 0..500 {
        let status = handle.status().await.unwrap();
        if status.last_ping_rtt.is_some() {
            return status;
        }
        tokio::time::sleep(ms(5)).await;
    }
    panic!("no heartbeat was ever answered");
}

/// Upper-cases its input and records every payload it sees.
///
/// `hang` never returns, `panic` panics, `fault` reports an extraction fault.
#[derive(Clone, Default)]
pub struct ScriptedExtractor {
    pub seen: Arc<Mutex<Vec<String>>>,
}

#[allow(unused)]
impl ScriptedExtractor {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, payload: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
        let text = String::from_utf8_lossy(&payload).to_string();
        self.seen.lock().unwrap().push(text.clone());
        match text.as_str() {
            "hang" => std::future::pending().await,
            "panic" => panic!("extractor blew up"),
            "fault" => Err(ExtractFault::new("encrypted document")),
            _ => Ok(text.to_uppercase().into_bytes()),
        }
    }
}

/// Holds back every generation after the first until the gate opens.
#[allow(unused)]
pub struct GatedLauncher {
    inner: LocalLauncher,
    gate: watch::Receiver<bool>,
}

#[allow(unused)]
impl GatedLauncher {
    pub fn new(extractor: ScriptedExtractor) -> (Self, watch::Sender<bool>) {
        let (open, gate) = watch::channel(false);
        let launcher = Self {
            inner: LocalLauncher::new(extractor),
            gate,
        };
        (launcher, open)
    }
}

#[async_trait]
impl WorkerLauncher for GatedLauncher {
    async fn launch(&self, generation: GenerationId) -> Result<Arc<dyn WorkerProcess>, SpawnError> {
        if generation > 1 {
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
        self.inner.launch(generation).await
    }
}

/// Launches workers that answer a fixed number of heartbeats and then go silent
/// without exiting. Generations after `wedged_generations` are healthy.
#[allow(unused)]
pub struct WedgingLauncher {
    pub healthy_pings: usize,
    pub wedged_generations: GenerationId,
    pub launches: Arc<AtomicUsize>,
    fallback: LocalLauncher,
}

#[allow(unused)]
impl WedgingLauncher {
    /// Only generation 1 wedges, after answering `healthy_pings` probes (the
    /// handshake counts as one).
    pub fn first_generation(healthy_pings: usize, extractor: ScriptedExtractor) -> Self {
        Self {
            healthy_pings,
            wedged_generations: 1,
            launches: Arc::new(AtomicUsize::new(0)),
            fallback: LocalLauncher::new(extractor),
        }
    }

    /// Every worker is mute from the start, so no handshake ever completes.
    pub fn always() -> Self {
        Self {
            healthy_pings: 0,
            wedged_generations: GenerationId::MAX,
            launches: Arc::new(AtomicUsize::new(0)),
            fallback: LocalLauncher::new(ScriptedExtractor::default()),
        }
    }
}

#[async_trait]
impl WorkerLauncher for WedgingLauncher {
    async fn launch(&self, generation: GenerationId) -> Result<Arc<dyn WorkerProcess>, SpawnError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if generation > self.wedged_generations {
            return self.fallback.launch(generation).await;
        }
        Ok(Arc::new(WedgedWorker::start(self.healthy_pings)))
    }
}

#[allow(unused)]
struct WedgedWorker {
    transport: Transport,
    stopped: CancellationToken,
}

impl WedgedWorker {
    fn start(healthy_pings: usize) -> Self {
        let (ours, theirs) = duplex(64 * 1024);
        let (read, write) = split(ours);
        let (their_read, their_write) = split(theirs);
        let stopped = CancellationToken::new();
        tokio::spawn(answer_pings(their_read, their_write, healthy_pings, stopped.clone()));
        Self {
            transport: Transport::new(read, write),
            stopped,
        }
    }
}

#[allow(unused)]
async fn answer_pings(
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    mut budget: usize,
    stopped: CancellationToken,
) {
    let mut frames = FramedRead::new(reader, frame_codec());
    let mut sink = FramedWrite::new(writer, frame_codec());
    loop {
        let frame = tokio::select! {
            _ = stopped.cancelled() => return,
            frame = frames.next() => frame,
        };
        let Some(Ok(frame)) = frame else {
            return;
        };
        let Ok(request) = Request::decode(&frame) else {
            return;
        };
        if request.body == RequestBody::Ping && budget > 0 {
            budget -= 1;
            let reply = Response {
                id: request.id,
                body: ResponseBody::Pong,
            };
            if sink.send(Bytes::from(reply.encode().unwrap())).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl WorkerProcess for WedgedWorker {
    fn transport(&self) -> &Transport {
        &self.transport
    }

    fn exit_status(&self) -> Option<WorkerExit> {
        self.stopped.is_cancelled().then_some(WorkerExit::Killed)
    }

    async fn exited(&self) -> WorkerExit {
        self.stopped.cancelled().await;
        WorkerExit::Killed
    }

    async fn terminate(&self, _grace: Duration) {
        self.stopped.cancel();
        self.transport.close();
    }
}

/// Local workers that sit on every termination request for `delay` before
/// honouring it. Keeps every worker it launched.
#[allow(unused)]
pub struct SlowTerminateLauncher {
    inner: LocalLauncher,
    delay: Duration,
    pub launched: Arc<Mutex<Vec<Arc<dyn WorkerProcess>>>>,
}

#[allow(unused)]
impl SlowTerminateLauncher {
    pub fn new(extractor: ScriptedExtractor, delay: Duration) -> Self {
        Self {
            inner: LocalLauncher::new(extractor),
            delay,
            launched: Arc::default(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for SlowTerminateLauncher {
    async fn launch(&self, generation: GenerationId) -> Result<Arc<dyn WorkerProcess>, SpawnError> {
        let worker: Arc<dyn WorkerProcess> = Arc::new(SlowTerminateWorker {
            inner: self.inner.launch(generation).await?,
            delay: self.delay,
        });
        self.launched.lock().unwrap().push(worker.clone());
        Ok(worker)
    }
}

struct SlowTerminateWorker {
    inner: Arc<dyn WorkerProcess>,
    delay: Duration,
}

#[async_trait]
impl WorkerProcess for SlowTerminateWorker {
    fn transport(&self) -> &Transport {
        self.inner.transport()
    }

    fn exit_status(&self) -> Option<WorkerExit> {
        self.inner.exit_status()
    }

    async fn exited(&self) -> WorkerExit {
        self.inner.exited().await
    }

    async fn terminate(&self, grace: Duration) {
        tokio::time::sleep(self.delay).await;
        self.inner.terminate(grace).await;
    }
}
