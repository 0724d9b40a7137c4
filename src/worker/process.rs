//! Workers as OS child processes.
//!
//! The child speaks the protocol on stdin/stdout and inherits stderr for its logs.
//! The memory ceiling is applied as `RLIMIT_AS` between fork and exec, so an
//! allocation bomb kills the child and nothing else.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::process::Command;

use super::{ExitWatch, WorkerExit, WorkerLauncher, WorkerProcess};
use crate::{
    config::ResourceLimits, error::SpawnError, transport::protocol::RequestBody,
    transport::Transport, GenerationId,
};

/// Environment variable carrying the memory ceiling (MiB) into the worker.
pub const MAX_MEMORY_ENV: &str = "WATCHDOG_MAX_MEMORY_MIB";
/// Environment variable carrying the generation id into the worker.
pub const GENERATION_ENV: &str = "WATCHDOG_GENERATION";

/// Program and arguments that start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Launches each generation as a child process.
pub struct ProcessLauncher {
    command: WorkerCommand,
    limits: ResourceLimits,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand, limits: ResourceLimits) -> Self {
        Self { command, limits }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, generation: GenerationId) -> Result<Arc<dyn WorkerProcess>, SpawnError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .args(&self.limits.startup_args)
            .envs(&self.limits.env)
            .env(GENERATION_ENV, generation.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(mib) = self.limits.max_memory_mib {
            cmd.env(MAX_MEMORY_ENV, mib.to_string());
            let bytes = mib.saturating_mul(1024 * 1024);
            // Safety: setrlimit is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(move || {
                    use nix::sys::resource::{setrlimit, Resource};
                    setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(std::io::Error::from)
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::Launch(format!("{}: {e}", self.command.program.display())))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Launch("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Launch("child stdout not captured".into()))?;
        let pid = child.id();

        tracing::debug!(generation, pid, "spawned worker process");

        let exit = ExitWatch::spawn(async move {
            match child.wait().await {
                Ok(status) => WorkerExit::from(status),
                Err(error) => {
                    tracing::warn!(%error, "failed to wait for worker process");
                    WorkerExit::Unknown
                }
            }
        });

        Ok(Arc::new(ProcessWorker {
            pid,
            transport: Transport::new(stdout, stdin),
            exit,
        }))
    }
}

struct ProcessWorker {
    pid: Option<u32>,
    transport: Transport,
    exit: ExitWatch,
}

impl ProcessWorker {
    fn signal(&self, signal: Signal) {
        // Once reaped the pid may belong to someone else.
        if self.exit.status().is_some() {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };
        if let Err(error) = kill(Pid::from_raw(pid as i32), signal) {
            tracing::debug!(pid, %error, ?signal, "failed to signal worker");
        }
    }

    async fn exited_within(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.exit.wait()).await.is_ok()
    }
}

#[async_trait]
impl WorkerProcess for ProcessWorker {
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
            let asked = tokio::time::timeout(grace, self.transport.notify(RequestBody::Exit)).await;
            if !matches!(asked, Ok(Ok(()))) || !self.exited_within(grace).await {
                tracing::debug!(pid = self.pid, "worker ignored exit request, sending SIGTERM");
                self.signal(Signal::SIGTERM);
                if !self.exited_within(grace).await {
                    tracing::warn!(pid = self.pid, "worker ignored SIGTERM, killing");
                    self.signal(Signal::SIGKILL);
                    let _ = self.exited_within(grace).await;
                }
            }
        }
        self.transport.close();
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
