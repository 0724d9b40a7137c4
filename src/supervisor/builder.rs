use std::{sync::Arc, time::Duration};

use crate::{
    config::WatchdogConfig,
    error::ConfigError,
    worker::{Extractor, LocalLauncher, ProcessLauncher, WorkerCommand, WorkerLauncher},
    Supervisor,
};

/// Builds a `Supervisor` instance with configurable parameters.
///
/// Starts from [`WatchdogConfig::default`]. The worker is either an OS process
/// ([`with_worker_command`](Self::with_worker_command)) or an in-process extractor
/// ([`with_local_extractor`](Self::with_local_extractor)), selected by
/// `spawn_worker`. A custom [`WorkerLauncher`] overrides both.
pub struct SupervisorBuilder {
    config: WatchdogConfig,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    command: Option<WorkerCommand>,
    extractor: Option<Arc<dyn Extractor>>,
}

impl SupervisorBuilder {
    /// Creates a new builder with default configuration values.
    pub fn new() -> Self {
        Self {
            config: WatchdogConfig::default(),
            launcher: None,
            command: None,
            extractor: None,
        }
    }

    /// Replaces every tunable at once.
    pub fn with_config(mut self, config: WatchdogConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a custom launcher regardless of `spawn_worker`.
    pub fn with_launcher(mut self, launcher: impl WorkerLauncher) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    /// Runs workers as child processes of `command`.
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.command = Some(command);
        self.config.spawn_worker = true;
        self
    }

    /// Runs workers in-process on top of `extractor`.
    pub fn with_local_extractor(mut self, extractor: impl Extractor) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self.config.spawn_worker = false;
        self
    }

    /// Sets the deadline of a single task, measured from dispatch.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout_millis = millis(timeout);
        self
    }

    /// Sets how often the task deadline is checked.
    pub fn with_task_pulse(mut self, pulse: Duration) -> Self {
        self.config.task_pulse_millis = millis(pulse);
        self
    }

    /// Sets the interval between heartbeats.
    pub fn with_ping_pulse(mut self, pulse: Duration) -> Self {
        self.config.ping_pulse_millis = millis(pulse);
        self
    }

    /// Sets how long a heartbeat may go unanswered.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout_millis = millis(timeout);
        self
    }

    /// Sets the bound on a new worker's startup handshake.
    pub fn with_max_startup(mut self, bound: Duration) -> Self {
        self.config.max_startup_millis = millis(bound);
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.config.terminate_grace_millis = millis(grace);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sets the number of consecutive failed spawns tolerated before giving up.
    pub fn with_max_spawn_attempts(mut self, attempts: u32) -> Self {
        self.config.restart.max_attempts = attempts;
        self
    }

    /// Sets the base delay for spawn retries, used in exponential backoff.
    pub fn with_base_restart_delay(mut self, delay: Duration) -> Self {
        self.config.restart.base_delay_millis = millis(delay);
        self
    }

    /// Generations that die younger than `uptime` are replaced only after the base delay.
    pub fn with_min_uptime(mut self, uptime: Duration) -> Self {
        self.config.restart.min_uptime_millis = millis(uptime);
        self
    }

    /// Caps each worker process's address space.
    pub fn with_max_memory_mib(mut self, mib: u64) -> Self {
        self.config.limits.max_memory_mib = Some(mib);
        self
    }

    /// Enables or disables [`SupervisorHandle::status`](crate::SupervisorHandle::status).
    pub fn with_status(mut self, enabled: bool) -> Self {
        self.config.status = enabled;
        self
    }

    /// Constructs the `Supervisor` with the configured settings.
    pub fn build(self) -> Result<Supervisor, ConfigError> {
        self.config.validate()?;
        let launcher: Arc<dyn WorkerLauncher> = match (self.launcher, self.config.spawn_worker) {
            (Some(launcher), _) => launcher,
            (None, true) => {
                let command = self.command.ok_or(ConfigError::MissingWorkerCommand)?;
                Arc::new(ProcessLauncher::new(command, self.config.limits.clone()))
            }
            (None, false) => {
                let extractor = self.extractor.ok_or(ConfigError::MissingExtractor)?;
                Arc::new(LocalLauncher::from_arc(extractor))
            }
        };
        Ok(Supervisor::new(self.config, launcher))
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
