//! Tunables consumed by the supervisor.
//!
//! Field names follow the external option surface (`ping_pulse_millis`, ...), so a
//! [`WatchdogConfig`] can be deserialized straight from a host's config file and then
//! adjusted through `WATCHDOG_*` environment variables.

use std::{collections::BTreeMap, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Immutable snapshot of the supervisor tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Run extraction in a separate OS process. When disabled, the worker runs
    /// in-process and only hangs and panics are contained.
    pub spawn_worker: bool,
    pub max_startup_millis: u64,
    pub ping_pulse_millis: u64,
    pub ping_timeout_millis: u64,
    pub task_pulse_millis: u64,
    pub task_timeout_millis: u64,
    /// How long each termination stage waits before escalating.
    pub terminate_grace_millis: u64,
    /// Requests that may wait for a worker before new ones are rejected.
    pub queue_capacity: usize,
    /// Expose [`SupervisorStatus`](crate::SupervisorStatus) through the handle.
    pub status: bool,
    pub restart: RestartPolicy,
    pub limits: ResourceLimits,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            spawn_worker: true,
            max_startup_millis: 120_000,
            ping_pulse_millis: 500,
            ping_timeout_millis: 30_000,
            task_pulse_millis: 500,
            task_timeout_millis: 120_000,
            terminate_grace_millis: 1_000,
            queue_capacity: 64,
            status: true,
            restart: RestartPolicy::default(),
            limits: ResourceLimits::default(),
        }
    }
}

impl WatchdogConfig {
    pub fn max_startup(&self) -> Duration {
        Duration::from_millis(self.max_startup_millis)
    }

    pub fn ping_pulse(&self) -> Duration {
        Duration::from_millis(self.ping_pulse_millis)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_millis)
    }

    pub fn task_pulse(&self) -> Duration {
        Duration::from_millis(self.task_pulse_millis)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_millis)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_millis)
    }

    /// Rejects values that would stall a loop or make the supervisor unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("max_startup_millis", self.max_startup_millis),
            ("ping_pulse_millis", self.ping_pulse_millis),
            ("ping_timeout_millis", self.ping_timeout_millis),
            ("task_pulse_millis", self.task_pulse_millis),
            ("task_timeout_millis", self.task_timeout_millis),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.restart.max_attempts == 0 {
            return Err(ConfigError::Zero("restart.max_attempts"));
        }
        Ok(())
    }

    /// Applies `WATCHDOG_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    /// Applies `WATCHDOG_*` overrides using `lookup` to resolve variables.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "WATCHDOG_SPAWN_WORKER", &mut self.spawn_worker)?;
        override_with(&lookup, "WATCHDOG_MAX_STARTUP_MILLIS", &mut self.max_startup_millis)?;
        override_with(&lookup, "WATCHDOG_PING_PULSE_MILLIS", &mut self.ping_pulse_millis)?;
        override_with(&lookup, "WATCHDOG_PING_TIMEOUT_MILLIS", &mut self.ping_timeout_millis)?;
        override_with(&lookup, "WATCHDOG_TASK_PULSE_MILLIS", &mut self.task_pulse_millis)?;
        override_with(&lookup, "WATCHDOG_TASK_TIMEOUT_MILLIS", &mut self.task_timeout_millis)?;
        override_with(&lookup, "WATCHDOG_QUEUE_CAPACITY", &mut self.queue_capacity)?;
        override_with(&lookup, "WATCHDOG_STATUS", &mut self.status)?;
        if let Some(raw) = lookup("WATCHDOG_MAX_MEMORY_MIB") {
            let mib = parse_var("WATCHDOG_MAX_MEMORY_MIB", &raw)?;
            self.limits.max_memory_mib = Some(mib);
        }
        Ok(self)
    }
}

fn override_with<F, T>(lookup: &F, var: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(var) {
        *slot = parse_var(var, &raw)?;
    }
    Ok(())
}

fn parse_var<T: FromStr>(var: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: raw.to_string(),
    })
}

/// How replacement workers are retried when they fail to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Consecutive failed spawns tolerated before giving up.
    pub max_attempts: u32,
    pub base_delay_millis: u64,
    pub max_backoff_exponent: u32,
    /// A generation that dies younger than this is replaced only after `base_delay`.
    pub min_uptime_millis: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_millis: 100,
            max_backoff_exponent: 5,
            min_uptime_millis: 1_000,
        }
    }
}

impl RestartPolicy {
    /// Delay before spawn attempt `attempt` (0-indexed) of one recovery.
    ///
    /// The first attempt is immediate; later ones wait
    /// `base_delay * 2^min(attempt - 1, max_backoff_exponent)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow((attempt - 1).min(self.max_backoff_exponent));
        Duration::from_millis(self.base_delay_millis).saturating_mul(factor)
    }

    /// Delay before the first spawn of a recovery, given how long the failed
    /// generation lived. A worker that keeps dying right after its handshake
    /// is respawned at most once per `base_delay`.
    pub fn first_delay(&self, uptime: Option<Duration>) -> Duration {
        match uptime {
            Some(uptime) if uptime < Duration::from_millis(self.min_uptime_millis) => {
                Duration::from_millis(self.base_delay_millis)
            }
            _ => Duration::ZERO,
        }
    }
}

/// Execution-environment limits passed through to every spawned worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Address-space ceiling for the worker, in MiB.
    pub max_memory_mib: Option<u64>,
    /// Extra arguments appended to the worker command line.
    pub startup_args: Vec<String>,
    /// Extra environment for the worker.
    pub env: BTreeMap<String, String>,
}
