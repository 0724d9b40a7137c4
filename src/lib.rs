//! # worker-watchdog
//!
//! `worker-watchdog` keeps risky extraction work away from your service.
//! Untrusted documents are parsed in a disposable worker process; the supervisor
//! heartbeats it, bounds every task with a deadline, and replaces the worker the
//! moment it crashes, hangs or runs out of memory. Callers only ever see a result
//! or a typed failure.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use worker_watchdog::{SupervisorBuilder, WorkerCommand};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = SupervisorBuilder::new()
//!         .with_worker_command(WorkerCommand::new("/usr/libexec/extract-worker"))
//!         .with_task_timeout(Duration::from_secs(30))
//!         .with_max_memory_mib(1024)
//!         .build()?
//!         .run();
//!
//!     match handle.submit(std::fs::read("report.pdf")?).await {
//!         Ok(text) => println!("{}", String::from_utf8_lossy(&text)),
//!         Err(failure) if failure.is_retryable() => eprintln!("worker replaced: {failure}"),
//!         Err(failure) => eprintln!("extraction failed: {failure}"),
//!     }
//!
//!     handle.shutdown()?;
//!     handle.wait().await?;
//!     Ok(())
//! }
//! ```
//!
//! The worker side is a binary that hands its [`Extractor`] to
//! [`run_worker_main`](worker::run_worker_main):
//!
//! ```rust,no_run
//! use worker_watchdog::worker::{run_worker_main, ExtractFault};
//!
//! async fn extract(payload: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
//!     Ok(payload)
//! }
//!
//! fn main() {
//!     run_worker_main(extract)
//! }
//! ```
//!
//! ## What you get
//!
//! * **Crash isolation**: segfaults, aborts and OOM kills stay in the worker.
//! * **Two detectors**: a heartbeat for wedged workers, a per-task deadline for
//!   runaway parses. Both end in the same recovery.
//! * **Ordered queueing**: requests wait in a bounded FIFO while a task runs or a
//!   replacement starts, and are released in arrival order.
//! * **No silent retries**: the task that was running during a fault fails once with a
//!   retryable error; resubmitting is up to the caller.
//!
//! ## API overview
//!
//! | SupervisorHandle method | Purpose                                                    |
//! | ----------------------- | ---------------------------------------------------------- |
//! | `submit(payload).await` | Run one extraction, returns `Result<Vec<u8>, TaskFailure>` |
//! | `status().await`        | Active generation, its state, restarts, queue depth        |
//! | `shutdown()`            | Fail pending work, terminate the worker and stop           |
//! | `wait().await`          | Wait until the supervisor stops                            |

pub use config::{ResourceLimits, RestartPolicy, WatchdogConfig};
pub use error::{ConfigError, SpawnError, SupervisorError, TaskFailure, TransportError};
pub use messaging::TaskOutcome;
pub use supervisor::{
    builder::SupervisorBuilder,
    generation::GenerationStatus,
    handle::{SupervisorHandle, SupervisorHandleError, TaskTicket},
    Supervisor, SupervisorStatus,
};
pub use worker::{
    ExtractFault, Extractor, LocalLauncher, ProcessLauncher, WorkerCommand, WorkerExit,
    WorkerLauncher, WorkerProcess,
};

pub mod config;
pub mod error;
pub mod logging;
pub mod transport;
pub mod worker;

mod messaging;
mod monitor;
mod supervisor;

/// Identifies one spawned worker. Increases with every spawn attempt.
pub type GenerationId = u64;

/// Identifies one dispatched task.
pub type TaskId = u64;
