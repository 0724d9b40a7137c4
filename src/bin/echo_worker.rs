//! Minimal worker binary: upper-cases its input.
//!
//! A few reserved payloads misbehave on purpose so hosts can exercise recovery:
//!
//! | payload | behavior                                        |
//! | ------- | ----------------------------------------------- |
//! | `hang`  | blocks forever, still answering heartbeats      |
//! | `bomb`  | allocates past the memory ceiling until it dies |
//! | `crash` | aborts the process                              |
//! | `fault` | reports an extraction fault                     |

use std::time::Duration;

use worker_watchdog::worker::{run_worker_main, ExtractFault, MAX_MEMORY_ENV};

const CHUNK: usize = 16 * 1024 * 1024;
const DEFAULT_CEILING_MIB: usize = 512;

async fn extract(payload: Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
    match payload.as_slice() {
        b"hang" => blocking(hang).await,
        b"bomb" => blocking(exhaust_memory).await,
        b"crash" => std::process::abort(),
        b"fault" => Err(ExtractFault::new("unsupported document")),
        _ => Ok(payload.to_ascii_uppercase()),
    }
}

async fn blocking(work: fn() -> Vec<u8>) -> Result<Vec<u8>, ExtractFault> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ExtractFault::new(e.to_string()))
}

fn hang() -> Vec<u8> {
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

/// Touches memory until the address-space limit makes an allocation fail, which
/// aborts the process. Without a limit it gives up at twice the advertised ceiling.
fn exhaust_memory() -> Vec<u8> {
    let ceiling_mib = std::env::var(MAX_MEMORY_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_CEILING_MIB);
    let chunks = ceiling_mib.saturating_mul(2 * 1024 * 1024) / CHUNK + 1;
    let mut hoard = Vec::with_capacity(chunks);
    for _ in 0..chunks {
        hoard.push(vec![0xA5u8; CHUNK]);
    }
    tracing::error!(held_mib = hoard.len() * CHUNK / (1024 * 1024), "memory ceiling never hit");
    std::process::abort()
}

fn main() {
    run_worker_main(extract)
}
