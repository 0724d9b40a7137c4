mod common;

use std::sync::atomic::Ordering;

use tokio::time::{advance, pause, Instant};

use worker_watchdog::{GenerationStatus, TaskFailure};

use common::{
    fast_builder, local_supervisor, ms, wait_for_generation, wait_for_heartbeat, ScriptedExtractor,
    WedgingLauncher,
};

#[tokio::test]
async fn test_wedged_worker_is_replaced() {
    pause();
    // Answers the handshake and nothing else.
    let launcher = WedgingLauncher::first_generation(1, ScriptedExtractor::default());
    let launches = launcher.launches.clone();
    let handle = fast_builder().with_launcher(launcher).build().unwrap().run();
    wait_for_generation(&handle, 1).await;

    let started = Instant::now();
    let failure = handle.submit("doc").await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(
        failure,
        TaskFailure::LivenessTimeout {
            generation: 1,
            timeout: ms(100),
        }
    );
    // One ping pulse plus the ping timeout.
    assert!(elapsed >= ms(100), "replaced early: {elapsed:?}");
    assert!(elapsed <= ms(160), "replaced late: {elapsed:?}");

    wait_for_generation(&handle, 2).await;
    assert_eq!(handle.submit("next").await.unwrap(), b"NEXT".to_vec());
    assert_eq!(launches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_idle_wedged_worker_is_replaced() {
    pause();
    let launcher = WedgingLauncher::first_generation(3, ScriptedExtractor::default());
    let handle = fast_builder().with_launcher(launcher).build().unwrap().run();
    wait_for_generation(&handle, 1).await;

    advance(ms(400)).await;
    let status = wait_for_generation(&handle, 2).await;
    assert_eq!(status.restarts, 1);
}

#[tokio::test]
async fn test_healthy_worker_is_left_alone() {
    pause();
    let handle = local_supervisor(ScriptedExtractor::default());
    wait_for_generation(&handle, 1).await;

    tokio::time::sleep(ms(2_000)).await;
    let status = wait_for_heartbeat(&handle).await;
    assert_eq!(status.generation, Some(1));
    assert_eq!(status.restarts, 0);
    assert!(status.last_ping_rtt.is_some());
}

#[tokio::test]
async fn test_heartbeat_continues_during_long_task() {
    pause();
    let handle = local_supervisor(ScriptedExtractor::default());
    wait_for_generation(&handle, 1).await;

    let hung = handle.submit("hang");
    tokio::time::sleep(ms(300)).await;

    // Several pulses passed; only the deadline may end this task.
    let status = handle.status().await.unwrap();
    assert_eq!(status.generation, Some(1));
    assert_eq!(status.state, GenerationStatus::Busy);
    assert!(status.in_flight.is_some());
    assert_eq!(status.restarts, 0);

    assert!(matches!(
        hung.await,
        Err(TaskFailure::TaskDeadlineExceeded { generation: 1, .. })
    ));
}
