//! End-to-end tests for the download service.
//!
//! Every test runs the real worker pool against a scripted in-memory
//! transport and real files in a temporary directory.

mod common;

use common::*;
use fetchq_core::{
    FailureReason, FetchError, JobFilter, JobId, JobOptions, JobStatus, PauseReason,
    TerminalFilter,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_chunk_transfer_completes() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let data = body(1024);
    transport.serve("http://test/app.apk", Source::new(data.clone(), 512));

    let service = service(test_settings(1), transport).await;
    let dest = dir.path().join("app.apk");
    let id = service
        .submit("http://test/app.apk", &dest, JobOptions::default())
        .unwrap();

    let job = finish(&service, id).await;
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(job.bytes_downloaded, 1024);
    assert_eq!(job.total_bytes, Some(1024));
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(file_len(&dest.with_extension("apk.part")).is_none());

    service.shutdown().await;
}

#[tokio::test]
async fn empty_source_is_rejected_without_a_job() {
    let transport = ScriptedTransport::new();
    let service = service(test_settings(1), transport).await;

    let result = service.submit("", "/tmp/never.bin", JobOptions::default());
    assert!(matches!(result, Err(FetchError::InvalidRequest(_))));
    assert!(service.list_jobs(&JobFilter::all()).is_empty());

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn success_subscriber_sees_each_job_once() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    for name in ["a", "b", "c"] {
        transport.serve(&format!("http://test/{}", name), Source::new(body(2048), 256));
    }
    let service = service(test_settings(2), transport).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    service.subscribe(TerminalFilter::Status(JobStatus::Successful), move |job| {
        recorder.lock().push(job.id);
    });

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let id = service
            .submit(&format!("http://test/{}", name), dir.path().join(name), JobOptions::default())
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        assert_eq!(finish(&service, *id).await.status, JobStatus::Successful);
    }

    // Delivery happens on the dispatcher thread
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while seen.lock().len() < 3 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, ids);

    service.shutdown().await;
}

// ============================================================================
// Cancellation and pause
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_running_job_stops_writes() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve(
        "http://test/big.bin",
        Source::new(body(64 * 200), 64).slow(Duration::from_millis(10)),
    );
    let service = service(test_settings(1), transport).await;

    let dest = dir.path().join("big.bin");
    let id = service
        .submit("http://test/big.bin", &dest, JobOptions::default())
        .unwrap();
    wait_until(&service, id, |job| job.bytes_downloaded >= 128).await;

    service.cancel(id).unwrap();
    let job = tokio::time::timeout(Duration::from_millis(500), service.wait(id))
        .await
        .expect("cancellation was not observed within a chunk interval")
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason, Some(FailureReason::Cancelled));

    let part = dest.with_extension("bin.part");
    let written = file_len(&part).unwrap();
    assert_eq!(written, job.bytes_downloaded);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(file_len(&part), Some(written));
    assert!(file_len(&dest).is_none());

    // Cancelling again is a no-op
    service.cancel(id).unwrap();
    assert_eq!(service.get_status(id).unwrap().failure_reason, Some(FailureReason::Cancelled));

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_job_cancelled_before_it_runs() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve(
        "http://test/first",
        Source::new(body(1024), 64).slow(Duration::from_millis(10)),
    );
    transport.serve("http://test/second", Source::new(body(1024), 64));
    let service = service(test_settings(1), transport.clone()).await;

    let first = service
        .submit("http://test/first", dir.path().join("first"), JobOptions::default())
        .unwrap();
    let second = service
        .submit("http://test/second", dir.path().join("second"), JobOptions::default())
        .unwrap();

    service.cancel(second).unwrap();
    let job = service.get_status(second).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.was_cancelled());

    assert_eq!(finish(&service, first).await.status, JobStatus::Successful);
    assert!(transport.opens_of("http://test/second").is_empty());

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_job_resumes_from_its_offset() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let data = body(64 * 100);
    transport.serve(
        "http://test/video.mp4",
        Source::new(data.clone(), 64).slow(Duration::from_millis(5)),
    );
    let service = service(test_settings(1), transport.clone()).await;

    let dest = dir.path().join("video.mp4");
    let id = service
        .submit("http://test/video.mp4", &dest, JobOptions::default())
        .unwrap();
    wait_until(&service, id, |job| job.bytes_downloaded >= 256).await;

    service.pause(id).unwrap();
    let paused = wait_until(&service, id, |job| job.status == JobStatus::Paused).await;
    assert_eq!(paused.pause_reason, Some(PauseReason::PausedByUser));
    assert!(paused.bytes_downloaded > 0);

    service.resume(id).unwrap();
    let job = finish(&service, id).await;
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(std::fs::read(&dest).unwrap(), data);

    let opens = transport.opens_of("http://test/video.mp4");
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0], 0);
    assert_eq!(opens[1], paused.bytes_downloaded);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_resume_does_not_override_a_later_pause() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let data = body(64 * 200);
    transport.serve(
        "http://test/movie.mkv",
        Source::new(data.clone(), 64).slow(Duration::from_millis(5)),
    );
    let service = service(test_settings(1), transport.clone()).await;

    let dest = dir.path().join("movie.mkv");
    let id = service
        .submit("http://test/movie.mkv", &dest, JobOptions::default())
        .unwrap();
    wait_until(&service, id, |job| job.bytes_downloaded >= 256).await;

    service.pause(id).unwrap();
    wait_until(&service, id, |job| job.status == JobStatus::Paused).await;
    service.resume(id).unwrap();
    service.resume(id).unwrap();
    let running = wait_until(&service, id, |job| job.status == JobStatus::Running).await;
    wait_until(&service, id, |job| job.bytes_downloaded > running.bytes_downloaded).await;

    service.pause(id).unwrap();
    let paused = wait_until(&service, id, |job| job.status == JobStatus::Paused).await;
    assert_eq!(paused.pause_reason, Some(PauseReason::PausedByUser));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let still = service.get_status(id).unwrap();
    assert_eq!(still.status, JobStatus::Paused);
    assert_eq!(still.bytes_downloaded, paused.bytes_downloaded);
    assert_eq!(transport.opens_of("http://test/movie.mkv").len(), 2);

    service.resume(id).unwrap();
    assert_eq!(finish(&service, id).await.status, JobStatus::Successful);
    assert_eq!(std::fs::read(&dest).unwrap(), data);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resuming_a_queued_job_runs_it_once() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve(
        "http://test/first",
        Source::new(body(1024), 64).slow(Duration::from_millis(5)),
    );
    transport.serve("http://test/second", Source::new(body(1024), 256));
    let service = service(test_settings(1), transport.clone()).await;

    let first = service
        .submit("http://test/first", dir.path().join("first"), JobOptions::default())
        .unwrap();
    let second = service
        .submit("http://test/second", dir.path().join("second"), JobOptions::default())
        .unwrap();

    service.resume(second).unwrap();
    service.resume(second).unwrap();
    assert_eq!(service.get_status(second).unwrap().status, JobStatus::Pending);

    assert_eq!(finish(&service, first).await.status, JobStatus::Successful);
    assert_eq!(finish(&service, second).await.status, JobStatus::Successful);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.opens_of("http://test/second"), vec![0]);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_timeout_gives_up_on_a_paused_job() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve(
        "http://test/held",
        Source::new(body(64 * 100), 64).slow(Duration::from_millis(5)),
    );
    let service = service(test_settings(1), transport).await;

    let id = service
        .submit("http://test/held", dir.path().join("held"), JobOptions::default())
        .unwrap();
    wait_until(&service, id, |job| job.bytes_downloaded >= 128).await;
    service.pause(id).unwrap();
    wait_until(&service, id, |job| job.status == JobStatus::Paused).await;

    let waited = service.wait_timeout(id, Duration::from_millis(100)).await.unwrap();
    assert!(waited.is_none());

    service.resume(id).unwrap();
    let done = service.wait_timeout(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(done.map(|job| job.status), Some(JobStatus::Successful));

    service.shutdown().await;
}

// ============================================================================
// Retries
// ============================================================================

/// Settings whose first retry waits `delay_ms`
fn slow_retries(delay_ms: u64) -> fetchq_core::Settings {
    let mut settings = test_settings(1);
    settings.retry_limit = 5;
    settings.retry_base_delay_ms = delay_ms;
    settings.retry_max_delay_ms = delay_ms;
    settings
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_below_the_limit_still_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve("http://test/flaky", Source::new(body(1024), 128).failing(2));
    let service = service(test_settings(1), transport.clone()).await;

    let id = service
        .submit("http://test/flaky", dir.path().join("flaky"), JobOptions::default())
        .unwrap();

    let job = finish(&service, id).await;
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(job.retry_count, 2);
    assert_eq!(transport.opens_of("http://test/flaky").len(), 3);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reaching_the_retry_limit_fails_with_a_reason() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve("http://test/down", Source::new(body(1024), 128).failing(3));
    let service = service(test_settings(1), transport.clone()).await;

    let id = service
        .submit("http://test/down", dir.path().join("down"), JobOptions::default())
        .unwrap();

    let job = finish(&service, id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(
        job.failure_reason,
        Some(FailureReason::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(transport.opens_of("http://test/down").len(), 3);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncated_stream_is_retried_from_the_offset() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let data = body(4096);
    transport.serve("http://test/short", Source::new(data.clone(), 256).short_reads(1));
    let service = service(test_settings(1), transport.clone()).await;

    let dest = dir.path().join("short");
    let id = service
        .submit("http://test/short", &dest, JobOptions::default())
        .unwrap();

    let job = finish(&service, id).await;
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert_eq!(transport.opens_of("http://test/short"), vec![0, 2048]);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_error_mid_transfer_is_retried_from_the_offset() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let data = body(4096);
    transport.serve("http://test/reset", Source::new(data.clone(), 256).broken_streams(1));
    let service = service(test_settings(1), transport.clone()).await;

    let dest = dir.path().join("reset");
    let id = service
        .submit("http://test/reset", &dest, JobOptions::default())
        .unwrap();

    let job = finish(&service, id).await;
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(job.retry_count, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert_eq!(transport.opens_of("http://test/reset"), vec![0, 2048]);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_backoff_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve("http://test/flaky", Source::new(body(1024), 128).failing(4));
    let service = service(slow_retries(5_000), transport.clone()).await;

    let id = service
        .submit("http://test/flaky", dir.path().join("flaky"), JobOptions::default())
        .unwrap();
    wait_until(&service, id, |job| {
        job.pause_reason == Some(PauseReason::WaitingToRetry)
    })
    .await;

    service.cancel(id).unwrap();
    let job = service
        .wait_timeout(id, Duration::from_millis(500))
        .await
        .unwrap()
        .expect("cancellation was not observed during backoff");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason, Some(FailureReason::Cancelled));
    assert_eq!(transport.opens_of("http://test/flaky").len(), 1);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_during_backoff_holds_the_retry() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve("http://test/flaky", Source::new(body(1024), 128).failing(1));
    let service = service(slow_retries(300), transport.clone()).await;

    let id = service
        .submit("http://test/flaky", dir.path().join("flaky"), JobOptions::default())
        .unwrap();
    wait_until(&service, id, |job| {
        job.pause_reason == Some(PauseReason::WaitingToRetry)
    })
    .await;

    service.pause(id).unwrap();
    wait_until(&service, id, |job| {
        job.pause_reason == Some(PauseReason::PausedByUser)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let job = service.get_status(id).unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert_eq!(transport.opens_of("http://test/flaky").len(), 1);

    service.resume(id).unwrap();
    assert_eq!(finish(&service, id).await.status, JobStatus::Successful);
    assert_eq!(transport.opens_of("http://test/flaky").len(), 2);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_backoff_marks_the_job_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve("http://test/flaky", Source::new(body(1024), 128).failing(4));
    let service = service(slow_retries(5_000), transport).await;

    let id = service
        .submit("http://test/flaky", dir.path().join("flaky"), JobOptions::default())
        .unwrap();
    wait_until(&service, id, |job| {
        job.pause_reason == Some(PauseReason::WaitingToRetry)
    })
    .await;

    tokio::time::timeout(Duration::from_secs(1), service.shutdown())
        .await
        .expect("shutdown waited out the backoff");

    let job = service.get_status(id).unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert_eq!(job.pause_reason, Some(PauseReason::Interrupted));
    assert_eq!(service.resume_interrupted(), vec![id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permanent_failures_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let service = service(test_settings(1), transport.clone()).await;

    let id = service
        .submit("http://test/missing", dir.path().join("missing"), JobOptions::default())
        .unwrap();

    let job = finish(&service, id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(job.failure_reason, Some(FailureReason::UnsupportedSource(_))));
    assert_eq!(transport.opens_of("http://test/missing").len(), 1);

    service.shutdown().await;
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_submitters_get_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let service = Arc::new(service(test_settings(2), transport).await);

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let service = service.clone();
            let root = dir.path().to_path_buf();
            std::thread::spawn(move || {
                (0..50)
                    .map(|i| {
                        service
                            .submit(
                                &format!("http://test/{}/{}", t, i),
                                root.join(format!("{}-{}", t, i)),
                                JobOptions::default(),
                            )
                            .unwrap()
                    })
                    .collect::<Vec<JobId>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for thread in threads {
        for id in thread.join().unwrap() {
            assert!(ids.insert(id), "id {} issued twice", id);
        }
    }
    assert_eq!(ids.len(), 400);
    assert_eq!(service.list_jobs(&JobFilter::all()).len(), 400);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribed_observer_is_not_called() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.serve("http://test/one", Source::new(body(512), 512));
    let service = service(test_settings(1), transport).await;

    let calls = Arc::new(Mutex::new(0usize));
    let counter = calls.clone();
    let subscription = service.subscribe(TerminalFilter::AnyTerminal, move |_| {
        *counter.lock() += 1;
    });
    assert!(service.unsubscribe(subscription));

    let id = service
        .submit("http://test/one", dir.path().join("one"), JobOptions::default())
        .unwrap();
    finish(&service, id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*calls.lock(), 0);

    service.shutdown().await;
}

// ============================================================================
// Ledger
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_jobs_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let mut settings = test_settings(2);
    settings.data_dir = Some(data_dir.clone());

    let data = body(64 * 200);
    let slow = ScriptedTransport::new();
    slow.serve(
        "http://test/slow",
        Source::new(data.clone(), 64).slow(Duration::from_millis(10)),
    );
    slow.serve("http://test/quick", Source::new(body(512), 512));

    let (slow_id, quick_id, offset) = {
        let service = service(settings.clone(), slow).await;
        let slow_id = service
            .submit("http://test/slow", dir.path().join("slow"), JobOptions::default())
            .unwrap();
        let quick_id = service
            .submit("http://test/quick", dir.path().join("quick"), JobOptions::default())
            .unwrap();
        finish(&service, quick_id).await;
        wait_until(&service, slow_id, |job| job.bytes_downloaded >= 256).await;

        service.shutdown().await;
        let job = service.get_status(slow_id).unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.pause_reason, Some(PauseReason::Interrupted));
        (slow_id, quick_id, job.bytes_downloaded)
    };

    let fast = ScriptedTransport::new();
    fast.serve("http://test/slow", Source::new(data.clone(), 1024));
    let service = service(settings, fast.clone()).await;

    let restored = service.get_status(slow_id).unwrap();
    assert_eq!(restored.status, JobStatus::Paused);
    assert_eq!(restored.pause_reason, Some(PauseReason::Interrupted));
    assert_eq!(restored.bytes_downloaded, offset);
    assert_eq!(service.get_status(quick_id).unwrap().status, JobStatus::Successful);

    let next = service
        .submit("http://test/other", dir.path().join("other"), JobOptions::default())
        .unwrap();
    assert!(next > slow_id && next > quick_id);

    assert_eq!(service.resume_interrupted(), vec![slow_id]);
    let job = finish(&service, slow_id).await;
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(std::fs::read(dir.path().join("slow")).unwrap(), data);
    assert_eq!(fast.opens_of("http://test/slow"), vec![offset]);

    let purged = service.purge(slow_id, true).await.unwrap();
    assert_eq!(purged.id, slow_id);
    assert!(file_len(&dir.path().join("slow")).is_none());
    assert!(matches!(service.get_status(slow_id), Err(FetchError::NotFound(_))));

    service.shutdown().await;
}
