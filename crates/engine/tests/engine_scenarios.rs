//! End-to-end scenarios for the transform engine
//!
//! Run with: cargo test -p rowflow-engine --test engine_scenarios

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::bounded;
use parking_lot::Mutex;

use rowflow_engine::emitter;
use rowflow_engine::prelude::*;

fn quiet() -> Arc<dyn ProgressSink> {
    Arc::new(NoopProgressSink)
}

fn config(workers: usize, queue: usize) -> EngineConfig {
    EngineConfig::new()
        .with_max_parallel_workers(workers)
        .with_max_queue_size(queue)
        .with_cancel_poll_interval(Duration::from_millis(10))
}

/// Scheduler with its drain and cancellation token, for driving submission by hand
fn scheduler<V, F>(
    config: EngineConfig,
    total: Option<usize>,
    f: F,
) -> (BoundedScheduler<u32, V>, Drain<V>, CancellationToken)
where
    V: Send + 'static,
    F: Fn(&TaskContext, u32) -> anyhow::Result<V> + Send + Sync + 'static,
{
    let token = CancellationToken::new();
    let monitor = Arc::new(ProgressMonitor::new(total, token.clone(), quiet()));
    let (emitter, drain) = emitter::channel();
    let scheduler = BoundedScheduler::new(config, compute_fn(f), emitter, monitor).unwrap();
    (scheduler, drain, token)
}

// =========================================================================
// Scenarios
// =========================================================================

#[test_log::test]
fn test_identity_over_ten_records() {
    let engine = TransformEngine::new(config(2, 4), |_: &TaskContext, n: u32| Ok(n))
        .unwrap()
        .with_progress_sink(quiet());

    let mut run = engine.run(0..10u32, Some(10)).unwrap();
    let results: Vec<TaskResult<u32>> = run.results().collect();

    assert_eq!(results.len(), 10);
    let indices: HashSet<usize> = results.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..10).collect::<HashSet<_>>());
    for result in &results {
        assert_eq!(result.value().copied(), Some(result.index as u32));
    }

    let summary = run.join().unwrap();
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.succeeded, 10);
}

#[test_log::test]
fn test_slow_record_times_out() {
    let engine = TransformEngine::new(
        config(1, 1).with_per_task_timeout(Duration::from_millis(100)),
        |_: &TaskContext, n: u32| {
            thread::sleep(Duration::from_millis(500));
            Ok(n)
        },
    )
    .unwrap()
    .with_progress_sink(quiet());

    let started = Instant::now();
    let mut run = engine.run(vec![7u32], Some(1)).unwrap();
    let results: Vec<TaskResult<u32>> = run.results().collect();

    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].index, 0);
    assert!(matches!(
        results[0].failure_reason(),
        Some(TaskFailure::Timeout { .. })
    ));

    let summary = run.join().unwrap();
    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.workers.abandoned, 1);
    assert_eq!(summary.state, RunState::Completed);
}

#[test_log::test]
fn test_cancel_after_three_submissions() {
    let (mut scheduler, drain, token) = scheduler(config(2, 10), Some(10), |_, n| Ok(n));

    for index in 0..3 {
        scheduler.submit(Record::new(index, index as u32)).unwrap();
    }
    token.cancel();

    let started = Instant::now();
    let err = scheduler.submit(Record::new(3, 3)).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.index(), 3);
    assert!(started.elapsed() < Duration::from_millis(100));

    let monitor = scheduler.monitor();
    scheduler.close();
    scheduler.shutdown();

    let indices: HashSet<usize> = drain.map(|r| r.index).collect();
    assert_eq!(indices, (0..3).collect::<HashSet<_>>());
    assert_eq!(monitor.state(), RunState::Cancelled);
}

#[test_log::test]
fn test_cancel_unblocks_waiting_submitter() {
    let (release_tx, release_rx) = bounded::<()>(0);
    let (scheduler, drain, token) = scheduler(config(1, 1), None, move |_, n| {
        let _ = release_rx.recv_timeout(Duration::from_secs(5));
        Ok(n)
    });

    scheduler.submit(Record::new(0, 0)).unwrap();

    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        })
    };

    // Blocks on the full queue until cancellation is observed
    let err = scheduler.submit(Record::new(1, 1)).unwrap_err();
    assert!(err.is_cancelled());
    canceller.join().unwrap();

    drop(release_tx);
    scheduler.shutdown();
    assert_eq!(drain.count(), 1);
}

#[test_log::test]
fn test_one_failing_record() {
    let engine = TransformEngine::new(config(3, 6), |_: &TaskContext, n: u32| {
        if n == 5 {
            anyhow::bail!("record {} is malformed", n);
        }
        Ok(n * 10)
    })
    .unwrap()
    .with_progress_sink(quiet());

    let mut run = engine.run(0..10u32, Some(10)).unwrap();
    let results: Vec<TaskResult<u32>> = run.results().collect();

    assert_eq!(results.len(), 10);
    let failed: Vec<&TaskResult<u32>> = results.iter().filter(|r| !r.is_success()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].index, 5);
    match failed[0].failure_reason() {
        Some(TaskFailure::Compute { message }) => assert!(message.contains("malformed")),
        other => panic!("expected compute failure, got {:?}", other),
    }

    let summary = run.join().unwrap();
    assert_eq!(summary.succeeded, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.state, RunState::Completed);
}

// =========================================================================
// Bounds
// =========================================================================

#[test]
fn test_parallelism_never_exceeds_worker_cap() {
    let running = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));

    let engine = {
        let running = Arc::clone(&running);
        let high_water = Arc::clone(&high_water);
        TransformEngine::new(config(3, 8), move |_: &TaskContext, n: u32| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(n)
        })
        .unwrap()
        .with_progress_sink(quiet())
    };

    let mut run = engine.run(0..40u32, Some(40)).unwrap();
    assert_eq!(run.results().count(), 40);
    let summary = run.join().unwrap();

    assert!(high_water.load(Ordering::SeqCst) <= 3);
    assert!(summary.workers.spawned <= 3);
}

#[test]
fn test_submissions_block_at_queue_bound() {
    let (release_tx, release_rx) = bounded::<()>(0);
    let (scheduler, drain, _token) = scheduler(config(2, 4), None, move |_, n| {
        let _ = release_rx.recv();
        Ok(n)
    });
    let scheduler = Arc::new(scheduler);
    let accepted = Arc::new(AtomicUsize::new(0));

    let feeder = {
        let scheduler = Arc::clone(&scheduler);
        let accepted = Arc::clone(&accepted);
        thread::spawn(move || {
            for index in 0..10usize {
                if scheduler.submit(Record::new(index, index as u32)).is_err() {
                    return;
                }
                accepted.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    thread::sleep(Duration::from_millis(150));
    assert_eq!(accepted.load(Ordering::SeqCst), 4);
    assert_eq!(scheduler.in_flight(), 4);
    assert_eq!(scheduler.active(), 2);

    // A disconnected channel releases every computation at once
    drop(release_tx);
    feeder.join().unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 10);

    // Dropping the last handle closes the input; the drain ends once dispatchers exit
    drop(scheduler);
    assert_eq!(drain.count(), 10);
}

// =========================================================================
// Delivery
// =========================================================================

#[test]
fn test_every_index_delivered_exactly_once() {
    let engine = TransformEngine::new(
        config(4, 4).with_per_task_timeout(Duration::from_millis(50)),
        |_: &TaskContext, n: u32| {
            match n % 7 {
                0 => thread::sleep(Duration::from_millis(200)),
                3 => anyhow::bail!("bad record"),
                _ => {}
            }
            Ok(n)
        },
    )
    .unwrap()
    .with_progress_sink(quiet());

    let mut run = engine.run(0..50u32, Some(50)).unwrap();
    let mut seen = HashSet::new();
    for result in run.results() {
        assert!(seen.insert(result.index), "duplicate index {}", result.index);
    }
    assert_eq!(seen.len(), 50);

    let summary = run.join().unwrap();
    assert_eq!(summary.submitted, 50);
    assert_eq!(summary.succeeded + summary.failed + summary.timed_out, 50);
    assert_eq!(summary.timed_out, 8);
    assert_eq!(summary.failed, 7);
}

#[test]
fn test_ordered_results_follow_input() {
    let engine = TransformEngine::new(config(4, 8), |_: &TaskContext, n: u64| {
        // Earlier records take longer, so completion order is reversed-ish
        thread::sleep(Duration::from_millis(20u64.saturating_sub(n)));
        Ok(n + 1)
    })
    .unwrap()
    .with_progress_sink(quiet());

    let mut run = engine.run(0..20u64, Some(20)).unwrap();
    let indices: Vec<usize> = run.ordered().map(|r| r.index).collect();
    assert_eq!(indices, (0..20).collect::<Vec<_>>());
    run.join().unwrap();
}

#[test]
fn test_progress_reaches_one() {
    let reports = Arc::new(Mutex::new(Vec::<f64>::new()));
    let sink = {
        let reports = Arc::clone(&reports);
        move |fraction: f64, _message: &str| reports.lock().push(fraction)
    };

    let engine = TransformEngine::new(config(2, 2), |_: &TaskContext, n: u32| Ok(n))
        .unwrap()
        .with_progress_sink(Arc::new(sink));

    let mut run = engine.run(0..8u32, Some(8)).unwrap();
    assert_eq!(run.results().count(), 8);
    run.join().unwrap();

    let reports = reports.lock();
    assert_eq!(reports.len(), 8);
    assert!(reports.iter().all(|f| (0.0..=1.0).contains(f)));
    // Sinks are called from several dispatchers, so reports may interleave
    let highest = reports.iter().copied().fold(0.0, f64::max);
    assert_eq!(highest, 1.0);
}

#[test]
fn test_panicking_progress_sink_keeps_dispatching() {
    let sink = |_: f64, _: &str| {
        panic!("progress sink failed");
    };
    let engine = TransformEngine::new(config(1, 4), |_: &TaskContext, n: u32| Ok(n))
        .unwrap()
        .with_progress_sink(Arc::new(sink));

    let mut run = engine.run(0..10u32, Some(10)).unwrap();
    let indices: HashSet<usize> = run.results().map(|r| r.index).collect();
    assert_eq!(indices, (0..10).collect::<HashSet<_>>());

    let summary = run.join().unwrap();
    assert_eq!(summary.submitted, 10);
    assert_eq!(summary.succeeded, 10);
    assert_eq!(summary.state, RunState::Completed);
}

#[test]
fn test_second_run_after_cancelled_run() {
    let engine = TransformEngine::new(config(1, 1), |_: &TaskContext, n: u32| {
        thread::sleep(Duration::from_millis(5));
        Ok(n)
    })
    .unwrap()
    .with_progress_sink(quiet());

    let first = engine.run(0..1000u32, Some(1000)).unwrap();
    first.cancel();
    assert_eq!(first.join().unwrap().state, RunState::Cancelled);

    let mut second = engine.run(0..5u32, Some(5)).unwrap();
    assert_eq!(second.results().count(), 5);
    let summary = second.join().unwrap();
    assert_eq!(summary.submitted, 5);
    assert_eq!(summary.state, RunState::Completed);
}

#[test]
fn test_external_cancellation_stops_feeding() {
    let token = CancellationToken::new();
    let engine = TransformEngine::new(config(1, 1), |_: &TaskContext, n: u32| {
        thread::sleep(Duration::from_millis(10));
        Ok(n)
    })
    .unwrap()
    .with_cancellation(token.clone())
    .with_progress_sink(quiet());

    let mut run = engine.run(0..1000u32, Some(1000)).unwrap();
    let mut drained = 0;
    for _ in run.results() {
        drained += 1;
        if drained == 3 {
            token.cancel();
        }
    }

    let summary = run.join().unwrap();
    assert_eq!(summary.state, RunState::Cancelled);
    assert!(summary.submitted < 1000);
    assert_eq!(drained, summary.submitted);
}
