//! Basic single-run behavior: dependency ordering, completion signals,
//! build-time validation, and node-local failure handling.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use taskloom::{Executor, FlowError, Framework};

fn executor() -> Executor {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Executor::new(4).unwrap()
}

/// Shared event log for ordering assertions.
fn event_log() -> Arc<Mutex<Vec<&'static str>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Arc<Mutex<Vec<&'static str>>>, event: &'static str) {
    log.lock().unwrap().push(event);
}

#[test]
fn test_diamond_respects_edges() {
    let executor = executor();
    let fw = Framework::named("diamond");
    let log = event_log();

    let a = {
        let log = log.clone();
        fw.emplace(move || {
            record(&log, "A");
            Ok(())
        })
        .unwrap()
    };
    let b = {
        let log = log.clone();
        fw.emplace(move || {
            record(&log, "B");
            Ok(())
        })
        .unwrap()
    };
    let c = {
        let log = log.clone();
        fw.emplace(move || {
            record(&log, "C");
            Ok(())
        })
        .unwrap()
    };
    let d = {
        let log = log.clone();
        fw.emplace(move || {
            record(&log, "D");
            Ok(())
        })
        .unwrap()
    };
    a.precede(&b).unwrap();
    a.precede(&c).unwrap();
    b.precede(&d).unwrap();
    c.precede(&d).unwrap();

    executor.run(&fw).get().unwrap();

    let events = log.lock().unwrap().clone();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0], "A");
    assert_eq!(events[3], "D");
}

#[test]
fn test_single_run_dispatches_every_node_once() {
    let executor = executor();
    let fw = Framework::new();
    let count = Arc::new(AtomicUsize::new(0));

    let mut previous = None;
    for _ in 0..8 {
        let count = count.clone();
        let task = fw
            .emplace(move || {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        if let Some(prev) = &previous {
            task.succeed(prev).unwrap();
        }
        previous = Some(task);
    }

    executor.run(&fw).get().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 8);
}

#[test]
fn test_isolated_node_still_runs() {
    let executor = executor();
    let fw = Framework::new();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    fw.emplace(move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    fw.placeholder().unwrap();

    executor.run(&fw).get().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_empty_framework_completes() {
    let executor = executor();
    let fw = Framework::new();
    executor.run(&fw).get().unwrap();
    executor.wait_for_all().unwrap();
}

#[test]
fn test_callback_fires_exactly_once() {
    let executor = executor();
    let fw = Framework::new();
    fw.emplace(|| Ok(())).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    executor
        .run_with(&fw, move || {
            observed.fetch_add(1, Ordering::SeqCst);
        })
        .get()
        .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failure_is_node_local() {
    let executor = executor();
    let fw = Framework::new();
    let sibling_ran = Arc::new(AtomicBool::new(false));
    let successor_ran = Arc::new(AtomicBool::new(false));

    let failing = fw
        .emplace(|| Err(anyhow::anyhow!("disk on fire")))
        .unwrap();
    failing.set_name("burn");
    let flag = sibling_ran.clone();
    fw.emplace(move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    // Counters still decrement past a failed predecessor.
    let flag = successor_ran.clone();
    let successor = fw
        .emplace(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    failing.precede(&successor).unwrap();

    let err = executor.run(&fw).get().unwrap_err();
    match err {
        FlowError::TaskFailure { task, message } => {
            assert_eq!(task, "burn");
            assert!(message.contains("disk on fire"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(sibling_ran.load(Ordering::SeqCst));
    assert!(successor_ran.load(Ordering::SeqCst));
}

#[test]
fn test_panicking_task_is_captured() {
    let executor = executor();
    let fw = Framework::new();
    fw.emplace(|| panic!("widget exploded")).unwrap();

    let err = executor.run(&fw).get().unwrap_err();
    match err {
        FlowError::TaskFailure { message, .. } => assert!(message.contains("widget exploded")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_wait_for_all_surfaces_failures() {
    let executor = executor();
    let healthy = Framework::named("healthy");
    healthy.emplace(|| Ok(())).unwrap();
    let broken = Framework::named("broken");
    broken.emplace(|| Err(anyhow::anyhow!("nope"))).unwrap();

    let _h1 = executor.run(&healthy);
    let _h2 = executor.run(&broken);

    let err = executor.wait_for_all().unwrap_err();
    assert!(matches!(err, FlowError::TaskFailure { .. }));
    // The failure was consumed; a later wait sees a clean slate.
    executor.wait_for_all().unwrap();
}

#[test]
fn test_mutation_rejected_while_running() {
    let executor = executor();
    let fw = Framework::named("busy");
    fw.emplace(|| {
        std::thread::sleep(std::time::Duration::from_millis(50));
        Ok(())
    })
    .unwrap();

    let handle = executor.run(&fw);
    let err = fw.emplace(|| Ok(())).unwrap_err();
    assert!(matches!(err, FlowError::ConcurrentGraphMutation { .. }));

    handle.get().unwrap();
    // Builder calls work again once the run request has drained.
    fw.emplace(|| Ok(())).unwrap();
}
