//! Integration tests for the bulkhead
//!
//! Covers admission order, rejection and exact slot accounting under
//! concurrent submissions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keelson_policy::{Bulkhead, BulkheadConfig, ResilienceError, ResilienceResult};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
#[error("gate dropped")]
struct GateDropped;

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn submit(
    bulkhead: &Bulkhead,
    id: usize,
    started: &Arc<Mutex<Vec<usize>>>,
    gate: oneshot::Receiver<()>,
) -> JoinHandle<ResilienceResult<usize, GateDropped>> {
    let bulkhead = bulkhead.clone();
    let started = Arc::clone(started);
    tokio::spawn(async move {
        bulkhead
            .execute(|_| async move {
                started.lock().push(id);
                gate.await.map_err(|_| GateDropped)?;
                Ok(id)
            })
            .await
    })
}

/// Validates admission with two slots and two queue entries.
///
/// # Test Steps
/// 1. Submit five blocking calls in order
/// 2. Verify two run, two queue and the fifth is rejected with (2, 2)
/// 3. Release running calls one at a time
/// 4. Verify queued calls start in submission order and slot counts stay exact
#[tokio::test]
async fn test_admission_queue_and_rejection() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let bulkhead = Bulkhead::new(BulkheadConfig { capacity: 2, queue_capacity: 2 })?;
    let started = Arc::new(Mutex::new(Vec::new()));

    let mut gates = Vec::new();
    let mut tasks = Vec::new();
    for id in 0..5 {
        let (release, gate) = oneshot::channel();
        gates.push(release);
        tasks.push(submit(&bulkhead, id, &started, gate));
        settle().await;
    }

    assert_eq!(*started.lock(), vec![0, 1]);
    assert_eq!(bulkhead.execution_slots(), 0);
    assert_eq!(bulkhead.queue_slots(), 0);

    let rejected = tasks.pop().ok_or_else(|| anyhow::anyhow!("missing task"))?.await?;
    assert!(matches!(
        rejected,
        Err(ResilienceError::BulkheadRejected { capacity: 2, queue_capacity: 2 })
    ));

    let mut gates = gates.into_iter();
    let mut release = |count: usize| {
        for gate in gates.by_ref().take(count) {
            let _ = gate.send(());
        }
    };

    release(1);
    settle().await;
    assert_eq!(*started.lock(), vec![0, 1, 2]);
    assert_eq!(bulkhead.execution_slots(), 0);
    assert_eq!(bulkhead.queue_slots(), 1);

    release(1);
    settle().await;
    assert_eq!(*started.lock(), vec![0, 1, 2, 3]);
    assert_eq!(bulkhead.queue_slots(), 2);

    release(2);
    for (id, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await?.ok(), Some(id));
    }
    assert_eq!(bulkhead.execution_slots(), 2);
    assert_eq!(bulkhead.queue_slots(), 2);
    Ok(())
}

/// Validates the concurrency cap under a burst of work.
///
/// # Test Steps
/// 1. Submit forty timed calls against three slots and a deep queue
/// 2. Track the peak number of calls running at once
/// 3. Verify the peak never exceeds three and every call completes
#[tokio::test(start_paused = true)]
async fn test_burst_never_exceeds_capacity() -> anyhow::Result<()> {
    let bulkhead = Bulkhead::new(BulkheadConfig { capacity: 3, queue_capacity: 64 })?;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));
    let _handle = {
        let successes = Arc::clone(&successes);
        bulkhead.on_success(move |_| {
            successes.fetch_add(1, Ordering::SeqCst);
        })
    };

    let tasks: Vec<_> = (0..40)
        .map(|id| {
            let bulkhead = bulkhead.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                bulkhead
                    .execute(|_| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, GateDropped>(id)
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await?.is_ok());
    }
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(successes.load(Ordering::SeqCst), 40);
    assert_eq!(bulkhead.execution_slots(), 3);
    Ok(())
}
