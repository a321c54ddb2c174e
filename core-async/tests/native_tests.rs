//! Integration tests for the runtime facade.
//!
//! These cover the primitives the cache engine leans on: spawned workers,
//! cancellation tokens, watch/broadcast fan-out and timeouts.

use core_async::{sync, task, time};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[core_async::test]
async fn test_task_spawn() {
    let handle = task::spawn(async { 42 });
    let result = handle.await.unwrap();
    assert_eq!(result, 42);
}

#[core_async::test]
async fn test_task_spawn_blocking() {
    let handle = task::spawn_blocking(|| {
        std::thread::sleep(std::time::Duration::from_millis(10));
        100
    });
    assert_eq!(handle.await.unwrap(), 100);
}

#[core_async::test]
async fn test_timeout_success() {
    let result = time::timeout(time::Duration::from_millis(200), async {
        time::sleep(time::Duration::from_millis(10)).await;
        42
    })
    .await;

    assert_eq!(result.unwrap(), 42);
}

#[core_async::test]
async fn test_timeout_failure() {
    let result = time::timeout(time::Duration::from_millis(10), async {
        time::sleep(time::Duration::from_millis(200)).await;
        42
    })
    .await;

    assert!(result.is_err());
}

#[core_async::test]
async fn test_cancellation_token_stops_worker() {
    let token = sync::CancellationToken::new();
    let ticks = Arc::new(AtomicUsize::new(0));

    let worker_token = token.clone();
    let worker_ticks = Arc::clone(&ticks);
    let handle = task::spawn(async move {
        loop {
            tokio_select(&worker_token, &worker_ticks).await;
            if worker_token.is_cancelled() {
                break;
            }
        }
    });

    time::sleep(time::Duration::from_millis(30)).await;
    token.cancel();
    handle.await.unwrap();

    let seen = ticks.load(Ordering::SeqCst);
    time::sleep(time::Duration::from_millis(20)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), seen);
}

async fn tokio_select(token: &sync::CancellationToken, ticks: &AtomicUsize) {
    let cancelled = token.cancelled();
    let tick = time::sleep(time::Duration::from_millis(5));
    futures::pin_mut!(cancelled, tick);
    if let futures::future::Either::Right(_) = futures::future::select(cancelled, tick).await {
        ticks.fetch_add(1, Ordering::SeqCst);
    }
}

#[core_async::test]
async fn test_watch_channel_latest_value() {
    let (tx, mut rx) = sync::watch::channel(None::<f64>);

    task::spawn(async move {
        for step in 1..=4 {
            time::sleep(time::Duration::from_millis(5)).await;
            tx.send(Some(step as f64 / 4.0)).unwrap();
        }
    });

    let mut last = None;
    while rx.changed().await.is_ok() {
        last = *rx.borrow();
        if last == Some(1.0) {
            break;
        }
    }

    assert_eq!(last, Some(1.0));
}

#[core_async::test]
async fn test_broadcast_channel_fan_out() {
    let (tx, mut rx1) = sync::broadcast::channel(10);
    let mut rx2 = tx.subscribe();

    task::spawn(async move {
        for i in 0..3 {
            tx.send(i).unwrap();
        }
    });

    let mut values1 = vec![];
    let mut values2 = vec![];
    for _ in 0..3 {
        values1.push(rx1.recv().await.unwrap());
        values2.push(rx2.recv().await.unwrap());
    }

    assert_eq!(values1, vec![0, 1, 2]);
    assert_eq!(values2, vec![0, 1, 2]);
}

#[core_async::test]
async fn test_unbounded_mpsc_preserves_order() {
    let (tx, mut rx) = sync::mpsc::unbounded_channel();

    for i in 0..5 {
        tx.send(i).unwrap();
    }
    drop(tx);

    let mut received = vec![];
    while let Some(value) = rx.recv().await {
        received.push(value);
    }

    assert_eq!(received, vec![0, 1, 2, 3, 4]);
}

#[core_async::test]
async fn test_concurrent_task_execution() {
    let counter = Arc::new(sync::Mutex::new(0));
    let mut handles = vec![];

    for _ in 0..10 {
        let counter_clone = counter.clone();
        handles.push(task::spawn(async move {
            let mut guard = counter_clone.lock().await;
            *guard += 1;
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*counter.lock().await, 10);
}
