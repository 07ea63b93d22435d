//! Integration tests for operators that fork fibers.

use sluice::prelude::*;
use sluice::runtime::{fork, sleep};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Finalizers of interrupted fibers run on detached tasks; give them a few
/// scheduler turns.
async fn eventually(flag: &AtomicBool) -> bool {
    for _ in 0..100 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::task::yield_now().await;
    }
    flag.load(Ordering::SeqCst)
}

#[tokio::test]
async fn test_merge_with_left_stops_at_left_completion() {
    let left: Stream<i32> = Stream::from_iter([1, 2]);
    let right = Stream::from_iter([10, 20, 30]).concat(Stream::never());
    let out = left.merge_with(right, HaltStrategy::Left).run_collect().await.unwrap();
    assert!(out.contains(&1) && out.contains(&2));
    assert!(out.iter().all(|n| [1, 2, 10, 20, 30].contains(n)));
}

#[tokio::test(start_paused = true)]
async fn test_zip_all_failure_interrupts_pending_side() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let stalled = Stream::<i32, String>::never().ensuring(async move { flag.store(true, Ordering::SeqCst) });
    let out = Stream::<i32, String>::fail("left broke".to_string())
        .zip_all(stalled, 0, 0)
        .run_collect()
        .await;
    assert_eq!(out, Err(Cause::fail("left broke".to_string())));
    assert!(eventually(&released).await);
}

#[tokio::test(start_paused = true)]
async fn test_zip_all_with_failure_on_right() {
    let out = Stream::<i32, &str>::succeed(1)
        .concat(Stream::never())
        .zip_all_with(
            Stream::<i32, &str>::succeed(2).concat(Stream::fail("right broke")),
            |a| a,
            |b| b,
            |a, b| a * 10 + b,
        )
        .run_collect()
        .await;
    assert_eq!(out, Err(Cause::fail("right broke")));
}

#[tokio::test(start_paused = true)]
async fn test_zip_all_drains_other_side_after_one_ends() {
    // The left side ends while the right side is still producing.
    let right = Stream::<i32>::from_iter_with_chunk_size([10, 20], 1).concat(Stream::never());
    let out = Stream::<i32>::from_iter([1])
        .zip_all(right, 0, 0)
        .take(2)
        .run_collect()
        .await;
    assert_eq!(out, Ok(vec![(1, 10), (0, 20)]));
}

#[tokio::test(start_paused = true)]
async fn test_zip_all_sorted_failure_while_other_side_pending() {
    let left: Stream<(u32, i32), &str> = Stream::from_iter([(1, 1)]).concat(Stream::fail("left broke"));
    let right: Stream<(u32, i32), &str> = Stream::from_iter([(2, 2)]).concat(Stream::never());
    let out = left
        .zip_all_sorted_by_key_with(right, |a| a, |b| b, |a, b| a + b)
        .run_collect()
        .await;
    assert_eq!(out, Err(Cause::fail("left broke")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flat_map_concurrent_on_multi_thread_runtime() {
    let out = Stream::<i64>::range(1, 50)
        .flat_map(|n| Stream::range(1, n), FlatMapOptions::concurrent(8))
        .run_fold(0i64, |acc, n| acc + n)
        .await;
    let expected: i64 = (1..=50).map(|n: i64| n * (n + 1) / 2).sum();
    assert_eq!(out, Ok(expected));
}

#[tokio::test]
async fn test_broadcast_copies_can_be_zipped() {
    let mut copies = Stream::<i64>::range_with_chunk_size(1, 20, 3)
        .broadcast_with_config(2, &StreamConfig::new().with_broadcast_lag(4))
        .into_iter();
    let (Some(left), Some(right)) = (copies.next(), copies.next()) else {
        panic!("expected two copies");
    };
    let out = left.zip(right.map(|n| n * 100)).run_collect().await.unwrap();
    assert_eq!(out.len(), 20);
    assert!(out.iter().all(|(a, b)| *b == a * 100));
}

#[tokio::test(start_paused = true)]
async fn test_map_future_par_keeps_order_and_bounds_concurrency() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (running_in, peak_in) = (running.clone(), peak.clone());
    let out = Stream::<u64>::from_iter([50, 10, 40, 20, 30])
        .map_future_par(2, move |delay| {
            let running = running_in.clone();
            let peak = peak_in.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(delay)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(delay)
            }
        })
        .run_collect()
        .await;
    assert_eq!(out, Ok(vec![50, 10, 40, 20, 30]));
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_dropping_a_running_stream_interrupts_producers() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let stream = Stream::<u32>::repeat_value(1)
        .ensuring(async move { flag.store(true, Ordering::SeqCst) })
        .buffer(8, OverflowStrategy::Suspend)
        .merge(Stream::never());
    let mut pull = stream.into_pull();
    assert!(pull.pull().await.is_ok());
    assert_eq!(pull.close().await, Ok(()));
    assert!(eventually(&released).await);
}

#[tokio::test]
async fn test_interrupting_the_running_fiber() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let fiber = fork(
        Stream::<u32>::never()
            .ensuring(async move { flag.store(true, Ordering::SeqCst) })
            .run_drain(),
    );
    tokio::task::yield_now().await;
    fiber.interrupt().await;
    assert!(eventually(&released).await);
}

#[tokio::test]
async fn test_partition_and_interleave() {
    let (evens, odds) = Stream::<i64>::range(1, 10).partition(|n| n % 2 == 0);
    let out = evens.interleave(odds).run_collect().await;
    assert_eq!(out, Ok(vec![2, 1, 4, 3, 6, 5, 8, 7, 10, 9]));
}

#[tokio::test]
async fn test_merge_all_bounded_concurrency() {
    let streams: Vec<Stream<i64>> = (0..10).map(|i| Stream::range(i * 10, i * 10 + 9)).collect();
    let mut out = Stream::merge_all(streams, 3).run_collect().await.unwrap();
    out.sort();
    assert_eq!(out, (0..100).collect::<Vec<_>>());
}
