//! Integration tests for backpressure and overflow strategies.
//!
//! These tests verify that:
//! - A suspending buffer bounds how far the producer runs ahead
//! - Dropping and sliding buffers never block the producer
//! - Push emitters wait while their channel is full
//! - Queues account for every offered item

use sluice::prelude::*;
use sluice::runtime::sleep;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn counted(counter: &Arc<AtomicU64>) -> Stream<u64> {
    let counter = counter.clone();
    Stream::iterate(0, |n| n + 1)
        .rechunk(1)
        .tap(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
}

#[tokio::test(start_paused = true)]
async fn test_suspend_buffer_bounds_elements_in_flight() {
    let produced = Arc::new(AtomicU64::new(0));
    let mut pull = counted(&produced).buffer(4, OverflowStrategy::Suspend).into_pull();
    let mut consumed = 0u64;
    for _ in 0..10 {
        consumed += pull.pull().await.unwrap().len() as u64;
        sleep(Duration::from_millis(10)).await;
        let in_flight = produced.load(Ordering::SeqCst) - consumed;
        // Four queued plus one in the producer's hand.
        assert!(in_flight <= 5, "{in_flight} elements in flight");
    }
    assert_eq!(pull.close().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_buffer_keeps_producer_running() {
    let produced = Arc::new(AtomicU64::new(0));
    let mut pull = counted(&produced).take(1_000).buffer(2, OverflowStrategy::Dropping).into_pull();
    sleep(Duration::from_millis(50)).await;
    // The producer ran to completion without anyone pulling.
    assert_eq!(produced.load(Ordering::SeqCst), 1_000);
    let mut delivered = Vec::new();
    while let Ok(chunk) = pull.pull().await {
        delivered.extend(chunk);
    }
    assert!(delivered.len() <= 3);
    assert_eq!(delivered.first(), Some(&0));
}

#[tokio::test(start_paused = true)]
async fn test_sliding_buffer_keeps_latest() {
    let mut pull = Stream::<i64>::range_with_chunk_size(1, 100, 1)
        .buffer(3, OverflowStrategy::Sliding)
        .into_pull();
    sleep(Duration::from_millis(50)).await;
    let mut delivered = Vec::new();
    while let Ok(chunk) = pull.pull().await {
        delivered.extend(chunk);
    }
    assert!(delivered.len() <= 100);
    assert_eq!(delivered.last(), Some(&100));
    assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test(start_paused = true)]
async fn test_push_emitter_waits_for_room() {
    let sent = Arc::new(AtomicU64::new(0));
    let counter = sent.clone();
    let stream = Stream::<u64>::async_push(
        move |emitter| {
            tokio::spawn(async move {
                for n in 0..100 {
                    if emitter.single(n).await.is_err() {
                        return;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        },
        2,
    );
    let mut pull = stream.into_pull();
    assert_eq!(pull.pull().await.map(Chunk::into_vec), Ok(vec![0]));
    sleep(Duration::from_millis(50)).await;
    // One pulled, two in the channel and one send in progress at most.
    assert!(sent.load(Ordering::SeqCst) <= 4);
    assert_eq!(pull.close().await, Ok(()));
}

#[tokio::test]
async fn test_queue_stats_account_for_drops() {
    let queue = Queue::dropping(2);
    for n in 0..5 {
        queue.offer(n).await.unwrap();
    }
    let stats = queue.stats();
    assert_eq!(stats.len, 2);
    assert_eq!(stats.offered + stats.dropped, 5);
    assert_eq!(queue.take_all(), Ok(vec![0, 1]));

    let sliding = Queue::sliding(2);
    assert_eq!(sliding.offer_all(0..5).await, Ok(5));
    assert_eq!(sliding.take_all(), Ok(vec![3, 4]));
}

#[tokio::test(start_paused = true)]
async fn test_merge_queue_size_follows_config() {
    let config = StreamConfig::new().with_buffer_size(1);
    let produced = Arc::new(AtomicU64::new(0));
    let mut pull = counted(&produced)
        .merge_with_config(Stream::never(), HaltStrategy::Left, &config)
        .into_pull();
    assert!(pull.pull().await.is_ok());
    sleep(Duration::from_millis(50)).await;
    // One pulled, one queued and one waiting to be offered.
    let tight = produced.load(Ordering::SeqCst);
    assert!(tight <= 4, "{tight} elements produced");
    assert_eq!(pull.close().await, Ok(()));

    let produced = Arc::new(AtomicU64::new(0));
    let mut pull = counted(&produced).merge(Stream::never()).into_pull();
    assert!(pull.pull().await.is_ok());
    sleep(Duration::from_millis(50)).await;
    let roomy = produced.load(Ordering::SeqCst);
    assert!(roomy >= 16, "{roomy} elements produced");
    assert_eq!(pull.close().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_push_capacity_follows_config() {
    let config = StreamConfig::new().with_push_capacity(1);
    let sent = Arc::new(AtomicU64::new(0));
    let counter = sent.clone();
    let stream = Stream::<u64>::async_push_with_config(
        move |emitter| {
            tokio::spawn(async move {
                for n in 0..100 {
                    if emitter.single(n).await.is_err() {
                        return;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        },
        &config,
    );
    let mut pull = stream.into_pull();
    assert_eq!(pull.pull().await.map(Chunk::into_vec), Ok(vec![0]));
    sleep(Duration::from_millis(50)).await;
    assert!(sent.load(Ordering::SeqCst) <= 3);
    assert_eq!(pull.close().await, Ok(()));
}
