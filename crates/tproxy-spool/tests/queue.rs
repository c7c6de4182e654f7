use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tproxy_spool::{InMemoryStorage, QueueingReason, SpoolPayload, SubmissionTask, TaskQueue};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Batch(Vec<u32>);

impl SpoolPayload for Batch {
    const DISCRIMINATOR: u8 = 1;

    fn weight(&self) -> u64 {
        self.0.len() as u64
    }

    fn split(self, min_weight: u64, _max_weight: u64) -> Vec<Self> {
        if (self.0.len() as u64) <= min_weight {
            return vec![self];
        }
        let mid = self.0.len() / 2;
        let (a, b) = self.0.split_at(mid);
        vec![Batch(a.to_vec()), Batch(b.to_vec())]
    }
}

async fn open_queue() -> TaskQueue<Batch, InMemoryStorage> {
    TaskQueue::open_with_storage("handler-key", InMemoryStorage::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn add_then_remove_is_fifo() {
    let queue = open_queue().await;
    queue
        .add(SubmissionTask::new(Batch(vec![1, 2]), "h1"), QueueingReason::BufferSize)
        .await
        .unwrap();
    queue
        .add(SubmissionTask::new(Batch(vec![3]), "h1"), QueueingReason::RateLimit)
        .await
        .unwrap();

    assert_eq!(queue.size(), 2);
    let first = queue.remove().await.unwrap().unwrap();
    assert_eq!(first.payload, Batch(vec![1, 2]));
    let second = queue.remove().await.unwrap().unwrap();
    assert_eq!(second.payload, Batch(vec![3]));
    assert_eq!(queue.size(), 0);
    assert!(queue.remove().await.unwrap().is_none());
}

#[tokio::test]
async fn peek_does_not_dequeue() {
    let queue = open_queue().await;
    queue
        .add(SubmissionTask::new(Batch(vec![9]), "h1"), QueueingReason::ServerError)
        .await
        .unwrap();

    let peeked = queue.peek().await.unwrap();
    assert_eq!(peeked.payload, Batch(vec![9]));
    assert_eq!(queue.size(), 1);
}

#[tokio::test]
async fn remove_if_alive_dead_letters_over_max_attempts() {
    let queue = open_queue().await;
    let mut stale = SubmissionTask::new(Batch(vec![1]), "h1");
    stale.attempts = 10;
    queue.add(stale, QueueingReason::ServerError).await.unwrap();
    queue
        .add(SubmissionTask::new(Batch(vec![2]), "h1"), QueueingReason::ServerError)
        .await
        .unwrap();

    let survivor = queue
        .remove_if_alive(3, Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(survivor.payload, Batch(vec![2]));

    let stats = queue.stats().await;
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn clear_drops_everything() {
    let queue = open_queue().await;
    for i in 0..5u32 {
        queue
            .add(SubmissionTask::new(Batch(vec![i]), "h1"), QueueingReason::ProxyShutdown)
            .await
            .unwrap();
    }
    assert_eq!(queue.size(), 5);
    queue.clear().await.unwrap();
    assert_eq!(queue.size(), 0);
    assert!(queue.peek().await.is_none());
}

#[tokio::test]
async fn recovery_replays_segments_across_reopen() {
    let storage = Arc::new(InMemoryStorage::new());
    {
        let queue: TaskQueue<Batch, _> =
            TaskQueue::open_with_storage("handler-key", storage.clone()).await.unwrap();
        queue
            .add(SubmissionTask::new(Batch(vec![1, 2, 3]), "h1"), QueueingReason::BufferSize)
            .await
            .unwrap();
        queue
            .add(SubmissionTask::new(Batch(vec![4]), "h1"), QueueingReason::BufferSize)
            .await
            .unwrap();
        // queue dropped here; a fresh queue opened against the same backing
        // store must recover both tasks, in order.
    }

    let reopened: TaskQueue<Batch, _> =
        TaskQueue::open_with_storage("handler-key", storage).await.unwrap();
    assert_eq!(reopened.size(), 2);
    let first = reopened.remove().await.unwrap().unwrap();
    assert_eq!(first.payload, Batch(vec![1, 2, 3]));
    let second = reopened.remove().await.unwrap().unwrap();
    assert_eq!(second.payload, Batch(vec![4]));
}

#[test]
fn split_task_preserves_bookkeeping() {
    let task = SubmissionTask::new(Batch(vec![1, 2, 3, 4]), "h1");
    let handle = task.handle.clone();
    let parts = task.split_task(1, 2);
    assert_eq!(parts.len(), 2);
    for part in &parts {
        assert_eq!(part.handle, handle);
        assert_eq!(part.attempts, 0);
    }
    let total: usize = parts.iter().map(|p| p.payload.0.len()).sum();
    assert_eq!(total, 4);
}
