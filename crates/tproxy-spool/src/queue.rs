//! The disk-backed [`TaskQueue`] itself.

use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::SpoolError;
use crate::reason::QueueingReason;
use crate::record::{encode, scan};
use crate::storage::{LocalFsStorage, SpoolStorage};
use crate::task::{SpoolPayload, SubmissionTask};

/// Once a segment file reaches this size, new writes roll to a fresh one so
/// that fully-consumed segments can be deleted instead of growing forever.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 8 * 1024 * 1024;

struct Entry<T> {
    task: SubmissionTask<T>,
    segment: u64,
    record_len: u64,
    reason: Option<QueueingReason>,
}

struct QueueState<T> {
    /// Ascending segment sequence numbers currently on disk. The last one is
    /// the active write target.
    segments: VecDeque<u64>,
    pending: VecDeque<Entry<T>>,
    remaining_per_segment: BTreeMap<u64, u64>,
    active_bytes: u64,
    next_seq: u64,
}

/// A snapshot of queue health, for the proxy's periodic stats reporter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpoolStats {
    pub queued: u64,
    pub on_disk_bytes: u64,
    pub oldest_task_age: Option<Duration>,
    pub dead_lettered: u64,
    pub corrupt_records_skipped: u64,
}

/// A disk-backed, crash-recoverable FIFO of [`SubmissionTask`]s for one
/// `HandlerKey`.
///
/// Shared by every sender task of a handler's pool, so all mutating
/// operations take an internal `tokio::sync::Mutex` — callers never need
/// their own synchronization around a `TaskQueue`.
pub struct TaskQueue<T: SpoolPayload, S: SpoolStorage = LocalFsStorage> {
    dir: PathBuf,
    storage: S,
    state: Mutex<QueueState<T>>,
    len: AtomicU64,
    total_bytes: AtomicU64,
    dead_lettered: AtomicU64,
    cleared: AtomicU64,
    corrupt_skipped: AtomicU64,
    max_segment_bytes: u64,
    _marker: PhantomData<T>,
}

impl<T: SpoolPayload> TaskQueue<T, LocalFsStorage> {
    /// Opens (creating and/or recovering) the queue for `dir` on the local
    /// filesystem.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        Self::open_with_storage(dir, LocalFsStorage).await
    }
}

impl<T: SpoolPayload, S: SpoolStorage> TaskQueue<T, S> {
    pub async fn open_with_storage(dir: impl Into<PathBuf>, storage: S) -> Result<Self, SpoolError> {
        let dir = dir.into();
        let queue = Self {
            dir,
            storage,
            state: Mutex::new(QueueState {
                segments: VecDeque::new(),
                pending: VecDeque::new(),
                remaining_per_segment: BTreeMap::new(),
                active_bytes: 0,
                next_seq: 0,
            }),
            len: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
            corrupt_skipped: AtomicU64::new(0),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            _marker: PhantomData,
        };
        queue.recover().await?;
        Ok(queue)
    }

    pub fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes.max(1);
        self
    }

    async fn recover(&self) -> Result<(), SpoolError> {
        let seqs = self.storage.list_segments(&self.dir).await?;
        let mut state = self.state.lock().await;
        let mut total_queued = 0u64;
        let mut total_bytes = 0u64;
        let mut corrupt = 0u64;
        let mut truncated_tail = false;

        for &seq in &seqs {
            let bytes = self.storage.read_segment(&self.dir, seq).await?;
            let result = scan::<T>(&bytes, 0);
            corrupt += result.corrupt_records;
            let mut remaining = 0u64;
            for (task, record_len) in result.records {
                total_queued += 1;
                total_bytes += record_len as u64;
                remaining += 1;
                state.pending.push_back(Entry {
                    task,
                    segment: seq,
                    record_len: record_len as u64,
                    reason: None,
                });
            }
            state.remaining_per_segment.insert(seq, remaining);
            state.segments.push_back(seq);
            if result.consumed < bytes.len() {
                warn!(segment = seq, "spool segment has a truncated/corrupt tail; rolling to a new segment");
                truncated_tail = true;
            } else if seq == *seqs.last().unwrap() {
                state.active_bytes = bytes.len() as u64;
            }
        }

        state.next_seq = seqs.iter().copied().max().map(|s| s + 1).unwrap_or(0);
        if state.segments.is_empty() || truncated_tail {
            let new_seq = state.next_seq;
            state.next_seq += 1;
            state.segments.push_back(new_seq);
            state.remaining_per_segment.entry(new_seq).or_insert(0);
            state.active_bytes = 0;
        }

        drop(state);
        self.len.store(total_queued, Ordering::Relaxed);
        self.total_bytes.store(total_bytes, Ordering::Relaxed);
        self.corrupt_skipped.store(corrupt, Ordering::Relaxed);
        if corrupt > 0 {
            warn!(corrupt, "skipped corrupt spool records during recovery");
        }
        Ok(())
    }

    /// Enqueues a single task, fsync'ing immediately.
    pub async fn add(&self, task: SubmissionTask<T>, reason: QueueingReason) -> Result<(), SpoolError> {
        self.add_batch(vec![(task, reason)]).await
    }

    /// Enqueues a batch of tasks with a single fsync at the end — the
    /// "fsync on batch boundary" durability/throughput tradeoff.
    pub async fn add_batch(
        &self,
        items: Vec<(SubmissionTask<T>, QueueingReason)>,
    ) -> Result<(), SpoolError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let last_index = items.len() - 1;
        let mut added = 0u64;
        let mut added_bytes = 0u64;

        for (i, (task, reason)) in items.into_iter().enumerate() {
            let bytes = encode(&task);
            let record_len = bytes.len() as u64;
            let active_seq = *state.segments.back().expect("segments never empty after open");
            self.storage
                .append(&self.dir, active_seq, &bytes, i == last_index)
                .await?;
            state.active_bytes += record_len;
            *state.remaining_per_segment.entry(active_seq).or_insert(0) += 1;
            state.pending.push_back(Entry {
                task,
                segment: active_seq,
                record_len,
                reason: Some(reason),
            });
            added += 1;
            added_bytes += record_len;

            if state.active_bytes >= self.max_segment_bytes {
                let new_seq = state.next_seq;
                state.next_seq += 1;
                state.segments.push_back(new_seq);
                state.remaining_per_segment.entry(new_seq).or_insert(0);
                state.active_bytes = 0;
            }
        }

        drop(state);
        self.len.fetch_add(added, Ordering::Relaxed);
        self.total_bytes.fetch_add(added_bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the head task without dequeuing it.
    pub async fn peek(&self) -> Option<SubmissionTask<T>> {
        self.state.lock().await.pending.front().map(|e| e.task.clone())
    }

    /// Dequeues and returns the head task, deleting its segment file once the
    /// segment has no tasks left and is no longer the active write target.
    pub async fn remove(&self) -> Result<Option<SubmissionTask<T>>, SpoolError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.pending.pop_front() else {
            return Ok(None);
        };

        let remaining = state
            .remaining_per_segment
            .get_mut(&entry.segment)
            .expect("segment tracked before its tasks are removed");
        *remaining -= 1;
        let remaining = *remaining;
        let is_active = state.segments.back() == Some(&entry.segment);

        if remaining == 0 && !is_active {
            state.remaining_per_segment.remove(&entry.segment);
            if state.segments.front() == Some(&entry.segment) {
                state.segments.pop_front();
            }
            drop(state);
            self.storage.remove_segment(&self.dir, entry.segment).await?;
        }

        self.len.fetch_sub(1, Ordering::Relaxed);
        self.total_bytes.fetch_sub(entry.record_len, Ordering::Relaxed);
        Ok(Some(entry.task))
    }

    /// Dequeues the next task that is still worth retrying: one that has not
    /// exceeded `max_attempts` and is not older than `max_age`. Tasks that
    /// fail either check are dropped and counted as dead-lettered rather than
    /// returned.
    pub async fn remove_if_alive(
        &self,
        max_attempts: u32,
        max_age: Duration,
    ) -> Result<Option<SubmissionTask<T>>, SpoolError> {
        loop {
            let Some(task) = self.remove().await? else {
                return Ok(None);
            };
            if task.attempts >= max_attempts || task.age() >= max_age {
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    attempts = task.attempts,
                    age_secs = task.age().as_secs(),
                    "dead-lettering spooled task"
                );
                continue;
            }
            return Ok(Some(task));
        }
    }

    /// Breaks down currently-queued tasks by why they were spooled, for the
    /// proxy's stats reporter.
    pub async fn reason_counts(&self) -> BTreeMap<&'static str, u64> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for entry in &state.pending {
            if let Some(reason) = entry.reason {
                *counts.entry(reason.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Number of tasks currently queued.
    pub fn size(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    /// Total tasks dropped by explicit [`clear`](Self::clear) calls, separate
    /// from the natural dead-lettering tracked in [`SpoolStats`].
    pub fn cleared(&self) -> u64 {
        self.cleared.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> SpoolStats {
        let oldest_task_age = self.state.lock().await.pending.front().map(|e| e.task.age());
        SpoolStats {
            queued: self.len.load(Ordering::Relaxed),
            on_disk_bytes: self.total_bytes.load(Ordering::Relaxed),
            oldest_task_age,
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            corrupt_records_skipped: self.corrupt_skipped.load(Ordering::Relaxed),
        }
    }

    /// Drops every queued task and deletes all segment files. The dropped
    /// count is added to the dead-letter/loss counter surfaced in [`stats`](Self::stats).
    pub async fn clear(&self) -> Result<(), SpoolError> {
        let mut state = self.state.lock().await;
        let dropped = state.pending.len() as u64;
        self.storage.remove_all(&self.dir).await?;

        let new_seq = state.next_seq;
        state.next_seq += 1;
        state.segments.clear();
        state.segments.push_back(new_seq);
        state.remaining_per_segment.clear();
        state.remaining_per_segment.insert(new_seq, 0);
        state.pending.clear();
        state.active_bytes = 0;
        drop(state);

        self.len.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.cleared.fetch_add(dropped, Ordering::Relaxed);
        Ok(())
    }
}
