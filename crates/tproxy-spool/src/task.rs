//! The unit of work a [`crate::TaskQueue`] persists and replays.

use std::time::{Duration, SystemTime};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A payload a [`TaskQueue`](crate::TaskQueue) can spool to disk.
///
/// `DISCRIMINATOR` is written into every stored record so that a future
/// binary with more entity types can still recognize (and skip, rather than
/// misinterpret) records written by an older one.
pub trait SpoolPayload: Sized + Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Stable tag identifying this payload kind on disk. Never reuse a value
    /// once it has shipped.
    const DISCRIMINATOR: u8;

    /// Cost of this payload for batching/pushback purposes (e.g. point count).
    fn weight(&self) -> u64;

    /// Splits this payload into two (or more) payloads each within
    /// `[min_weight, max_weight]`, used to retry after an HTTP 406 ("batch too
    /// large") pushback. Implementations that cannot be split smaller than
    /// `min_weight` should return a single-element vec containing `self`.
    fn split(self, min_weight: u64, max_weight: u64) -> Vec<Self>;
}

/// A payload queued for submission, carrying its own retry bookkeeping.
///
/// `first_attempt` is set once, at creation, and never touched again — it is
/// the basis for the queue's max-age dead-lettering check. `attempts` is
/// incremented by the sender-task pool every time a submission is tried,
/// whether it came straight from the in-memory buffer or from the spool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionTask<T> {
    pub payload: T,
    pub handle: String,
    pub first_attempt: SystemTime,
    pub attempts: u32,
}

impl<T: SpoolPayload> SubmissionTask<T> {
    pub fn new(payload: T, handle: impl Into<String>) -> Self {
        Self {
            payload,
            handle: handle.into(),
            first_attempt: SystemTime::now(),
            attempts: 0,
        }
    }

    pub fn weight(&self) -> u64 {
        self.payload.weight()
    }

    pub fn age(&self) -> Duration {
        self.first_attempt.elapsed().unwrap_or_default()
    }

    /// Splits the payload in two (or more), preserving `handle`,
    /// `first_attempt`, and `attempts` on every resulting task.
    pub fn split_task(self, min_weight: u64, max_weight: u64) -> Vec<Self> {
        let handle = self.handle;
        let first_attempt = self.first_attempt;
        let attempts = self.attempts;
        self.payload
            .split(min_weight, max_weight)
            .into_iter()
            .map(|payload| SubmissionTask {
                payload,
                handle: handle.clone(),
                first_attempt,
                attempts,
            })
            .collect()
    }
}
