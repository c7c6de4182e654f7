//! Disk-backed overflow queue for [`SubmissionTask`]s.
//!
//! One [`TaskQueue`] exists per `HandlerKey` and is shared by every sender
//! task in that handler's pool. Tasks are appended to a sequence of segment
//! files, decoded into an in-memory FIFO on open (so `peek`/`remove` never
//! touch disk on the read path), and segment files are deleted once every
//! record they hold has been dequeued.

mod error;
mod queue;
mod reason;
mod record;
mod storage;
mod task;

pub use error::SpoolError;
pub use queue::{SpoolStats, TaskQueue, DEFAULT_MAX_SEGMENT_BYTES};
pub use reason::QueueingReason;
pub use storage::{InMemoryStorage, LocalFsStorage, SpoolStorage};
pub use task::{SpoolPayload, SubmissionTask};
