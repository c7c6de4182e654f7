//! Storage backend trait and the two backends the queue ships with.
//!
//! Splitting I/O behind a trait lets [`crate::TaskQueue`] be exercised in
//! tests against an in-memory backend with the exact same recovery code path
//! that runs against real files in production.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Abstracts the filesystem operations [`crate::TaskQueue`] needs: segment
/// files under a handler-key directory, named by an increasing sequence
/// number.
#[async_trait]
pub trait SpoolStorage: Send + Sync {
    /// Lists existing segment sequence numbers for `dir`, ascending.
    async fn list_segments(&self, dir: &Path) -> io::Result<Vec<u64>>;

    /// Appends `bytes` to the end of segment `seq` in `dir`, creating it if
    /// necessary. `fsync` forces the write to durable storage before
    /// returning — callers set it on batch boundaries, not every call.
    async fn append(&self, dir: &Path, seq: u64, bytes: &[u8], fsync: bool) -> io::Result<()>;

    /// Reads segment `seq` from `dir` in full.
    async fn read_segment(&self, dir: &Path, seq: u64) -> io::Result<Vec<u8>>;

    /// Deletes segment `seq` from `dir`. A no-op if it does not exist.
    async fn remove_segment(&self, dir: &Path, seq: u64) -> io::Result<()>;

    /// Deletes every segment in `dir`.
    async fn remove_all(&self, dir: &Path) -> io::Result<()>;
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq:020}.spool"))
}

/// Production backend: one file per segment under a handler-key directory.
pub struct LocalFsStorage;

#[async_trait]
impl SpoolStorage for LocalFsStorage {
    async fn list_segments(&self, dir: &Path) -> io::Result<Vec<u64>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut seqs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".spool") {
                if let Ok(seq) = stem.parse::<u64>() {
                    seqs.push(seq);
                }
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn append(&self, dir: &Path, seq: u64, bytes: &[u8], fsync: bool) -> io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, seq))
            .await?;
        file.write_all(bytes).await?;
        if fsync {
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn read_segment(&self, dir: &Path, seq: u64) -> io::Result<Vec<u8>> {
        let mut file = match tokio::fs::File::open(segment_path(dir, seq)).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn remove_segment(&self, dir: &Path, seq: u64) -> io::Result<()> {
        match tokio::fs::remove_file(segment_path(dir, seq)).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn remove_all(&self, dir: &Path) -> io::Result<()> {
        for seq in self.list_segments(dir).await? {
            self.remove_segment(dir, seq).await?;
        }
        Ok(())
    }
}

/// Test backend: same recovery semantics, no filesystem involved.
#[derive(Default)]
pub struct InMemoryStorage {
    segments: Mutex<BTreeMap<PathBuf, BTreeMap<u64, Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpoolStorage for InMemoryStorage {
    async fn list_segments(&self, dir: &Path) -> io::Result<Vec<u64>> {
        let segments = self.segments.lock().unwrap();
        Ok(segments
            .get(dir)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn append(&self, dir: &Path, seq: u64, bytes: &[u8], _fsync: bool) -> io::Result<()> {
        let mut segments = self.segments.lock().unwrap();
        segments
            .entry(dir.to_path_buf())
            .or_default()
            .entry(seq)
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    async fn read_segment(&self, dir: &Path, seq: u64) -> io::Result<Vec<u8>> {
        let segments = self.segments.lock().unwrap();
        Ok(segments
            .get(dir)
            .and_then(|m| m.get(&seq))
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_segment(&self, dir: &Path, seq: u64) -> io::Result<()> {
        let mut segments = self.segments.lock().unwrap();
        if let Some(m) = segments.get_mut(dir) {
            m.remove(&seq);
        }
        Ok(())
    }

    async fn remove_all(&self, dir: &Path) -> io::Result<()> {
        self.segments.lock().unwrap().remove(dir);
        Ok(())
    }
}

/// Forwards through an `Arc`, so a storage backend can be shared between a
/// queue and whatever test harness wants to inspect it after the queue is
/// dropped (e.g. to reopen a new queue against the same backing store).
#[async_trait]
impl<S: SpoolStorage + ?Sized> SpoolStorage for Arc<S> {
    async fn list_segments(&self, dir: &Path) -> io::Result<Vec<u64>> {
        (**self).list_segments(dir).await
    }

    async fn append(&self, dir: &Path, seq: u64, bytes: &[u8], fsync: bool) -> io::Result<()> {
        (**self).append(dir, seq, bytes, fsync).await
    }

    async fn read_segment(&self, dir: &Path, seq: u64) -> io::Result<Vec<u8>> {
        (**self).read_segment(dir, seq).await
    }

    async fn remove_segment(&self, dir: &Path, seq: u64) -> io::Result<()> {
        (**self).remove_segment(dir, seq).await
    }

    async fn remove_all(&self, dir: &Path) -> io::Result<()> {
        (**self).remove_all(dir).await
    }
}
