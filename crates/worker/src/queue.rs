//! Job queues.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// Errors raised by a queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A FIFO of raw job bodies.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a body to the back of the queue.
    async fn push(&mut self, body: String) -> Result<(), QueueError>;

    /// Take the body at the front of the queue, if any.
    async fn pop(&mut self) -> Result<Option<String>, QueueError>;
}

/// Queue held in memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: VecDeque<String>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued bodies.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for MemoryQueue {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&mut self, body: String) -> Result<(), QueueError> {
        self.items.push_back(body);
        Ok(())
    }

    async fn pop(&mut self) -> Result<Option<String>, QueueError> {
        Ok(self.items.pop_front())
    }
}

/// Queue backed by a spool directory.
///
/// Each job is one `*.json` file; files are consumed in name order and
/// deleted once read. Bodies are written to a temporary name first so a
/// reader never sees a partial file.
#[derive(Debug)]
pub struct SpoolQueue {
    dir: PathBuf,
    seq: u64,
}

impl SpoolQueue {
    /// Open a spool directory, creating it if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, QueueError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, seq: 0 })
    }

    /// The spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn pending(&self) -> Result<Vec<PathBuf>, QueueError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn push(&mut self, body: String) -> Result<(), QueueError> {
        self.seq += 1;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.9f");
        let name = format!("{}-{:06}", stamp, self.seq);
        let tmp = self.dir.join(format!("{}.tmp", name));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, self.dir.join(format!("{}.json", name))).await?;
        Ok(())
    }

    async fn pop(&mut self) -> Result<Option<String>, QueueError> {
        let Some(path) = self.pending().await?.into_iter().next() else {
            return Ok(None);
        };
        let body = tokio::fs::read_to_string(&path).await?;
        tokio::fs::remove_file(&path).await?;
        debug!("Dequeued {}", path.display());
        Ok(Some(body))
    }
}
