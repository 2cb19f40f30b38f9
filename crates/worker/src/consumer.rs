//! Queue consumer.

use std::time::Duration;

use async_trait::async_trait;
use dq_core::JobPayload;
use tracing::{error, info, warn};

use crate::dispatch::DispatchError;
use crate::queue::{JobQueue, QueueError};

/// Tests the package named by a job.
#[async_trait]
pub trait JobHandler: Send {
    /// Handle one decoded job.
    async fn handle(&mut self, job: &JobPayload) -> Result<(), DispatchError>;
}

/// Counts from one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Jobs handled successfully
    pub handled: usize,
    /// Jobs whose handler failed
    pub failed: usize,
    /// Bodies that did not decode as a job
    pub malformed: usize,
}

impl DrainStats {
    /// Bodies taken off the queue.
    pub fn total(&self) -> usize {
        self.handled + self.failed + self.malformed
    }
}

/// Takes jobs off a queue one at a time and hands them to a handler.
///
/// A job that fails to decode or to run is logged and dropped; the consumer
/// carries on with the next one.
pub struct Consumer<Q: JobQueue, H: JobHandler> {
    queue: Q,
    handler: H,
    poll_interval: Duration,
}

impl<Q: JobQueue, H: JobHandler> Consumer<Q, H> {
    /// Create a consumer polling once a second.
    pub fn new(queue: Q, handler: H) -> Self {
        Self {
            queue,
            handler,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Wait this long between polls of an empty queue.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The queue.
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// The handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    async fn process(&mut self, body: &str, stats: &mut DrainStats) {
        let job = match JobPayload::decode(body) {
            Ok(job) => job,
            Err(e) => {
                warn!("Dropping malformed job {:?}: {}", body, e);
                stats.malformed += 1;
                return;
            }
        };

        info!(
            "Job: package {} run {} file {}",
            job.package_id, job.runtime_id, job.filename
        );
        match self.handler.handle(&job).await {
            Ok(()) => stats.handled += 1,
            Err(e) => {
                error!("Job for package {} failed: {}", job.package_id, e);
                stats.failed += 1;
            }
        }
    }

    /// Process jobs until the queue is empty.
    pub async fn drain_once(&mut self) -> Result<DrainStats, QueueError> {
        let mut stats = DrainStats::default();
        while let Some(body) = self.queue.pop().await? {
            self.process(&body, &mut stats).await;
        }
        Ok(stats)
    }

    /// Process jobs as they arrive. Returns only on a queue error.
    pub async fn run_forever(&mut self) -> Result<(), QueueError> {
        loop {
            let stats = self.drain_once().await?;
            if stats.total() > 0 {
                info!(
                    "Drained {} jobs ({} failed, {} malformed)",
                    stats.total(),
                    stats.failed,
                    stats.malformed
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use dq_core::{PackageId, RuntimeId};

    #[derive(Default)]
    struct Recorder {
        seen: Vec<JobPayload>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&mut self, job: &JobPayload) -> Result<(), DispatchError> {
            self.seen.push(job.clone());
            if job.package_id == PackageId(2) {
                return Err(DispatchError::ChildFailed {
                    package_id: job.package_id,
                    code: Some(1),
                });
            }
            Ok(())
        }
    }

    fn body(package: i64) -> String {
        JobPayload {
            filename: format!("/tmp/{package}.xml"),
            runtime_id: RuntimeId(5),
            package_id: PackageId(package),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_drain_once_continues_past_failures() {
        let queue: MemoryQueue = [body(1), "not json".to_string(), body(2), body(3)]
            .into_iter()
            .collect();
        let mut consumer = Consumer::new(queue, Recorder::default());

        let stats = consumer.drain_once().await.unwrap();
        assert_eq!(
            stats,
            DrainStats {
                handled: 2,
                failed: 1,
                malformed: 1,
            }
        );
        let packages: Vec<_> = consumer.handler().seen.iter().map(|j| j.package_id).collect();
        assert_eq!(packages, vec![PackageId(1), PackageId(2), PackageId(3)]);
        assert!(consumer.queue().is_empty());
    }

    #[tokio::test]
    async fn test_drain_empty_queue() {
        let mut consumer = Consumer::new(MemoryQueue::new(), Recorder::default());
        assert_eq!(consumer.drain_once().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_run_forever_keeps_polling() {
        let queue: MemoryQueue = [body(1)].into_iter().collect();
        let mut consumer =
            Consumer::new(queue, Recorder::default()).with_poll_interval(Duration::from_millis(5));

        let outcome = tokio::time::timeout(Duration::from_millis(50), consumer.run_forever()).await;
        assert!(outcome.is_err());
        assert_eq!(consumer.handler().seen.len(), 1);
    }
}
