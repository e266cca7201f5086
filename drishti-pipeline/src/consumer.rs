//! Long-poll queue consumer.
//!
//! One job in flight at a time. A message is deleted only after its job
//! completes; failed jobs stay on the queue and come back once their
//! visibility timeout expires.

use crate::pipeline::{JobPipeline, QueueMessage};
use crate::queue::{JobQueue, ReceivedMessage};
use drishti_core::config::QueueConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    /// Long-poll wait per receive
    pub wait_time: Duration,
    /// Pause after an empty poll or a queue error
    pub idle_sleep: Duration,
}

impl From<&QueueConfig> for ConsumerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            wait_time: Duration::from_secs(config.wait_time_secs),
            idle_sleep: Duration::from_millis(config.idle_sleep_ms),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub deleted: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    deleted: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }
}

pub struct QueueConsumer {
    queue: Arc<dyn JobQueue>,
    pipeline: JobPipeline,
    settings: ConsumerSettings,
    counters: Arc<Counters>,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn JobQueue>, pipeline: JobPipeline, settings: ConsumerSettings) -> Self {
        Self {
            queue,
            pipeline,
            settings,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// The signal is only raced against the poll wait and the idle sleep; a
    /// job that has started always runs to its end.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ConsumerStats {
        info!("Queue consumer started on {}", self.queue.name());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                result = self.queue.receive(self.settings.wait_time) => result,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok(Some(message)) => {
                    self.process(message).await;
                    continue;
                }
                Ok(None) => debug!("No messages on {}", self.queue.name()),
                Err(e) => error!("Receive from {} failed: {}", self.queue.name(), e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.idle_sleep) => {}
                _ = shutdown.changed() => break,
            }
        }

        let stats = self.stats();
        info!(
            "Queue consumer stopped: received={} completed={} failed={} deleted={}",
            stats.received, stats.completed, stats.failed, stats.deleted
        );
        stats
    }

    /// Run the job carried by one message and acknowledge it on success.
    pub async fn process(&self, message: ReceivedMessage) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Received message {} (delivery {})",
            message.message_id, message.receive_count
        );

        let job = match QueueMessage::parse(&message.body) {
            Ok(parsed) => parsed.into_job(),
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Message {} rejected: {}", message.message_id, e);
                return;
            }
        };

        match self.pipeline.run_queued(&job).await {
            Ok(report) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Job {} completed with {} detections",
                    report.uid,
                    report.detection_count()
                );
                match self.queue.delete(&message.receipt).await {
                    Ok(true) => {
                        self.counters.deleted.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => warn!(
                        "Message {} was redelivered before it could be deleted",
                        message.message_id
                    ),
                    Err(e) => error!("Deleting message {} failed: {}", message.message_id, e),
                }
            }
            Err(failure) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Job {} left on the queue for redelivery: {}",
                    job.uid, failure
                );
            }
        }
    }
}
