//! Lease-based job queue.
//!
//! Producers `submit` jobs; a worker pulls them one at a time from a
//! [`JobStream`]. Every received job holds a lease (a receipt handle) that
//! must end in `reject()` or `delete()`. Messages are grouped by a hash of
//! their body and delivered in order within a group.

mod error;
mod job;
mod memory;
mod sqlite;

pub use error::WorkQueueError;
pub use job::{Job, JobPayload, JobTarget, JobType, LeaseState};
pub use memory::InMemoryQueueBackend;
pub use sqlite::SqliteQueueBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// A message handed out by a backend together with its lease receipt.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: String,
    pub receipt: String,
}

/// Transport behind the queue.
///
/// Receiving a message hides it for the backend's visibility timeout and
/// issues a fresh receipt. Older receipts for the same message stop working.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn send(&self, body: &str, group_id: &str) -> Result<(), WorkQueueError>;

    /// Receive up to `max_messages` visible messages.
    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, WorkQueueError>;

    /// Make a received message visible again immediately.
    async fn release(&self, receipt: &str) -> Result<(), WorkQueueError>;

    async fn delete(&self, receipt: &str) -> Result<(), WorkQueueError>;

    /// Messages in the queue, in flight or not.
    async fn depth(&self) -> Result<usize, WorkQueueError>;
}

/// Ordered-delivery group for a message body.
pub fn group_id(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

pub(crate) async fn send_payload(
    backend: &dyn QueueBackend,
    payload: &JobPayload,
) -> Result<(), WorkQueueError> {
    let body = payload.to_body()?;
    info!("Sending job: '{}'", body);
    backend.send(&body, &group_id(&body)).await
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Sleep between polls that returned nothing.
    pub empty_poll_delay: Duration,
    /// Consecutive empty polls tolerated before the stream ends.
    pub max_empty_polls: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            empty_poll_delay: Duration::from_secs(60),
            max_empty_polls: 15,
        }
    }
}

pub struct WorkQueue {
    backend: Arc<dyn QueueBackend>,
    poll: PollSettings,
    test_jobs: Option<Vec<JobPayload>>,
}

impl WorkQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            poll: PollSettings::default(),
            test_jobs: None,
        }
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Replay these jobs instead of reading the backend.
    pub fn with_test_jobs(mut self, jobs: Vec<JobPayload>) -> Self {
        self.test_jobs = Some(jobs);
        self
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_jobs.is_some()
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Validate the job type and enqueue.
    pub async fn submit(&self, job_type: &str, target: JobTarget) -> Result<(), WorkQueueError> {
        let job_type: JobType = job_type.parse()?;
        self.submit_payload(&JobPayload::new(job_type, target)).await
    }

    pub async fn submit_payload(&self, payload: &JobPayload) -> Result<(), WorkQueueError> {
        send_payload(self.backend.as_ref(), payload).await
    }

    /// A fresh job stream. The stream cannot be rewound; build a new one.
    pub fn jobs(&self) -> JobStream {
        let source = match &self.test_jobs {
            Some(jobs) => JobSource::Test(jobs.clone().into_iter()),
            None => JobSource::Live { empty_polls: 0 },
        };
        JobStream {
            backend: self.backend.clone(),
            poll: self.poll.clone(),
            source,
        }
    }
}

/// Parse a JSON array of job payloads, as given in `TEST_JOBS`.
pub fn parse_test_jobs(json: &str) -> Result<Vec<JobPayload>, WorkQueueError> {
    Ok(serde_json::from_str(json)?)
}

enum JobSource {
    Test(std::vec::IntoIter<JobPayload>),
    Live { empty_polls: u32 },
}

pub struct JobStream {
    backend: Arc<dyn QueueBackend>,
    poll: PollSettings,
    source: JobSource,
}

impl JobStream {
    /// Next job, or `None` once the test list is exhausted or the queue has
    /// stayed empty for too long.
    pub async fn next(&mut self) -> Result<Option<Job>, WorkQueueError> {
        let empty_polls = match &mut self.source {
            JobSource::Test(jobs) => return Ok(jobs.next().map(Job::test)),
            JobSource::Live { empty_polls } => empty_polls,
        };

        loop {
            let mut messages = self.backend.receive(1).await?;
            match messages.len() {
                0 => {
                    *empty_polls += 1;
                    debug!("No jobs ({} empty polls)", empty_polls);
                    if *empty_polls > self.poll.max_empty_polls {
                        info!("Queue stayed empty for {} polls; stopping", empty_polls);
                        return Ok(None);
                    }
                    tokio::time::sleep(self.poll.empty_poll_delay).await;
                }
                1 => {
                    *empty_polls = 0;
                    let message = messages.remove(0);
                    match JobPayload::from_body(&message.body) {
                        Ok(payload) => {
                            return Ok(Some(Job::leased(
                                payload,
                                self.backend.clone(),
                                message.receipt,
                            )))
                        }
                        Err(e) => {
                            warn!("Rejecting malformed job '{}': {}", message.body, e);
                            self.backend.release(&message.receipt).await?;
                        }
                    }
                }
                n => return Err(WorkQueueError::ProtocolViolation(n)),
            }
        }
    }
}
