//! Job payloads and the leased job handle.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{send_payload, QueueBackend, WorkQueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Scrape every post of a channel.
    ScrapeId,
    /// Scrape the discussion thread below one channel post.
    ScrapeComments,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ScrapeId => "scrape_id",
            JobType::ScrapeComments => "scrape_comments",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = WorkQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape_id" => Ok(JobType::ScrapeId),
            "scrape_comments" => Ok(JobType::ScrapeComments),
            other => Err(WorkQueueError::InvalidJobType(other.to_string())),
        }
    }
}

/// What a job points at: a channel, or one post inside a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobTarget {
    Post {
        channel_id: String,
        message_id: String,
    },
    Channel(String),
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::Channel(channel) => f.write_str(channel),
            JobTarget::Post {
                channel_id,
                message_id,
            } => write!(f, "{}/{}", channel_id, message_id),
        }
    }
}

/// Queue message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub target: JobTarget,
}

impl JobPayload {
    pub fn new(job_type: JobType, target: JobTarget) -> Self {
        Self { job_type, target }
    }

    pub fn to_body(&self) -> Result<String, WorkQueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_body(body: &str) -> Result<Self, WorkQueueError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Where a job's lease stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Leased,
    /// Handed back for immediate redelivery.
    Released,
    /// Removed from the queue.
    Deleted,
    /// Removed, then re-sent as a fresh copy.
    Requeued,
}

struct Lease {
    backend: Arc<dyn QueueBackend>,
    receipt: String,
}

/// A received job. Must be rejected or deleted; dropping a live lease only
/// logs, and the queue redelivers the message once its lease expires.
pub struct Job {
    payload: JobPayload,
    lease: Option<Lease>,
    state: LeaseState,
    received_at: Instant,
}

impl Job {
    pub(crate) fn leased(payload: JobPayload, backend: Arc<dyn QueueBackend>, receipt: String) -> Self {
        Self {
            payload,
            lease: Some(Lease { backend, receipt }),
            state: LeaseState::Leased,
            received_at: Instant::now(),
        }
    }

    /// A job with no queue behind it. Settling it has no external effect.
    pub fn test(payload: JobPayload) -> Self {
        Self {
            payload,
            lease: None,
            state: LeaseState::Leased,
            received_at: Instant::now(),
        }
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type
    }

    pub fn target(&self) -> &JobTarget {
        &self.payload.target
    }

    pub fn is_test(&self) -> bool {
        self.lease.is_none()
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// True once the job is gone from the queue, whether or not a copy was re-sent.
    pub fn is_deleted(&self) -> bool {
        matches!(self.state, LeaseState::Deleted | LeaseState::Requeued)
    }

    /// Time since the job was received.
    pub fn lease_age(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Release the lease so the message is redeliverable right away.
    pub async fn reject(&mut self) -> Result<(), WorkQueueError> {
        if self.state != LeaseState::Leased {
            return Err(WorkQueueError::AlreadySettled);
        }
        if let Some(lease) = &self.lease {
            lease.backend.release(&lease.receipt).await?;
        }
        self.state = LeaseState::Released;
        Ok(())
    }

    pub async fn delete(&mut self) -> Result<(), WorkQueueError> {
        match self.state {
            LeaseState::Deleted | LeaseState::Requeued => return Err(WorkQueueError::DoubleDelete),
            LeaseState::Released => return Err(WorkQueueError::AlreadySettled),
            LeaseState::Leased => {}
        }
        if let Some(lease) = &self.lease {
            lease.backend.delete(&lease.receipt).await?;
        }
        self.state = LeaseState::Deleted;
        Ok(())
    }

    /// Re-send this job as a brand-new message. Only valid after `delete()`;
    /// the copy starts with fresh redelivery accounting.
    pub async fn requeue_as_copy(&mut self) -> Result<(), WorkQueueError> {
        match self.state {
            LeaseState::Deleted => {}
            LeaseState::Requeued => return Err(WorkQueueError::AlreadySettled),
            LeaseState::Leased | LeaseState::Released => return Err(WorkQueueError::NotDeleted),
        }
        warn!(
            "Re-sending job of type '{}' with target '{}' to the queue",
            self.payload.job_type, self.payload.target
        );
        if let Some(lease) = &self.lease {
            send_payload(lease.backend.as_ref(), &self.payload).await?;
        }
        self.state = LeaseState::Requeued;
        info!("Re-sending done");
        Ok(())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("payload", &self.payload)
            .field("is_test", &self.is_test())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.state == LeaseState::Leased && !self.is_test() {
            warn!(
                "Job '{}' ({}) dropped while still leased; it will be redelivered after the visibility timeout",
                self.payload.target, self.payload.job_type
            );
        }
    }
}
