//! Job execution and the worker loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use super::{
    AbortReason, ScrapeContext, ScrapeError, ScrapeResult, ScrapeSession, SessionOutcome,
    SessionReport,
};
use crate::channel::ChannelRef;
use crate::work_queue::{Job, JobPayload, JobTarget, JobType, WorkQueue};

/// What became of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Scraped(SessionReport),
    /// Listed in the skip targets; deleted without scraping.
    Skipped,
    /// Handed back to the queue.
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: usize,
    pub aborted: usize,
    pub skipped: usize,
    pub rejected: usize,
}

impl WorkerSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Scraped(report) => match report.outcome {
                SessionOutcome::Completed => self.completed += 1,
                SessionOutcome::Aborted(_) => self.aborted += 1,
            },
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Rejected => self.rejected += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.aborted + self.skipped + self.rejected
    }
}

/// A validated job target.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Task {
    Listing(ChannelRef),
    Replies(ChannelRef, String),
}

fn parse_task(payload: &JobPayload) -> ScrapeResult<Task> {
    let channel = |s: &str| {
        s.parse::<ChannelRef>()
            .map_err(|e| ScrapeError::InvalidTarget(format!("'{}': {}", s, e)))
    };
    match (payload.job_type, &payload.target) {
        (JobType::ScrapeId, JobTarget::Channel(target)) => Ok(Task::Listing(channel(target)?)),
        (
            JobType::ScrapeComments,
            JobTarget::Post {
                channel_id,
                message_id,
            },
        ) => {
            if message_id.is_empty() || !message_id.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ScrapeError::InvalidTarget(format!(
                    "message id '{}' is not a number",
                    message_id
                )));
            }
            Ok(Task::Replies(channel(channel_id)?, message_id.clone()))
        }
        (job_type, target) => Err(ScrapeError::InvalidTarget(format!(
            "'{}' does not fit a {} job",
            target, job_type
        ))),
    }
}

/// Runs jobs one at a time against a single rendering surface.
pub struct Worker {
    ctx: ScrapeContext,
    stop_flag: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(ctx: ScrapeContext) -> Self {
        Self {
            ctx,
            stop_flag: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop between jobs once this file exists. The file is removed when seen.
    pub fn with_stop_flag(mut self, path: &Path) -> Self {
        self.stop_flag = Some(path.to_path_buf());
        self
    }

    pub fn context(&self) -> &ScrapeContext {
        &self.ctx
    }

    /// Set to `true` to stop after the job in progress.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    async fn should_stop(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            info!("Shutdown requested");
            return true;
        }
        let Some(flag) = &self.stop_flag else {
            return false;
        };
        if !tokio::fs::try_exists(flag).await.unwrap_or(false) {
            return false;
        }
        info!("Found stop flag {}", flag.display());
        if let Err(e) = tokio::fs::remove_file(flag).await {
            warn!("Could not remove stop flag {}: {}", flag.display(), e);
        }
        true
    }

    /// Work through the queue until it drains, a stop is requested, or a job
    /// fails fatally.
    pub async fn run(&self, queue: &WorkQueue) -> ScrapeResult<WorkerSummary> {
        let mut jobs = queue.jobs();
        let mut summary = WorkerSummary::default();
        loop {
            if self.should_stop().await {
                break;
            }
            let Some(mut job) = jobs.next().await? else {
                info!("No more jobs");
                break;
            };
            let outcome = self.execute(&mut job).await?;
            summary.record(&outcome);
        }
        info!(
            "Worker stopped: {} completed, {} aborted, {} skipped, {} rejected",
            summary.completed, summary.aborted, summary.skipped, summary.rejected
        );
        Ok(summary)
    }

    /// Like [`run`](Self::run), also stopping between jobs on Ctrl-C.
    pub async fn run_until_shutdown(&self, queue: &WorkQueue) -> ScrapeResult<WorkerSummary> {
        let shutdown = self.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, stopping after the current job");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
        self.run(queue).await
    }

    /// Run one job and settle its lease.
    ///
    /// A fatal error leaves a live lease to expire so the job is redelivered
    /// later. If the job was already deleted ahead of time, a copy is sent
    /// before the error is returned.
    pub async fn execute(&self, job: &mut Job) -> ScrapeResult<JobOutcome> {
        info!("Starting {} job for '{}'", job.job_type(), job.target());

        let target = job.target().to_string();
        if self.ctx.settings.skip_targets.contains(&target) {
            info!("Skipping '{}'", target);
            job.delete().await?;
            return Ok(JobOutcome::Skipped);
        }

        let task = match parse_task(job.payload()) {
            Ok(task) => task,
            Err(e) => {
                warn!("Rejecting job: {}", e);
                job.reject().await?;
                return Ok(JobOutcome::Rejected);
            }
        };

        let result = {
            let mut session = ScrapeSession::new(&self.ctx, job);
            match &task {
                Task::Listing(channel) => session.run_listing(channel).await,
                Task::Replies(channel, message_id) => {
                    session.run_replies(channel, message_id).await
                }
            }
        };

        match result {
            Ok(report) => {
                match report.outcome {
                    SessionOutcome::Completed => {
                        info!("Finished '{}' with {} items", target, report.items)
                    }
                    SessionOutcome::Aborted(AbortReason::ResourcePressure) => {
                        warn!("Stopped '{}' early under memory pressure with {} items", target, report.items)
                    }
                    SessionOutcome::Aborted(AbortReason::NoComments) => {
                        info!("Gave up on '{}': no comments", target)
                    }
                }
                if !job.is_deleted() {
                    job.delete().await?;
                }
                Ok(JobOutcome::Scraped(report))
            }
            Err(e) => {
                error!("Job for '{}' failed: {}", target, e);
                if job.is_deleted() {
                    job.requeue_as_copy().await?;
                }
                if e.is_fatal() {
                    return Err(e);
                }
                if !job.is_deleted() {
                    job.reject().await?;
                }
                Ok(JobOutcome::Rejected)
            }
        }
    }
}
