//! Shared helper functions for CLI commands.

use std::sync::Arc;

use anyhow::Context;
use tracing::warn;

use crate::config::{BackendKind, Settings};
use crate::content::ContentExtractor;
use crate::scrape::{CgroupMemoryPressure, NoPressure, PressureGauge};
use crate::store::{InMemoryStore, SqliteStore, Store};
use crate::work_queue::{InMemoryQueueBackend, QueueBackend, SqliteQueueBackend, WorkQueue};

/// Open the configured store.
pub fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn Store>> {
    match settings.store_backend {
        BackendKind::Sqlite => {
            let store = SqliteStore::new(&settings.store_path).with_context(|| {
                format!("Failed to open store at {}", settings.store_path.display())
            })?;
            Ok(Arc::new(store))
        }
        BackendKind::Memory => {
            warn!("Using an in-memory store; nothing is kept after exit");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Open the configured queue, in test mode when test jobs are set.
pub fn open_queue(settings: &Settings) -> anyhow::Result<WorkQueue> {
    let backend: Arc<dyn QueueBackend> = match settings.queue_backend {
        BackendKind::Sqlite => Arc::new(
            SqliteQueueBackend::new(&settings.queue_path, settings.visibility_timeout)
                .with_context(|| {
                    format!("Failed to open queue at {}", settings.queue_path.display())
                })?
                .with_max_receive_count(settings.max_receive_count),
        ),
        BackendKind::Memory => Arc::new(
            InMemoryQueueBackend::new(settings.visibility_timeout)
                .with_max_receive_count(settings.max_receive_count),
        ),
    };

    let queue = WorkQueue::new(backend).with_poll_settings(settings.poll.clone());
    Ok(match &settings.test_jobs {
        Some(jobs) => queue.with_test_jobs(jobs.clone()),
        None => queue,
    })
}

/// Memory gauge for the worker. Hosts without cgroup v2 accounting get none.
pub fn pressure_gauge(settings: &Settings) -> Box<dyn PressureGauge> {
    if settings.memory_stat_path.exists() {
        Box::new(CgroupMemoryPressure::new(
            &settings.memory_stat_path,
            settings.memory_limit_bytes,
        ))
    } else {
        warn!(
            "{} not found; memory pressure is not watched",
            settings.memory_stat_path.display()
        );
        Box::new(NoPressure)
    }
}

pub fn extractor(settings: &Settings) -> ContentExtractor {
    ContentExtractor::with_service_allow_list(settings.service_allow_list.iter().cloned())
}
