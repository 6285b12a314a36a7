//! Incremental scroll-and-merge scraping.
//!
//! A session drives a [`RenderingSurface`](crate::surface::RenderingSurface)
//! through one job: load the channel, scroll the virtualized list page by
//! page, capture the visible window each time and fold it into session
//! state, then flush that state to the store once.

mod flush;
mod listing;
mod loading;
mod merge;
mod navigation;
mod pressure;
mod session;
mod worker;

pub use flush::{
    decode_comment_thread, flush_listing, flush_replies, post_key, CommentRecord,
    OUTER_HTML_BY_HASH, SCRAPED_COMMENTS,
};
pub use listing::ListingState;
pub use loading::{wait_for_loading, IndicatorBudget, LoadingSettings, SkipPolicy};
pub use merge::{MergeOutcome, MergeState, WindowEntry};
pub use navigation::{load_channel, scroll};
pub use pressure::{CgroupMemoryPressure, NoPressure, PressureGauge};
pub use session::{
    AbortReason, ScrapeContext, ScrapeSession, SessionOutcome, SessionReport, SessionState,
};
pub use worker::{JobOutcome, Worker, WorkerSummary};

use std::ops::Range;
use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::store::StoreError;
use crate::surface::SurfaceError;
use crate::work_queue::WorkQueueError;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Invalid job target: {0}")]
    InvalidTarget(String),

    #[error("Lost track of the latest scraped item '{tail}' (window run: {run:?})")]
    LostTrack { tail: String, run: Vec<String> },

    #[error("Item '{0}' appears at multiple points in the order of items")]
    DuplicateOrder(String),

    #[error("The order between found items is inconsistent at '{0}'")]
    InconsistentOrder(String),

    #[error("Scrolling stopped finding items before reaching the end of the list")]
    NotAtEnd,

    #[error("Unexpected page structure: {0}")]
    Structure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Flushed state does not match the session state: {0}")]
    FlushMismatch(String),

    #[error("Cannot read memory pressure: {0}")]
    Pressure(String),

    #[error(transparent)]
    Surface(#[from] SurfaceError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] WorkQueueError),
}

impl ScrapeError {
    /// Whether the error should stop the worker. Malformed job targets and
    /// transient surface hiccups only affect the job at hand.
    pub fn is_fatal(&self) -> bool {
        match self {
            ScrapeError::InvalidTarget(_) => false,
            ScrapeError::Surface(e) => !e.is_transient(),
            _ => true,
        }
    }
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// Tunables of a scrape session.
#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    /// App URL; channels load at `{base_url}#@{tag}`.
    pub base_url: String,
    /// Consecutive passes without a new item before the list counts as exhausted.
    pub staleness_bound: u32,
    /// Listing sizes at which a channel without any replies marker is given up on.
    pub no_comments_range: Range<usize>,
    /// Lease age after which the job is deleted early.
    pub lease_margin: Duration,
    /// Scroll attempts allowed while looking for the discussion's channel post.
    pub anchor_max_attempts: u32,
    /// Polls allowed for the discussion view to appear after opening it.
    pub discussion_wait_polls: u32,
    /// Pause after every scroll step.
    pub scroll_delay: Duration,
    /// Interval of every bounded wait.
    pub poll_interval: Duration,
    /// Upper bound for a channel page to show the expected profile.
    pub navigation_timeout: Duration,
    /// Pause after a view has loaded, before it is used.
    pub settle_delay: Duration,
    pub loading: LoadingSettings,
    /// Targets that are deleted without being scraped.
    pub skip_targets: Vec<String>,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://web.telegram.org/k/".to_string(),
            staleness_bound: 30,
            no_comments_range: 30..100,
            lease_margin: Duration::from_secs(11 * 60 * 60),
            anchor_max_attempts: 600,
            discussion_wait_polls: 30,
            scroll_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            navigation_timeout: Duration::from_secs(300),
            settle_delay: Duration::from_secs(5),
            loading: LoadingSettings::default(),
            skip_targets: Vec::new(),
        }
    }
}

impl ScrapeSettings {
    /// Settings with every wait shortened to nothing, for scripted surfaces.
    pub fn immediate() -> Self {
        Self {
            scroll_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
            navigation_timeout: Duration::ZERO,
            settle_delay: Duration::ZERO,
            loading: LoadingSettings {
                poll_interval: Duration::ZERO,
                ..LoadingSettings::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!ScrapeError::InvalidTarget("x".into()).is_fatal());
        assert!(!ScrapeError::Surface(SurfaceError::StaleElement("e".into())).is_fatal());
        assert!(ScrapeError::Surface(SurfaceError::Protocol("boom".into())).is_fatal());
        assert!(ScrapeError::LostTrack {
            tail: "5".into(),
            run: vec![]
        }
        .is_fatal());
        assert!(ScrapeError::NotAtEnd.is_fatal());
    }
}
