//! The scrape session state machine.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{
    flush_listing, flush_replies, load_channel, scroll, wait_for_loading, ListingState,
    MergeState, PressureGauge, ScrapeError, ScrapeResult, ScrapeSettings, SkipPolicy,
    WindowEntry,
};
use crate::channel::{ChannelDirectory, ChannelRef, NumericId, TagHandle};
use crate::store::Store;
use crate::surface::selectors::{
    post_bubble, CHANNEL_POST_BUBBLE, CONTENT_BUBBLE, DISCUSSION_VIEW, REPLIES_ELEMENT,
};
use crate::surface::{ElementHandle, RenderingSurface, ScrollDirection, SurfaceError};
use crate::work_queue::Job;

/// Poll budgets for the linked post to show up. The link is opened again
/// before each budget.
const POST_WAIT_BUDGETS: [u32; 3] = [10, 20, 60];

/// Listing passes between progress lines.
const LISTING_PROGRESS_EVERY: u64 = 100;

/// Reply passes between progress lines.
const REPLIES_PROGRESS_EVERY: u64 = 10;

/// Everything a session needs, shared by all sessions of a worker.
pub struct ScrapeContext {
    pub surface: Arc<dyn RenderingSurface>,
    pub store: Arc<dyn Store>,
    pub directory: ChannelDirectory,
    pub pressure: Box<dyn PressureGauge>,
    pub settings: ScrapeSettings,
}

impl ScrapeContext {
    pub fn new(
        surface: Arc<dyn RenderingSurface>,
        store: Arc<dyn Store>,
        pressure: Box<dyn PressureGauge>,
        settings: ScrapeSettings,
    ) -> Self {
        Self {
            surface,
            directory: ChannelDirectory::new(store.clone()),
            store,
            pressure,
            settings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ResourcePressure,
    NoComments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    /// Looking for the channel post at the top of a discussion.
    Anchoring,
    Merging,
    Completed,
    Aborted(AbortReason),
    Failed,
}

/// How a session that did not fail ended. Both outcomes flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Distinct items collected.
    pub items: usize,
    pub passes: u64,
}

/// One job's worth of scrolling and merging.
pub struct ScrapeSession<'a> {
    ctx: &'a ScrapeContext,
    job: &'a mut Job,
    state: SessionState,
}

impl<'a> ScrapeSession<'a> {
    pub fn new(ctx: &'a ScrapeContext, job: &'a mut Job) -> Self {
        Self {
            ctx,
            job,
            state: SessionState::Initializing,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Collect every post of a channel, scrolling towards older posts.
    pub async fn run_listing(&mut self, channel: &ChannelRef) -> ScrapeResult<SessionReport> {
        let result = self.listing(channel).await;
        self.settle(result)
    }

    /// Collect the comments of one channel post in order.
    pub async fn run_replies(
        &mut self,
        channel: &ChannelRef,
        message_id: &str,
    ) -> ScrapeResult<SessionReport> {
        let result = self.replies(channel, message_id).await;
        self.settle(result)
    }

    fn settle(&mut self, result: ScrapeResult<SessionReport>) -> ScrapeResult<SessionReport> {
        self.state = match &result {
            Ok(report) => match report.outcome {
                SessionOutcome::Completed => SessionState::Completed,
                SessionOutcome::Aborted(reason) => SessionState::Aborted(reason),
            },
            Err(_) => SessionState::Failed,
        };
        result
    }

    async fn listing(&mut self, channel: &ChannelRef) -> ScrapeResult<SessionReport> {
        let ctx = self.ctx;
        let surface = &*ctx.surface;
        let settings = &ctx.settings;

        let reference = load_channel(surface, &ctx.directory, channel, settings).await?;
        let (tag, _) = reference.pair()?;

        self.state = SessionState::Merging;
        let mut listing = ListingState::new();
        let mut passes: u64 = 0;
        let outcome = loop {
            passes += 1;
            if passes % LISTING_PROGRESS_EVERY == 0 {
                info!(
                    "'{}': {} posts ({} captures) after {} passes",
                    tag,
                    listing.item_count(),
                    listing.capture_count(),
                    passes
                );
            }

            scroll(surface, None, ScrollDirection::Up, settings).await?;
            let skip = wait_for_loading(surface, &settings.loading).await?;
            let window = capture_window(surface, None, &skip).await?;
            let discovered = listing.observe_window(window.into_iter().filter_map(|entry| {
                match entry {
                    WindowEntry::Captured { message_id, markup } => Some((message_id, markup)),
                    WindowEntry::Skipped { .. } => None,
                }
            }));
            debug!("Pass {}: {} new posts", passes, discovered);

            if self.ctx.pressure.is_high().await? {
                warn!("Memory pressure is high, stopping '{}' early", tag);
                break SessionOutcome::Aborted(AbortReason::ResourcePressure);
            }
            if listing.staleness() > settings.staleness_bound {
                break SessionOutcome::Completed;
            }
            if settings.no_comments_range.contains(&listing.item_count())
                && !listing.mentions_replies()
            {
                info!(
                    "'{}' shows no comments after {} posts, giving up",
                    tag,
                    listing.item_count()
                );
                break SessionOutcome::Aborted(AbortReason::NoComments);
            }
            self.renew_lease().await?;
        };

        flush_listing(&*ctx.store, tag, &listing, Utc::now()).await?;
        Ok(SessionReport {
            outcome,
            items: listing.item_count(),
            passes,
        })
    }

    async fn replies(&mut self, channel: &ChannelRef, message_id: &str) -> ScrapeResult<SessionReport> {
        let ctx = self.ctx;
        let surface = &*ctx.surface;
        let settings = &ctx.settings;

        let reference = load_channel(surface, &ctx.directory, channel, settings).await?;
        let (tag, numeric_id) = reference.pair()?;

        let view = self
            .open_discussion(tag, numeric_id, message_id)
            .await?;

        self.state = SessionState::Anchoring;
        let mut thread = self.anchor(&view, numeric_id, message_id).await?;

        self.state = SessionState::Merging;
        let mut passes: u64 = 0;
        let outcome = loop {
            passes += 1;
            if passes % REPLIES_PROGRESS_EVERY == 0 {
                info!(
                    "'{}' post {}: {} comments after {} passes",
                    tag,
                    message_id,
                    thread.len(),
                    passes
                );
            }

            scroll(surface, Some(&view), ScrollDirection::Down, settings).await?;
            let skip = wait_for_loading(surface, &settings.loading).await?;
            let window = capture_window(surface, Some(&view), &skip).await?;
            let merged = thread.merge_window(window)?;
            let run_reaches_end = merged.run_reaches_end;
            if merged.tail_assumed_ahead {
                debug!("Tail of '{}' post {} is further down", tag, message_id);
            }

            if self.ctx.pressure.is_high().await? {
                warn!("Memory pressure is high, stopping '{}' post {} early", tag, message_id);
                break SessionOutcome::Aborted(AbortReason::ResourcePressure);
            }
            if thread.staleness() > settings.staleness_bound {
                if !run_reaches_end {
                    return Err(ScrapeError::NotAtEnd);
                }
                break SessionOutcome::Completed;
            }
            self.renew_lease().await?;
        };

        flush_replies(&*ctx.store, tag, message_id, &thread, Utc::now()).await?;
        Ok(SessionReport {
            outcome,
            items: thread.len(),
            passes,
        })
    }

    /// Delete the job early once its lease gets close to expiring.
    async fn renew_lease(&mut self) -> ScrapeResult<()> {
        if self.job.is_deleted() || self.job.lease_age() < self.ctx.settings.lease_margin {
            return Ok(());
        }
        info!(
            "Lease on '{}' is {:?} old, deleting the job ahead of time",
            self.job.target(),
            self.job.lease_age()
        );
        self.job.delete().await?;
        Ok(())
    }

    /// Open the post through its public link and click into its comments.
    async fn open_discussion(
        &self,
        tag: &TagHandle,
        numeric_id: &NumericId,
        message_id: &str,
    ) -> ScrapeResult<ElementHandle> {
        let surface = &*self.ctx.surface;
        let settings = &self.ctx.settings;
        let link = format!("https://t.me/{}/{}", tag, message_id);
        let selector = post_bubble(numeric_id.as_str(), message_id);

        let mut post = None;
        'budgets: for budget in POST_WAIT_BUDGETS {
            surface.open_link(&link).await?;
            for _ in 0..budget {
                let mut bubbles = surface.query_all(None, &selector).await?;
                if bubbles.len() > 1 {
                    return Err(ScrapeError::Structure(format!(
                        "expected a single bubble for '{}' post {}, found {}",
                        tag,
                        message_id,
                        bubbles.len()
                    )));
                }
                if let Some(bubble) = bubbles.pop() {
                    post = Some(bubble);
                    break 'budgets;
                }
                tokio::time::sleep(settings.poll_interval).await;
            }
            debug!("Post {} of '{}' not shown after {} polls", message_id, tag, budget);
        }
        let post = post.ok_or_else(|| {
            ScrapeError::Timeout(format!("post {} of '{}' never showed up", message_id, tag))
        })?;

        let replies = surface.query_all(Some(&post), REPLIES_ELEMENT).await?;
        let [replies] = replies.as_slice() else {
            return Err(ScrapeError::Structure(format!(
                "expected a single '{}' in post {}, found {}",
                REPLIES_ELEMENT,
                message_id,
                replies.len()
            )));
        };
        surface.click(replies).await?;

        let mut views = Vec::new();
        for _ in 0..settings.discussion_wait_polls {
            views = surface.query_all(None, DISCUSSION_VIEW).await?;
            if !views.is_empty() {
                break;
            }
            tokio::time::sleep(settings.poll_interval).await;
        }
        let view = match views.len() {
            1 => views.remove(0),
            found => {
                return Err(ScrapeError::Structure(format!(
                    "expected a single discussion view, found {}",
                    found
                )))
            }
        };
        tokio::time::sleep(settings.settle_delay).await;
        Ok(view)
    }

    /// Scroll up until the channel post heading the discussion is in view,
    /// and seed the order with it.
    async fn anchor(
        &self,
        view: &ElementHandle,
        numeric_id: &NumericId,
        message_id: &str,
    ) -> ScrapeResult<MergeState> {
        let surface = &*self.ctx.surface;
        let settings = &self.ctx.settings;

        let mut attempts = 0;
        loop {
            attempts += 1;
            if attempts > settings.anchor_max_attempts {
                return Err(ScrapeError::Timeout(format!(
                    "channel post {} not found at the top of its discussion",
                    message_id
                )));
            }
            if let Some(post) = single_channel_post(surface, view).await? {
                match surface.element_offset_y(&post).await {
                    Ok(y) if y > 0.0 => break,
                    Ok(_) | Err(SurfaceError::StaleElement(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            scroll(surface, Some(view), ScrollDirection::Up, settings).await?;
        }
        debug!("Found channel post {} after {} attempts", message_id, attempts);

        // Once more, so the top of the discussion has loaded too.
        scroll(surface, Some(view), ScrollDirection::Up, settings).await?;
        let post = single_channel_post(surface, view).await?.ok_or_else(|| {
            ScrapeError::Structure("channel post left the discussion view".to_string())
        })?;

        let expected = format!("{}_{}", numeric_id, message_id);
        let saved_from = surface.element_attribute(&post, "data-saved-from").await?;
        if saved_from.as_deref() != Some(expected.as_str()) {
            return Err(ScrapeError::Structure(format!(
                "discussion is for {:?}, expected '{}'",
                saved_from, expected
            )));
        }

        let anchor_id = surface
            .element_attribute(&post, "data-mid")
            .await?
            .ok_or_else(|| ScrapeError::Structure("channel post without 'data-mid'".to_string()))?;
        let markup = surface.capture_raw_markup(&post).await?;
        Ok(MergeState::seeded(anchor_id, markup))
    }
}

async fn single_channel_post(
    surface: &dyn RenderingSurface,
    view: &ElementHandle,
) -> ScrapeResult<Option<ElementHandle>> {
    let mut posts = surface.query_all(Some(view), CHANNEL_POST_BUBBLE).await?;
    if posts.len() > 1 {
        return Err(ScrapeError::Structure(format!(
            "expected at most 1 channel post in a discussion, found {}",
            posts.len()
        )));
    }
    Ok(posts.pop())
}

/// Capture the visible bubbles in list order. Bubbles that went stale or are
/// still loading become skipped entries.
pub(crate) async fn capture_window(
    surface: &dyn RenderingSurface,
    scope: Option<&ElementHandle>,
    skip: &SkipPolicy,
) -> ScrapeResult<Vec<WindowEntry>> {
    let bubbles = surface.query_all(scope, CONTENT_BUBBLE).await?;
    let mut window = Vec::with_capacity(bubbles.len());
    for bubble in &bubbles {
        let message_id = match surface.element_attribute(bubble, "data-mid").await {
            Ok(Some(message_id)) => message_id,
            Ok(None) => {
                return Err(ScrapeError::Structure(
                    "bubble without 'data-mid'".to_string(),
                ))
            }
            Err(SurfaceError::StaleElement(_)) => {
                window.push(WindowEntry::Skipped { message_id: None });
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match skip.should_skip(surface, bubble).await {
            Ok(false) => {}
            Ok(true) | Err(ScrapeError::Surface(SurfaceError::StaleElement(_))) => {
                window.push(WindowEntry::Skipped {
                    message_id: Some(message_id),
                });
                continue;
            }
            Err(e) => return Err(e),
        }

        match surface.capture_raw_markup(bubble).await {
            Ok(markup) => window.push(WindowEntry::Captured { message_id, markup }),
            Err(SurfaceError::StaleElement(_)) => window.push(WindowEntry::Skipped {
                message_id: Some(message_id),
            }),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(window)
}
