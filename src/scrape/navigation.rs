//! Channel navigation and scrolling.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::{ScrapeError, ScrapeResult, ScrapeSettings};
use crate::channel::{
    ChannelDirectory, ChannelError, ChannelRef, ChannelReference, NumericId, TagHandle,
};
use crate::surface::selectors::{BUBBLES_INNER, PERSON_AVATAR, PROFILE_DETAILS, ROW_TITLE};
use crate::surface::{ElementHandle, RenderingSurface, ScrollDirection, SurfaceError};

/// Polls for the bubble container to appear before scrolling gives up.
const CONTAINER_WAIT_POLLS: u32 = 60;

/// Number of rows the profile detail view normally has.
const EXPECTED_PROFILE_ROWS: usize = 7;

/// Open the channel page for `channel` and resolve its full identity.
///
/// A numeric id must already be mapped in the store, since only tag handles
/// can be navigated to. When the job named a tag, the numeric id is read
/// from the page and the mapping is stored.
pub async fn load_channel(
    surface: &dyn RenderingSurface,
    directory: &ChannelDirectory,
    channel: &ChannelRef,
    settings: &ScrapeSettings,
) -> ScrapeResult<ChannelReference> {
    let mut reference = directory.reference(channel).await;
    if reference.tag_handle().is_none() {
        directory.complete(&mut reference).await?;
    }
    let tag = reference
        .tag_handle()
        .cloned()
        .ok_or(ChannelError::Incomplete)?;

    let url = format!("{}#@{}", settings.base_url, tag);
    surface.navigate(&url).await?;

    let started = Instant::now();
    loop {
        if profile_shows(surface, &tag).await? {
            break;
        }
        if started.elapsed() >= settings.navigation_timeout {
            return Err(ScrapeError::Timeout(format!(
                "profile of '{}' did not load within {:?}",
                tag, settings.navigation_timeout
            )));
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
    info!(
        "Waited {:.1} seconds for the tag handle to be '{}'",
        started.elapsed().as_secs_f64(),
        tag
    );
    tokio::time::sleep(settings.settle_delay).await;

    if !reference.is_complete() {
        let numeric_id = page_numeric_id(surface).await?;
        reference.observe_numeric_id(numeric_id)?;
        directory.store(&mut reference).await?;
    }
    Ok(reference)
}

/// Whether the profile detail view currently shows `tag`'s public link.
async fn profile_shows(surface: &dyn RenderingSurface, tag: &TagHandle) -> ScrapeResult<bool> {
    let containers = surface.query_all(None, PROFILE_DETAILS).await?;
    let container = match containers.as_slice() {
        // Nothing selected yet.
        [] => return Ok(false),
        [container] => container,
        _ => {
            return Err(ScrapeError::Structure(format!(
                "expected at most 1 profile details container, found {}",
                containers.len()
            )))
        }
    };

    let rows = match surface.query_all(Some(container), ROW_TITLE).await {
        Ok(rows) => rows,
        Err(SurfaceError::StaleElement(_)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if rows.len() < 3 {
        return Err(ScrapeError::Structure(format!(
            "expected {} rows in the profile details view, found {}",
            EXPECTED_PROFILE_ROWS,
            rows.len()
        )));
    }
    if rows.len() != EXPECTED_PROFILE_ROWS {
        warn!(
            "Expected {} rows in the profile details view, found {}; reading the link from the third to last",
            EXPECTED_PROFILE_ROWS,
            rows.len()
        );
    }

    let text = match surface.element_text(&rows[rows.len() - 3]).await {
        Ok(text) => text,
        Err(SurfaceError::StaleElement(_)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if text == tag.profile_url() {
        return Ok(true);
    }
    if text.starts_with("https://t.me/") {
        debug!("Waiting for '{}', profile still shows '{}'", tag, text);
    } else {
        debug!("Profile link row reads '{}'", text);
    }
    Ok(false)
}

async fn page_numeric_id(surface: &dyn RenderingSurface) -> ScrapeResult<NumericId> {
    let avatars = surface.query_all(None, PERSON_AVATAR).await?;
    let [avatar] = avatars.as_slice() else {
        return Err(ScrapeError::Structure(format!(
            "expected a single '{}' element, found {}",
            PERSON_AVATAR,
            avatars.len()
        )));
    };
    let peer_id = surface
        .element_attribute(avatar, "data-peer-id")
        .await?
        .ok_or_else(|| ScrapeError::Structure("avatar without 'data-peer-id'".to_string()))?;
    Ok(NumericId::new(&peer_id)?)
}

/// Scroll the bubble list (inside `view`, if given) by one page and pause.
pub async fn scroll(
    surface: &dyn RenderingSurface,
    view: Option<&ElementHandle>,
    direction: ScrollDirection,
    settings: &ScrapeSettings,
) -> ScrapeResult<()> {
    let mut polls = 0;
    let container = loop {
        let mut containers = surface.query_all(view, BUBBLES_INNER).await?;
        if containers.len() > 1 {
            return Err(ScrapeError::Structure(format!(
                "expected at most 1 '{}' element, found {}",
                BUBBLES_INNER,
                containers.len()
            )));
        }
        if let Some(container) = containers.pop() {
            break container;
        }
        polls += 1;
        if polls > CONTAINER_WAIT_POLLS {
            return Err(ScrapeError::Timeout(format!(
                "no '{}' element showed up",
                BUBBLES_INNER
            )));
        }
        tokio::time::sleep(settings.poll_interval).await;
    };
    surface.scroll_step(&container, direction).await?;
    tokio::time::sleep(settings.scroll_delay).await;
    Ok(())
}
