//! Bounded waits for lazily loaded bubble content.

use std::time::Duration;

use tracing::{debug, info};

use super::ScrapeResult;
use crate::surface::selectors::{PRELOADER, REPLY_THUMBNAIL};
use crate::surface::{ElementHandle, RenderingSurface, SurfaceError};

/// Poll budgets for one class of loading indicator.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorBudget {
    /// Every this many polls, give up if all indicators are above the viewport.
    pub check_above_every: u32,
    /// Give up unconditionally after this many polls.
    pub max_polls: u32,
}

#[derive(Debug, Clone)]
pub struct LoadingSettings {
    pub poll_interval: Duration,
    pub preloaders: IndicatorBudget,
    pub thumbnails: IndicatorBudget,
}

impl Default for LoadingSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            preloaders: IndicatorBudget {
                check_above_every: 20,
                max_polls: 60,
            },
            thumbnails: IndicatorBudget {
                check_above_every: 10,
                max_polls: 60,
            },
        }
    }
}

/// Which bubbles to leave out of this pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipPolicy {
    pub stuck_preloaders: bool,
    pub unloaded_thumbnails: bool,
}

impl SkipPolicy {
    pub fn skips_anything(&self) -> bool {
        self.stuck_preloaders || self.unloaded_thumbnails
    }

    /// Whether `bubble` still shows an indicator this policy gave up on.
    pub async fn should_skip(
        &self,
        surface: &dyn RenderingSurface,
        bubble: &ElementHandle,
    ) -> ScrapeResult<bool> {
        if self.unloaded_thumbnails
            && !surface.query_all(Some(bubble), REPLY_THUMBNAIL).await?.is_empty()
        {
            return Ok(true);
        }
        if self.stuck_preloaders && !surface.query_all(Some(bubble), PRELOADER).await?.is_empty() {
            return Ok(true);
        }
        Ok(false)
    }
}

/// Wait for preloaders, then reply thumbnails, to disappear. Indicators that
/// outlast their budget are skipped instead of waited for.
pub async fn wait_for_loading(
    surface: &dyn RenderingSurface,
    settings: &LoadingSettings,
) -> ScrapeResult<SkipPolicy> {
    let stuck_preloaders =
        wait_for_indicator(surface, PRELOADER, settings.preloaders, settings.poll_interval).await?;
    let unloaded_thumbnails =
        wait_for_indicator(surface, REPLY_THUMBNAIL, settings.thumbnails, settings.poll_interval)
            .await?;
    let policy = SkipPolicy {
        stuck_preloaders,
        unloaded_thumbnails,
    };
    if policy.skips_anything() {
        info!("Skipping partially loaded bubbles this pass: {:?}", policy);
    }
    Ok(policy)
}

/// Returns whether bubbles with this indicator should be skipped.
async fn wait_for_indicator(
    surface: &dyn RenderingSurface,
    selector: &str,
    budget: IndicatorBudget,
    poll_interval: Duration,
) -> ScrapeResult<bool> {
    let mut polls = 0;
    loop {
        let indicators = surface.query_all(None, selector).await?;
        if indicators.is_empty() {
            return Ok(false);
        }
        polls += 1;
        if budget.check_above_every > 0
            && polls % budget.check_above_every == 0
            && all_above_viewport(surface, &indicators).await?
        {
            debug!("'{}' indicators are all above the viewport after {} polls", selector, polls);
            return Ok(true);
        }
        if polls > budget.max_polls {
            debug!("'{}' indicators stuck for {} polls", selector, polls);
            return Ok(true);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn all_above_viewport(
    surface: &dyn RenderingSurface,
    elements: &[ElementHandle],
) -> ScrapeResult<bool> {
    for element in elements {
        match surface.element_offset_y(element).await {
            Ok(y) if y < 0.0 => {}
            Ok(_) => return Ok(false),
            // Gone since the query; it no longer blocks anything but we
            // cannot tell where it was.
            Err(SurfaceError::StaleElement(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{RawMarkup, ScrollDirection, SurfaceResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Shows a preloader for the first `preloader_polls` queries.
    struct Indicators {
        preloader_queries: AtomicU32,
        preloader_polls: u32,
        preloader_y: f64,
        thumbnail_y: Option<f64>,
    }

    #[async_trait]
    impl RenderingSurface for Indicators {
        async fn navigate(&self, _url: &str) -> SurfaceResult<()> {
            Ok(())
        }

        async fn query_all(
            &self,
            _scope: Option<&ElementHandle>,
            selector: &str,
        ) -> SurfaceResult<Vec<ElementHandle>> {
            if selector == PRELOADER {
                let seen = self.preloader_queries.fetch_add(1, Ordering::SeqCst);
                if seen < self.preloader_polls {
                    return Ok(vec![ElementHandle::new("preloader")]);
                }
                return Ok(vec![]);
            }
            Ok(self
                .thumbnail_y
                .map(|_| vec![ElementHandle::new("thumbnail")])
                .unwrap_or_default())
        }

        async fn element_attribute(
            &self,
            _element: &ElementHandle,
            _name: &str,
        ) -> SurfaceResult<Option<String>> {
            Ok(None)
        }

        async fn element_text(&self, _element: &ElementHandle) -> SurfaceResult<String> {
            Ok(String::new())
        }

        async fn element_offset_y(&self, element: &ElementHandle) -> SurfaceResult<f64> {
            if element.id() == "preloader" {
                Ok(self.preloader_y)
            } else {
                Ok(self.thumbnail_y.unwrap_or_default())
            }
        }

        async fn scroll_step(
            &self,
            _container: &ElementHandle,
            _direction: ScrollDirection,
        ) -> SurfaceResult<()> {
            Ok(())
        }

        async fn capture_raw_markup(&self, _element: &ElementHandle) -> SurfaceResult<RawMarkup> {
            Ok(RawMarkup::from_text(""))
        }

        async fn click(&self, _element: &ElementHandle) -> SurfaceResult<()> {
            Ok(())
        }
    }

    fn settings() -> LoadingSettings {
        LoadingSettings {
            poll_interval: Duration::ZERO,
            ..LoadingSettings::default()
        }
    }

    #[tokio::test]
    async fn test_waits_until_indicators_clear() {
        let surface = Indicators {
            preloader_queries: AtomicU32::new(0),
            preloader_polls: 5,
            preloader_y: 100.0,
            thumbnail_y: None,
        };
        let policy = wait_for_loading(&surface, &settings()).await.unwrap();
        assert_eq!(policy, SkipPolicy::default());
        assert_eq!(surface.preloader_queries.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_indicators_above_viewport_are_skipped_early() {
        let surface = Indicators {
            preloader_queries: AtomicU32::new(0),
            preloader_polls: u32::MAX,
            preloader_y: -50.0,
            thumbnail_y: Some(-10.0),
        };
        let policy = wait_for_loading(&surface, &settings()).await.unwrap();
        assert!(policy.stuck_preloaders);
        assert!(policy.unloaded_thumbnails);
        assert_eq!(surface.preloader_queries.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_visible_indicators_are_skipped_after_budget() {
        let surface = Indicators {
            preloader_queries: AtomicU32::new(0),
            preloader_polls: u32::MAX,
            preloader_y: 300.0,
            thumbnail_y: None,
        };
        let policy = wait_for_loading(&surface, &settings()).await.unwrap();
        assert!(policy.stuck_preloaders);
        assert!(!policy.unloaded_thumbnails);
        assert_eq!(surface.preloader_queries.load(Ordering::SeqCst), 61);
    }
}
