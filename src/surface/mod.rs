//! Rendering surface capability.
//!
//! The scraper never talks to a browser directly. It drives whatever
//! implements [`RenderingSurface`]: a DevTools browser tab in production, a
//! scripted double in tests.

mod raw;
pub mod selectors;
#[cfg(feature = "browser")]
mod chromium;

pub use raw::{digest_bytes, RawMarkup, DIGEST_PREFIX};
#[cfg(feature = "browser")]
pub use chromium::ChromiumSurface;

use async_trait::async_trait;
use thiserror::Error;

/// Opaque reference to an element owned by the surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    /// Towards older items (page up).
    Up,
    /// Towards newer items (page down).
    Down,
}

/// Errors raised by a rendering surface.
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// The element was detached from the document between lookup and use.
    #[error("stale element reference: {0}")]
    StaleElement(String),

    #[error("no such element: {0}")]
    NoSuchElement(String),

    #[error("code point {0:#x} is outside the Unicode range")]
    InvalidCodePoint(u32),

    #[error("surface protocol error: {0}")]
    Protocol(String),

    #[cfg(feature = "browser")]
    #[error("browser error: {0}")]
    Browser(#[from] chromiumoxide::error::CdpError),

    #[cfg(feature = "browser")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SurfaceError {
    /// Whether the failure only affects the current pass and may succeed on a
    /// later iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, SurfaceError::StaleElement(_))
    }
}

pub type SurfaceResult<T> = Result<T, SurfaceError>;

/// Minimal set of browser operations the scraper consumes.
///
/// Selectors are CSS selectors. A `scope` restricts a query to the subtree of
/// the given element.
#[async_trait]
pub trait RenderingSurface: Send + Sync {
    async fn navigate(&self, url: &str) -> SurfaceResult<()>;

    /// Follow an in-app link without a full page load. Surfaces that cannot
    /// do better fall back to plain navigation.
    async fn open_link(&self, url: &str) -> SurfaceResult<()> {
        self.navigate(url).await
    }

    async fn query_all(
        &self,
        scope: Option<&ElementHandle>,
        selector: &str,
    ) -> SurfaceResult<Vec<ElementHandle>>;

    async fn element_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> SurfaceResult<Option<String>>;

    /// The element's `textContent`.
    async fn element_text(&self, element: &ElementHandle) -> SurfaceResult<String>;

    /// Vertical offset of the element relative to the viewport. Negative
    /// values are above the visible area.
    async fn element_offset_y(&self, element: &ElementHandle) -> SurfaceResult<f64>;

    /// Advance the scrollable container that holds `container` by one page.
    async fn scroll_step(
        &self,
        container: &ElementHandle,
        direction: ScrollDirection,
    ) -> SurfaceResult<()>;

    /// Capture the element's outer markup without lossy re-encoding.
    async fn capture_raw_markup(&self, element: &ElementHandle) -> SurfaceResult<RawMarkup>;

    async fn click(&self, element: &ElementHandle) -> SurfaceResult<()>;
}
