//! Scripted rendering surface shared by the integration tests.
//!
//! The surface plays back a list of bubble windows. Window `i` is what the
//! page shows after `i` scroll steps; scrolling past the last window keeps
//! showing it, as a real list does once it is exhausted.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use chatscrape::scrape::{PressureGauge, ScrapeResult, ScrapeSettings};
use chatscrape::surface::selectors::{
    BUBBLES_INNER, CHANNEL_POST_BUBBLE, CONTENT_BUBBLE, DISCUSSION_VIEW, PERSON_AVATAR, PRELOADER,
    PROFILE_DETAILS, REPLIES_ELEMENT, REPLY_THUMBNAIL, ROW_TITLE,
};
use chatscrape::surface::{
    ElementHandle, RawMarkup, RenderingSurface, ScrollDirection, SurfaceError, SurfaceResult,
};

pub const TAG: &str = "somechan";
pub const PEER: &str = "-1001234567890";
pub const DISCUSSION_PEER: &str = "-1009876543210";

/// Rows of the profile details view; the public link is third to last.
const PROFILE_ROWS: usize = 7;

#[derive(Debug, Clone)]
pub struct Bubble {
    pub mid: String,
    pub markup: String,
    /// Matched by the channel post selector inside a discussion.
    pub channel_post: bool,
    pub saved_from: Option<String>,
    pub y: f64,
    pub stale: bool,
}

impl Bubble {
    /// A channel post, optionally with a comments footer.
    pub fn post(mid: &str, footer: Option<&str>) -> Self {
        let replies = footer
            .map(|text| {
                format!(
                    "<replies-element><span class=\"replies-footer-text\">{}</span></replies-element>",
                    text
                )
            })
            .unwrap_or_default();
        Self {
            mid: mid.to_string(),
            markup: format!(
                "<div class=\"bubble channel-post\" data-mid=\"{}\" data-peer-id=\"{}\"><div class=\"message\">post {}</div>{}</div>",
                mid, PEER, mid, replies
            ),
            channel_post: false,
            saved_from: None,
            y: 100.0,
            stale: false,
        }
    }

    pub fn comment(mid: &str) -> Self {
        Self {
            mid: mid.to_string(),
            markup: format!(
                "<div class=\"bubble\" data-mid=\"{}\" data-peer-id=\"{}\"><div class=\"message\">comment {}</div></div>",
                mid, DISCUSSION_PEER, mid
            ),
            channel_post: false,
            saved_from: None,
            y: 100.0,
            stale: false,
        }
    }

    /// The forwarded channel post heading a discussion.
    pub fn discussion_head(mid: &str, post_message_id: &str) -> Self {
        Self {
            mid: mid.to_string(),
            markup: format!(
                "<div class=\"bubble channel-post\" data-mid=\"{}\" data-peer-id=\"{}\" data-saved-from=\"{}_{}\"><div class=\"message\">post {}</div></div>",
                mid, DISCUSSION_PEER, PEER, post_message_id, post_message_id
            ),
            channel_post: true,
            saved_from: Some(format!("{}_{}", PEER, post_message_id)),
            y: 10.0,
            stale: false,
        }
    }

    pub fn at(mut self, y: f64) -> Self {
        self.y = y;
        self
    }

    pub fn stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Page {
    Blank,
    Channel,
    /// A post opened through its public link.
    Post,
    Discussion,
}

#[derive(Debug)]
struct State {
    page: Page,
    steps: usize,
    navigations: Vec<String>,
    scrolls: Vec<ScrollDirection>,
}

pub struct ScriptedSurface {
    tag: String,
    peer_id: String,
    listing: Vec<Vec<Bubble>>,
    discussion: Vec<Vec<Bubble>>,
    state: Mutex<State>,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self {
            tag: TAG.to_string(),
            peer_id: PEER.to_string(),
            listing: Vec::new(),
            discussion: Vec::new(),
            state: Mutex::new(State {
                page: Page::Blank,
                steps: 0,
                navigations: Vec::new(),
                scrolls: Vec::new(),
            }),
        }
    }

    /// Windows shown on the channel page, starting with the initial view.
    pub fn with_listing(mut self, windows: Vec<Vec<Bubble>>) -> Self {
        self.listing = windows;
        self
    }

    /// Windows shown once the comments of a post are opened.
    pub fn with_discussion(mut self, windows: Vec<Vec<Bubble>>) -> Self {
        self.discussion = windows;
        self
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }

    pub fn scrolls(&self) -> Vec<ScrollDirection> {
        self.state.lock().unwrap().scrolls.clone()
    }

    fn window(&self) -> Vec<Bubble> {
        let state = self.state.lock().unwrap();
        let windows = match state.page {
            Page::Channel => &self.listing,
            Page::Discussion => &self.discussion,
            Page::Blank | Page::Post => return Vec::new(),
        };
        windows
            .get(state.steps.min(windows.len().saturating_sub(1)))
            .cloned()
            .unwrap_or_default()
    }

    fn page(&self) -> Page {
        self.state.lock().unwrap().page
    }

    fn visible_bubble(&self, element: &ElementHandle) -> SurfaceResult<Bubble> {
        let mid = element
            .id()
            .strip_prefix("bubble:")
            .ok_or_else(|| SurfaceError::NoSuchElement(element.id().to_string()))?;
        match self.window().into_iter().find(|b| b.mid == mid) {
            Some(bubble) if !bubble.stale => Ok(bubble),
            _ => Err(SurfaceError::StaleElement(element.id().to_string())),
        }
    }

    fn bubbles(&self, channel_posts_only: bool) -> Vec<ElementHandle> {
        self.window()
            .into_iter()
            .filter(|b| !channel_posts_only || b.channel_post)
            .map(|b| ElementHandle::new(format!("bubble:{}", b.mid)))
            .collect()
    }
}

fn handles(ids: &[&str]) -> Vec<ElementHandle> {
    ids.iter().map(|id| ElementHandle::new(*id)).collect()
}

#[async_trait]
impl RenderingSurface for ScriptedSurface {
    async fn navigate(&self, url: &str) -> SurfaceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.navigations.push(url.to_string());
        state.page = Page::Channel;
        state.steps = 0;
        Ok(())
    }

    async fn open_link(&self, url: &str) -> SurfaceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.navigations.push(url.to_string());
        state.page = Page::Post;
        state.steps = 0;
        Ok(())
    }

    async fn query_all(
        &self,
        scope: Option<&ElementHandle>,
        selector: &str,
    ) -> SurfaceResult<Vec<ElementHandle>> {
        let page = self.page();
        let found = match selector {
            PROFILE_DETAILS if page != Page::Blank => handles(&["profile"]),
            PROFILE_DETAILS => Vec::new(),
            ROW_TITLE => (0..PROFILE_ROWS)
                .map(|i| ElementHandle::new(format!("row:{}", i)))
                .collect(),
            PERSON_AVATAR => handles(&["avatar"]),
            BUBBLES_INNER => handles(&["inner"]),
            PRELOADER | REPLY_THUMBNAIL => Vec::new(),
            CONTENT_BUBBLE => self.bubbles(false),
            CHANNEL_POST_BUBBLE => self.bubbles(true),
            DISCUSSION_VIEW if page == Page::Discussion => handles(&["discussion"]),
            DISCUSSION_VIEW => Vec::new(),
            REPLIES_ELEMENT if scope.map(ElementHandle::id) == Some("post") => handles(&["replies"]),
            s if s.starts_with(".bubble:not(.is-date)[data-peer-id=") => {
                if page == Page::Post {
                    handles(&["post"])
                } else {
                    Vec::new()
                }
            }
            other => {
                return Err(SurfaceError::Protocol(format!(
                    "unscripted selector '{}'",
                    other
                )))
            }
        };
        Ok(found)
    }

    async fn element_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> SurfaceResult<Option<String>> {
        if element.id() == "avatar" {
            return Ok((name == "data-peer-id").then(|| self.peer_id.clone()));
        }
        let bubble = self.visible_bubble(element)?;
        Ok(match name {
            "data-mid" => Some(bubble.mid),
            "data-saved-from" => bubble.saved_from,
            _ => None,
        })
    }

    async fn element_text(&self, element: &ElementHandle) -> SurfaceResult<String> {
        if element.id() == format!("row:{}", PROFILE_ROWS - 3) {
            return Ok(format!("https://t.me/{}", self.tag));
        }
        Ok(String::new())
    }

    async fn element_offset_y(&self, element: &ElementHandle) -> SurfaceResult<f64> {
        Ok(self.visible_bubble(element)?.y)
    }

    async fn scroll_step(
        &self,
        _container: &ElementHandle,
        direction: ScrollDirection,
    ) -> SurfaceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.steps += 1;
        state.scrolls.push(direction);
        Ok(())
    }

    async fn capture_raw_markup(&self, element: &ElementHandle) -> SurfaceResult<RawMarkup> {
        Ok(RawMarkup::from_text(&self.visible_bubble(element)?.markup))
    }

    async fn click(&self, element: &ElementHandle) -> SurfaceResult<()> {
        if element.id() != "replies" {
            return Err(SurfaceError::NoSuchElement(element.id().to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.page = Page::Discussion;
        state.steps = 0;
        Ok(())
    }
}

/// Gauge that can be flipped from the test.
#[derive(Clone, Default)]
pub struct SwitchGauge(pub Arc<AtomicBool>);

impl SwitchGauge {
    pub fn high() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

#[async_trait]
impl PressureGauge for SwitchGauge {
    async fn is_high(&self) -> ScrapeResult<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

/// Settings for scripted runs: no waiting, short staleness.
pub fn quick_settings() -> ScrapeSettings {
    ScrapeSettings {
        staleness_bound: 1,
        anchor_max_attempts: 10,
        discussion_wait_polls: 3,
        ..ScrapeSettings::immediate()
    }
}

pub fn listing_windows() -> Vec<Vec<Bubble>> {
    vec![
        vec![],
        vec![
            Bubble::post("40", None),
            Bubble::post("41", Some("12 Comments")),
            Bubble::post("42", Some("812 Comments")),
        ],
        vec![
            Bubble::post("38", None),
            Bubble::post("39", None).stale(),
            Bubble::post("40", None),
        ],
        vec![
            Bubble::post("37", None),
            Bubble::post("38", None),
            Bubble::post("39", None),
        ],
    ]
}

/// Comments 201 to 205 of post 42, headed by the forwarded post 100.
pub fn discussion_windows() -> Vec<Vec<Bubble>> {
    vec![
        vec![Bubble::comment("201"), Bubble::comment("202")],
        vec![Bubble::discussion_head("100", "42"), Bubble::comment("201")],
        vec![
            Bubble::discussion_head("100", "42").at(20.0),
            Bubble::comment("201"),
            Bubble::comment("202"),
        ],
        vec![
            Bubble::discussion_head("100", "42").at(-200.0),
            Bubble::comment("201"),
            Bubble::comment("202"),
            Bubble::comment("203"),
        ],
        vec![
            Bubble::comment("202"),
            Bubble::comment("203"),
            Bubble::comment("204"),
        ],
        vec![Bubble::comment("204"), Bubble::comment("205")],
    ]
}
