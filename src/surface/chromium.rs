//! Chrome DevTools surface implementing [`RenderingSurface`].
//!
//! Attaches to a running browser whose profile is already logged in and
//! drives a fresh tab in it. Element reads go through small functions called
//! on the element itself; they return `null` once the element has left the
//! document, which surfaces as a stale element.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::handler::HandlerConfig;
use chromiumoxide::{Browser, Element, Page};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ElementHandle, RawMarkup, RenderingSurface, ScrollDirection, SurfaceError, SurfaceResult};

/// Code points of the element's `outerHTML`, so lone surrogates survive the
/// JSON transport.
const OUTER_HTML: &str = "return Array.from(this.outerHTML, c => c.codePointAt(0));";

const TEXT_CONTENT: &str = "return Array.from(this.textContent || '', c => c.codePointAt(0));";

const OFFSET_Y: &str = "return this.getBoundingClientRect().y;";

const IS_CONNECTED: &str = "return true;";

/// A tab in a browser reached over the DevTools protocol.
pub struct ChromiumSurface {
    browser: Mutex<Browser>,
    page: Page,
    handler: JoinHandle<()>,
    elements: Mutex<HashMap<String, Arc<Element>>>,
    next_id: AtomicU64,
}

impl ChromiumSurface {
    /// Connect to the browser at `endpoint` and open a tab.
    ///
    /// `endpoint` is either the DevTools websocket URL or the HTTP address of
    /// the remote debugging port, e.g. `http://127.0.0.1:9222`.
    pub async fn connect(endpoint: &str, timeout: Duration) -> SurfaceResult<Self> {
        let ws_url = match version_url(endpoint) {
            Some(version_url) => {
                info!("Looking up the DevTools websocket at {}", version_url);
                let version: Value = reqwest::Client::builder()
                    .timeout(timeout)
                    .build()?
                    .get(&version_url)
                    .send()
                    .await?
                    .json()
                    .await?;
                version
                    .get("webSocketDebuggerUrl")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SurfaceError::Protocol("no webSocketDebuggerUrl in version info".into())
                    })?
                    .to_string()
            }
            None => endpoint.to_string(),
        };

        info!("Connecting to browser at {}", ws_url);
        let config = HandlerConfig {
            request_timeout: timeout,
            ..Default::default()
        };
        let (browser, mut handler) = Browser::connect_with_config(ws_url, config).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await?;
        Ok(Self {
            browser: Mutex::new(browser),
            page,
            handler,
            elements: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Close the tab and detach. The browser itself keeps running.
    pub async fn close(self) -> SurfaceResult<()> {
        self.page.close().await?;
        drop(self.browser);
        self.handler.abort();
        info!("Closed browser tab");
        Ok(())
    }

    pub async fn current_url(&self) -> SurfaceResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn register(&self, found: Vec<Element>) -> Vec<ElementHandle> {
        let mut elements = self.elements.lock().await;
        found
            .into_iter()
            .map(|element| {
                let id = format!("e{}", self.next_id.fetch_add(1, Ordering::Relaxed));
                elements.insert(id.clone(), Arc::new(element));
                ElementHandle::new(id)
            })
            .collect()
    }

    async fn element(&self, handle: &ElementHandle) -> SurfaceResult<Arc<Element>> {
        self.elements
            .lock()
            .await
            .get(handle.id())
            .cloned()
            .ok_or_else(|| SurfaceError::NoSuchElement(handle.id().to_string()))
    }

    /// Run `body` with `this` bound to the element and return its result.
    async fn call(&self, handle: &ElementHandle, body: &str) -> SurfaceResult<Value> {
        let element = self.element(handle).await?;
        let returns = element.call_js_fn(guarded(body), false).await?;
        if let Some(exception) = returns.exception_details {
            return Err(SurfaceError::Protocol(exception.text));
        }
        match returns.result.value {
            Some(Value::String(json)) => serde_json::from_str(&json)
                .map_err(|e| SurfaceError::Protocol(format!("bad element result: {}", e))),
            _ => Err(SurfaceError::StaleElement(handle.id().to_string())),
        }
    }

    async fn call_text(&self, handle: &ElementHandle, body: &str) -> SurfaceResult<Option<String>> {
        match self.call(handle, body).await? {
            Value::Null => Ok(None),
            value => Ok(Some(
                RawMarkup::from_code_points(&code_points(&value)?)?.to_text_lossy(),
            )),
        }
    }
}

#[async_trait]
impl RenderingSurface for ChromiumSurface {
    async fn navigate(&self, url: &str) -> SurfaceResult<()> {
        info!("Loading page: '{}'", url);
        self.page.goto(url).await?;
        self.elements.lock().await.clear();
        Ok(())
    }

    async fn open_link(&self, url: &str) -> SurfaceResult<()> {
        debug!("Opening in-app link: '{}'", url);
        self.page.evaluate_expression(open_link_script(url)?).await?;
        Ok(())
    }

    async fn query_all(
        &self,
        scope: Option<&ElementHandle>,
        selector: &str,
    ) -> SurfaceResult<Vec<ElementHandle>> {
        let found = match scope {
            Some(handle) => {
                self.call(handle, IS_CONNECTED).await?;
                self.element(handle).await?.find_elements(selector).await?
            }
            None => self.page.find_elements(selector).await?,
        };
        Ok(self.register(found).await)
    }

    async fn element_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> SurfaceResult<Option<String>> {
        let body = format!(
            "const value = this.getAttribute({}); \
             return value === null ? null : Array.from(value, c => c.codePointAt(0));",
            js_string(name)?
        );
        self.call_text(element, &body).await
    }

    async fn element_text(&self, element: &ElementHandle) -> SurfaceResult<String> {
        Ok(self.call_text(element, TEXT_CONTENT).await?.unwrap_or_default())
    }

    async fn element_offset_y(&self, element: &ElementHandle) -> SurfaceResult<f64> {
        self.call(element, OFFSET_Y)
            .await?
            .as_f64()
            .ok_or_else(|| SurfaceError::Protocol("element offset is not a number".into()))
    }

    async fn scroll_step(
        &self,
        container: &ElementHandle,
        direction: ScrollDirection,
    ) -> SurfaceResult<()> {
        self.call(container, &scroll_script(direction)).await?;
        Ok(())
    }

    async fn capture_raw_markup(&self, element: &ElementHandle) -> SurfaceResult<RawMarkup> {
        let value = self.call(element, OUTER_HTML).await?;
        RawMarkup::from_code_points(&code_points(&value)?)
    }

    async fn click(&self, element: &ElementHandle) -> SurfaceResult<()> {
        self.call(element, IS_CONNECTED).await?;
        self.element(element).await?.click().await?;
        Ok(())
    }
}

/// The `/json/version` address for an HTTP debugging endpoint, or `None`
/// when `endpoint` is already a websocket URL.
fn version_url(endpoint: &str) -> Option<String> {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return None;
    }
    Some(format!("{}/json/version", endpoint.trim_end_matches('/')))
}

/// Wrap `body` so that a detached element yields `null` and any other result
/// comes back as a JSON string.
fn guarded(body: &str) -> String {
    format!(
        "function() {{ if (!this.isConnected) return null; \
         return JSON.stringify((() => {{ {} }})()); }}",
        body
    )
}

/// Scroll the list's scrollable parent by one page.
fn scroll_script(direction: ScrollDirection) -> String {
    let sign = match direction {
        ScrollDirection::Up => "-",
        ScrollDirection::Down => "",
    };
    format!(
        "const scrollable = this.parentElement; \
         scrollable.scrollBy({{ top: {}scrollable.clientHeight, behavior: 'instant' }}); \
         return true;",
        sign
    )
}

/// Opens a link through the client's own router.
fn open_link_script(url: &str) -> SurfaceResult<String> {
    Ok(format!(
        "(() => {{ const link = document.createElement('a'); link.href = {}; im(link); }})()",
        js_string(url)?
    ))
}

fn js_string(value: &str) -> SurfaceResult<String> {
    serde_json::to_string(value).map_err(|e| SurfaceError::Protocol(e.to_string()))
}

fn code_points(value: &Value) -> SurfaceResult<Vec<u32>> {
    value
        .as_array()
        .ok_or_else(|| SurfaceError::Protocol(format!("expected code points, got {}", value)))?
        .iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| SurfaceError::Protocol(format!("bad code point: {}", v)))
        })
        .collect()
}
