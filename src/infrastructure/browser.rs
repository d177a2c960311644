//! Headless Chromium page source (CDP via chromiumoxide)
//!
//! One browser process is shared; each load opens a tab, waits for the
//! document, reads the DOM and closes the tab. Listing pages are scrolled to
//! trigger lazy loading and their load-more buttons are clicked until the grid
//! stops growing. Concurrent tabs are bounded by a semaphore.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::infrastructure::config::ScrapingConfig;
use crate::infrastructure::page_source::{PageKind, PageLoadError, PageSource};

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight)";

const LINK_COUNT_SCRIPT: &str = "document.querySelectorAll('a[href]').length";

/// Pause after each scroll so lazy content can render
const SCROLL_PAUSE_MS: u64 = 800;

/// Closes the tab when dropped on an error path.
///
/// `Page` has no `Drop` of its own; an unclosed tab lives until the browser exits.
struct PageGuard {
    page: Option<Page>,
    url: String,
}

impl PageGuard {
    fn new(page: Page, url: &str) -> Self {
        Self {
            page: Some(page),
            url: url.to_string(),
        }
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Failed to close page for {}: {}", self.url, e);
            }
        }
    }
}

impl Deref for PageGuard {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        match &self.page {
            Some(page) => page,
            None => unreachable!("page is only taken by close(), which consumes the guard"),
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            let url = std::mem::take(&mut self.url);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = page.close().await {
                        warn!("Page cleanup failed for {}: {}", url, e);
                    } else {
                        trace!("Page cleanup succeeded for {}", url);
                    }
                });
            }
        }
    }
}

pub struct BrowserPageSource {
    browser: RwLock<Browser>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    tabs: Arc<Semaphore>,
    user_agent: String,
    timeout_ms: u64,
    scroll_passes: u32,
    load_more_clicks: u32,
    load_more_script: String,
}

impl BrowserPageSource {
    /// Launch Chromium with settings from `config`.
    pub async fn launch(config: &ScrapingConfig) -> anyhow::Result<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .request_timeout(Duration::from_millis(config.timeout_ms))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage");
        if !config.headless {
            builder = builder.with_head();
        }
        let browser_config = builder.build().map_err(|e| anyhow!("Invalid browser configuration: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch Chromium")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
            debug!("Browser handler finished");
        });

        info!(
            "Browser launched (headless: {}, max tabs: {})",
            config.headless, config.max_concurrent_pages
        );

        Ok(Self {
            browser: RwLock::new(browser),
            handler_task: Mutex::new(Some(handler_task)),
            tabs: Arc::new(Semaphore::new(config.max_concurrent_pages.max(1))),
            user_agent: config.user_agent.clone(),
            timeout_ms: config.timeout_ms,
            scroll_passes: config.scroll_passes,
            load_more_clicks: config.load_more_clicks,
            load_more_script: click_first_script(&config.selectors.load_more),
        })
    }

    async fn render(&self, url: &str, kind: PageKind) -> Result<String, PageLoadError> {
        let page = {
            let browser = self.browser.read().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| PageLoadError::browser(url, e))?
        };
        let page = PageGuard::new(page, url);

        page.set_user_agent(SetUserAgentOverrideParams::new(self.user_agent.clone()))
            .await
            .map_err(|e| PageLoadError::browser(url, e))?;
        page.goto(url).await.map_err(|e| PageLoadError::browser(url, e))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| PageLoadError::browser(url, e))?;

        if kind == PageKind::Listing {
            for pass in 0..self.scroll_passes {
                if let Err(e) = page.evaluate(SCROLL_SCRIPT).await {
                    debug!("Scroll pass {} failed on {}: {}", pass + 1, url, e);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(SCROLL_PAUSE_MS)).await;
            }
            self.expand_listing(&page, url).await;
        }

        let html = page.content().await.map_err(|e| PageLoadError::browser(url, e))?;
        page.close().await;
        Ok(html)
    }

    /// Click load-more controls until none is left, a click adds no links or
    /// the click budget is spent.
    async fn expand_listing(&self, page: &Page, url: &str) {
        let mut links = link_count(page).await;

        for click in 1..=self.load_more_clicks {
            let clicked = match page.evaluate(self.load_more_script.as_str()).await {
                Ok(result) => result.into_value::<bool>().unwrap_or(false),
                Err(e) => {
                    debug!("Load-more click failed on {}: {}", url, e);
                    false
                }
            };
            if !clicked {
                break;
            }

            tokio::time::sleep(Duration::from_millis(SCROLL_PAUSE_MS)).await;
            if let Err(e) = page.evaluate(SCROLL_SCRIPT).await {
                debug!("Scroll after click {} failed on {}: {}", click, url, e);
            }

            let now = link_count(page).await;
            debug!("Load-more click {} on {}: {} -> {} links", click, url, links, now);
            if now <= links {
                break;
            }
            links = now;
        }
    }
}

async fn link_count(page: &Page) -> u64 {
    match page.evaluate(LINK_COUNT_SCRIPT).await {
        Ok(result) => result.into_value::<u64>().unwrap_or(0),
        Err(_) => 0,
    }
}

/// Script that clicks the first visible, enabled element matching any of
/// `selectors` (in order) and evaluates to whether it clicked.
fn click_first_script(selectors: &[String]) -> String {
    let selectors = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"(() => {{
  for (const selector of {selectors}) {{
    let candidates;
    try {{ candidates = document.querySelectorAll(selector); }} catch (e) {{ continue; }}
    for (const el of candidates) {{
      const disabled = el.disabled || el.getAttribute('aria-disabled') === 'true' || el.classList.contains('disabled');
      if (!disabled && el.offsetParent !== null) {{
        el.scrollIntoView({{ block: 'center' }});
        el.click();
        return true;
      }}
    }}
  }}
  return false;
}})()"#
    )
}

#[async_trait]
impl PageSource for BrowserPageSource {
    async fn load(&self, url: &str, kind: PageKind) -> Result<String, PageLoadError> {
        let _permit = self.tabs.acquire().await.map_err(|_| PageLoadError::Unavailable {
            message: "browser is shutting down".to_string(),
        })?;

        debug!("Rendering {:?} page: {}", kind, url);
        let timeout = Duration::from_millis(self.timeout_ms);
        match tokio::time::timeout(timeout, self.render(url, kind)).await {
            Ok(result) => result,
            Err(_) => Err(PageLoadError::Timeout {
                url: url.to_string(),
                timeout_ms: self.timeout_ms,
            }),
        }
    }

    async fn shutdown(&self) {
        self.tabs.close();
        {
            let mut browser = self.browser.write().await;
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser: {}", e);
            }
            if let Err(e) = browser.wait().await {
                debug!("Browser process wait failed: {}", e);
            }
        }
        if let Some(task) = self.handler_task.lock().await.take() {
            task.abort();
        }
        info!("Browser closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_script_embeds_selectors_in_order() {
        let script = click_first_script(&[
            "[data-testid=\"load-more\"]".to_string(),
            ".show-more".to_string(),
        ]);
        assert!(script.contains(r#"for (const selector of ["[data-testid=\"load-more\"]",".show-more"])"#));
        assert!(script.starts_with("(() => {"));
        assert!(script.trim_end().ends_with("})()"));
    }

    #[test]
    fn test_click_script_without_selectors_clicks_nothing() {
        let script = click_first_script(&[]);
        assert!(script.contains("for (const selector of [])"));
        assert!(script.contains("return false;"));
    }
}
