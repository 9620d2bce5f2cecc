use anyhow::{Context, Result};
use async_trait::async_trait;
use thirtyfour::prelude::*;
use tracing::{debug, error};
use url::Url;

use crate::browser::fetcher::{
    BrowsingContext, ContextFactory, FetchFailure, FetchOutcome, FetchedPage, PageFetcher,
};
use crate::browser::fingerprint::FingerprintManager;
use crate::cli::config::BrowserSettings;

/// Reads the MIME type the browser assigned to the current document
const CONTENT_TYPE_SCRIPT: &str = "return document.contentType;";

/// Opens a fresh WebDriver session for every browsing context.
///
/// The WebDriver server is the browser engine shared by the whole process;
/// each session runs with its own profile, so cookies and storage never
/// leak between crawl units.
pub struct WebDriverFactory {
    config: BrowserSettings,
    fingerprints: FingerprintManager,
}

impl WebDriverFactory {
    pub fn new(config: BrowserSettings) -> Self {
        let fingerprints = FingerprintManager::new(config.user_agents.clone());
        Self { config, fingerprints }
    }
}

#[async_trait]
impl ContextFactory for WebDriverFactory {
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>> {
        let user_agent = self.fingerprints.random_user_agent()?;

        let mut caps = DesiredCapabilities::chrome();
        caps.add_chrome_arg(&format!("--user-agent={}", user_agent))?;
        if self.config.headless {
            caps.set_headless()?;
        }
        caps.add_chrome_arg("--disable-dev-shm-usage")?;

        let driver = WebDriver::new(&self.config.webdriver_url, caps)
            .await
            .context(format!("Failed to connect to WebDriver at {}", self.config.webdriver_url))?;

        driver
            .set_page_load_timeout(self.config.navigation_timeout())
            .await
            .context("Failed to set page load timeout")?;

        debug!("Browser session opened with user agent: {}", user_agent);

        Ok(Box::new(BrowserSession {
            driver,
            settle_delay: self.config.settle_delay(),
        }))
    }
}

/// One WebDriver session used as an isolated browsing context
pub struct BrowserSession {
    driver: WebDriver,
    settle_delay: std::time::Duration,
}

impl BrowserSession {
    async fn navigate(&self, url: &Url) -> FetchOutcome<()> {
        debug!("Navigating to: {}", url);
        self.driver
            .goto(url.as_str())
            .await
            .map_err(|e| FetchFailure::Navigation(e.to_string()))
    }

    async fn content_type(&self) -> FetchOutcome<Option<String>> {
        let ret = self
            .driver
            .execute(CONTENT_TYPE_SCRIPT, Vec::new())
            .await
            .map_err(|e| FetchFailure::Extraction(e.to_string()))?;

        Ok(ret.json().as_str().map(str::to_string))
    }

    async fn anchors(&self) -> FetchOutcome<Vec<Option<String>>> {
        let elements = self
            .driver
            .find_all(By::Tag("a"))
            .await
            .map_err(|e| FetchFailure::Extraction(e.to_string()))?;

        let mut hrefs = Vec::with_capacity(elements.len());
        for element in elements {
            let href = element
                .attr("href")
                .await
                .map_err(|e| FetchFailure::Extraction(e.to_string()))?;
            hrefs.push(href);
        }

        Ok(hrefs)
    }
}

#[async_trait]
impl PageFetcher for BrowserSession {
    async fn probe(&self, url: &Url) -> FetchOutcome<Url> {
        self.navigate(url).await?;

        let current = self
            .driver
            .current_url()
            .await
            .map_err(|e| FetchFailure::Navigation(e.to_string()))?;

        Url::parse(current.as_str()).map_err(|e| FetchFailure::Navigation(e.to_string()))
    }

    async fn fetch_page(&self, url: &Url) -> FetchOutcome<FetchedPage> {
        self.navigate(url).await?;
        tokio::time::sleep(self.settle_delay).await;

        let content_type = self.content_type().await?;
        let mut page = FetchedPage { content_type, hrefs: vec![] };

        if page.is_html() {
            page.hrefs = self.anchors().await?;
        }

        Ok(page)
    }
}

#[async_trait]
impl BrowsingContext for BrowserSession {
    async fn close(self: Box<Self>) -> Result<()> {
        let session = *self;
        if let Err(e) = session.driver.quit().await {
            error!("Error closing browser session: {}", e);
        }
        debug!("Browser session closed");
        Ok(())
    }
}
