use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// Why a single navigation produced nothing usable
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchFailure {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("server answered with status {0}")]
    Status(u16),

    #[error("could not read links: {0}")]
    Extraction(String),
}

pub type FetchOutcome<T> = Result<T, FetchFailure>;

/// What a fetcher saw on one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPage {
    /// Value of the Content-Type response header, if any
    pub content_type: Option<String>,

    /// `href` attribute of every anchor, `None` for anchors without one
    pub hrefs: Vec<Option<String>>,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map_or(false, |content_type| content_type.contains("text/html"))
    }
}

/// Navigation primitives the link explorer relies on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Lightweight navigation; returns the URL the browser ended up on
    async fn probe(&self, url: &Url) -> FetchOutcome<Url>;

    /// Full navigation; returns the response type and every anchor's href
    async fn fetch_page(&self, url: &Url) -> FetchOutcome<FetchedPage>;
}

/// An isolated cookie/storage jar owned by one crawl unit
#[async_trait]
pub trait BrowsingContext: PageFetcher {
    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// Hands out fresh browsing contexts; shared by every unit of a process
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn new_context(&self) -> anyhow::Result<Box<dyn BrowsingContext>>;
}
