use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{redirect, Client};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::browser::fetcher::{
    BrowsingContext, ContextFactory, FetchFailure, FetchOutcome, FetchedPage, PageFetcher,
};
use crate::browser::fingerprint::FingerprintManager;

/// Redirect hops followed before a navigation counts as failed
const MAX_REDIRECTS: usize = 10;

/// Creates plain HTTP browsing contexts; no scripts are run
pub struct HttpContextFactory {
    fingerprints: FingerprintManager,
    timeout: Duration,
}

impl HttpContextFactory {
    pub fn new(fingerprints: FingerprintManager, timeout: Duration) -> Self {
        Self { fingerprints, timeout }
    }
}

#[async_trait]
impl ContextFactory for HttpContextFactory {
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>> {
        let user_agent = self.fingerprints.random_user_agent()?;
        let context = HttpContext::new(user_agent, self.timeout)?;
        Ok(Box::new(context))
    }
}

/// One HTTP client with its own cookie store
pub struct HttpContext {
    client: Client,
}

impl HttpContext {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .cookie_store(true)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpContext {
    async fn probe(&self, url: &Url) -> FetchOutcome<Url> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| FetchFailure::Navigation(e.to_string()))?;

        Url::parse(response.url().as_str()).map_err(|e| FetchFailure::Navigation(e.to_string()))
    }

    async fn fetch_page(&self, url: &Url) -> FetchOutcome<FetchedPage> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| FetchFailure::Navigation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut page = FetchedPage { content_type, hrefs: vec![] };
        if !page.is_html() {
            return Ok(page);
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchFailure::Navigation(e.to_string()))?;

        page.hrefs = extract_hrefs(&body)?;
        debug!("Found {} anchor(s) on {}", page.hrefs.len(), url);

        Ok(page)
    }
}

#[async_trait]
impl BrowsingContext for HttpContext {
    async fn close(self: Box<Self>) -> Result<()> {
        // Dropping the client discards its cookie store
        Ok(())
    }
}

/// `href` of every `<a>` element, in document order
fn extract_hrefs(html: &str) -> FetchOutcome<Vec<Option<String>>> {
    let selector = Selector::parse("a").map_err(|e| FetchFailure::Extraction(e.to_string()))?;
    let document = Html::parse_document(html);

    Ok(document
        .select(&selector)
        .map(|anchor| anchor.value().attr("href").map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> HttpContext {
        HttpContext::new("link-sampler-test", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_extract_hrefs_keeps_missing_attributes() {
        let hrefs = extract_hrefs(r#"<a href="/a">A</a><a name="top"></a><p><a href="b">B</a></p>"#).unwrap();
        assert_eq!(hrefs, vec![Some("/a".to_string()), None, Some("b".to_string())]);
    }

    #[tokio::test]
    async fn test_fetch_page_reads_anchors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"<html><body><a href="/about">About</a><a>x</a></body></html>"#, "text/html"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let page = context().fetch_page(&url).await.unwrap();

        assert!(page.is_html());
        assert_eq!(page.hrefs, vec![Some("/about".to_string()), None]);
    }

    #[tokio::test]
    async fn test_fetch_page_reports_non_html_without_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/report.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"%PDF-1.4".to_vec(), "application/pdf"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/report.pdf", server.uri())).unwrap();
        let page = context().fetch_page(&url).await.unwrap();

        assert!(!page.is_html());
        assert!(page.hrefs.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_page_error_status_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let err = context().fetch_page(&url).await.unwrap_err();
        assert_eq!(err, FetchFailure::Status(404));
    }

    #[tokio::test]
    async fn test_probe_returns_final_url_after_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/home"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/home"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let landing = context().probe(&url).await.unwrap();
        assert_eq!(landing.path(), "/home");
    }

    #[tokio::test]
    async fn test_probe_connection_refused_is_a_failure() {
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let err = context().probe(&url).await.unwrap_err();
        assert!(matches!(err, FetchFailure::Navigation(_)));
    }
}
