use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::fetcher::PageFetcher;
use crate::crawler::frontier::{Frontier, LinkFilter};

/// Schemes tried during origin detection, most preferred first
const SCHEMES: [&str; 2] = ["https", "http"];

/// Host prefixes tried for every scheme
const SUBDOMAINS: [Option<&str>; 2] = [None, Some("www")];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CrawlError {
    #[error("{domain}: no scheme or subdomain combination connects")]
    OriginNotReachable { domain: String },

    #[error("{domain}: not a valid host name")]
    InvalidDomain { domain: String },
}

/// Samples internal pages of one site through a page fetcher
pub struct InternalNavigator<'a, F: ?Sized, R> {
    fetcher: &'a F,
    filter_exclude: &'a [String],
    rng: R,
}

impl<'a, F, R> InternalNavigator<'a, F, R>
where
    F: PageFetcher + ?Sized,
    R: Rng,
{
    pub fn new(fetcher: &'a F, exclude_patterns: &'a [String], rng: R) -> Self {
        Self {
            fetcher,
            filter_exclude: exclude_patterns,
            rng,
        }
    }

    /// Collect up to `n` internal pages of `domain`, in exploration order
    pub async fn visit(self, domain: &str, n: usize) -> Result<Vec<String>, CrawlError> {
        let origin = self.detect_origin(domain).await?;
        info!("{}: Using origin {}", domain, origin);

        let filter = LinkFilter::new(&origin, self.filter_exclude);
        let mut frontier = Frontier::new(self.rng);
        frontier.offer(origin);

        let mut accepted: Vec<Url> = Vec::new();

        while accepted.len() < n {
            let Some(candidate) = frontier.pop_random() else {
                debug!("{}: Frontier exhausted after {} page(s)", domain, accepted.len());
                break;
            };

            if !frontier.mark_visited(&candidate) {
                continue;
            }

            debug!("Visiting {}", candidate);

            let page = match self.fetcher.fetch_page(&candidate).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("Failed to visit: {}, {}", candidate, e);
                    continue;
                }
            };

            if !page.is_html() {
                debug!("Not a HTML page: {}", candidate);
                continue;
            }

            for link in filter.internal_links(&candidate, &page.hrefs) {
                frontier.offer(link);
            }

            accepted.push(candidate);
        }

        Ok(accepted.into_iter().map(String::from).collect())
    }

    /// First landing URL that answers, over `[https, http] x [bare, www]`
    pub async fn detect_origin(&self, domain: &str) -> Result<Url, CrawlError> {
        for scheme in SCHEMES {
            for subdomain in SUBDOMAINS {
                let host = match subdomain {
                    Some(prefix) => format!("{}.{}", prefix, domain),
                    None => domain.to_string(),
                };

                let url = Url::parse(&format!("{}://{}", scheme, host))
                    .map_err(|_| CrawlError::InvalidDomain { domain: domain.to_string() })?;

                match self.fetcher.probe(&url).await {
                    Ok(landing) => return Ok(landing),
                    Err(e) => debug!("{}: {} did not connect: {}", domain, url, e),
                }
            }
        }

        Err(CrawlError::OriginNotReachable { domain: domain.to_string() })
    }
}
