use std::collections::HashSet;

use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

/// Strip the parts of a URL that do not identify a distinct page
pub fn normalize(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_query(None);
    normalized.set_fragment(None);
    normalized
}

/// Host plus explicit port, the part two URLs must share to be same-origin
pub fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;

    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Turns raw anchors from one page into candidates on the crawl's origin
pub struct LinkFilter {
    origin_authority: String,
    exclude_patterns: Vec<Regex>,
}

impl LinkFilter {
    pub fn new(origin: &Url, exclude: &[String]) -> Self {
        let exclude_patterns = exclude
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid exclude pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Self {
            origin_authority: authority(origin).unwrap_or_default(),
            exclude_patterns,
        }
    }

    /// Resolve, scope and normalize the hrefs found on `page`.
    /// The result holds no duplicates and keeps first-seen order.
    pub fn internal_links(&self, page: &Url, hrefs: &[Option<String>]) -> Vec<Url> {
        let mut seen = HashSet::new();

        hrefs
            .iter()
            .flatten()
            .filter_map(|href| page.join(href.trim()).ok())
            .filter(|link| matches!(link.scheme(), "http" | "https"))
            .filter(|link| authority(link).as_deref() == Some(self.origin_authority.as_str()))
            .map(|link| normalize(&link))
            .filter(|link| !self.is_excluded(link))
            .filter(|link| seen.insert(link.as_str().to_string()))
            .collect()
    }

    fn is_excluded(&self, link: &Url) -> bool {
        let excluded = self.exclude_patterns.iter().any(|pattern| pattern.is_match(link.as_str()));
        if excluded {
            debug!("Skipping URL matching exclusion pattern: {}", link);
        }
        excluded
    }
}

/// Pages waiting to be explored plus the ones already explored.
///
/// A URL is never in both sets, and never enters the frontier again once
/// it has been visited.
pub struct Frontier<R> {
    pending: Vec<Url>,
    pending_keys: HashSet<String>,
    visited: HashSet<String>,
    rng: R,
}

impl<R: Rng> Frontier<R> {
    pub fn new(rng: R) -> Self {
        Self {
            pending: Vec::new(),
            pending_keys: HashSet::new(),
            visited: HashSet::new(),
            rng,
        }
    }

    /// Add a candidate unless it is already pending or visited
    pub fn offer(&mut self, url: Url) -> bool {
        let url = normalize(&url);
        let key = url.as_str().to_string();

        if self.visited.contains(&key) || self.pending_keys.contains(&key) {
            return false;
        }

        self.pending_keys.insert(key);
        self.pending.push(url);
        true
    }

    /// Remove a uniformly random pending candidate
    pub fn pop_random(&mut self) -> Option<Url> {
        if self.pending.is_empty() {
            return None;
        }

        let index = self.rng.gen_range(0..self.pending.len());
        let url = self.pending.swap_remove(index);
        self.pending_keys.remove(url.as_str());

        Some(url)
    }

    /// Record a visit; false if the URL had been visited already
    pub fn mark_visited(&mut self, url: &Url) -> bool {
        self.visited.insert(normalize(url).as_str().to_string())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    #[cfg(test)]
    fn is_disjoint(&self) -> bool {
        self.pending_keys.is_disjoint(&self.visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_normalize_drops_query_and_fragment() {
        let inputs = [
            "https://example.com/about",
            "https://example.com/about?utm=1",
            "https://example.com/about#team",
            "https://example.com/about?a=1&b=2#x",
        ];

        for input in inputs {
            assert_eq!(normalize(&url(input)).as_str(), "https://example.com/about");
        }
    }

    #[test]
    fn test_authority_includes_explicit_port_only() {
        assert_eq!(authority(&url("https://example.com/")).as_deref(), Some("example.com"));
        assert_eq!(authority(&url("https://example.com:443/")).as_deref(), Some("example.com"));
        assert_eq!(authority(&url("http://example.com:8080/")).as_deref(), Some("example.com:8080"));
        assert_eq!(authority(&url("mailto:a@example.com")), None);
    }

    #[test]
    fn test_internal_links_scoping() {
        let origin = url("https://www.example.com/");
        let filter = LinkFilter::new(&origin, &[]);
        let page = url("https://www.example.com/blog/post");

        let hrefs = vec![
            Some("/about".to_string()),
            Some("/about?utm=1".to_string()),
            Some("contact#form".to_string()),
            Some("//www.example.com/team".to_string()),
            Some("https://example.com/bare".to_string()),
            Some("https://other.org/".to_string()),
            Some("https://www.example.com:8443/alt".to_string()),
            Some("mailto:hello@example.com".to_string()),
            Some("javascript:void(0)".to_string()),
            None,
        ];

        let links: Vec<String> = filter
            .internal_links(&page, &hrefs)
            .into_iter()
            .map(String::from)
            .collect();

        assert_eq!(
            links,
            vec![
                "https://www.example.com/about",
                "https://www.example.com/blog/contact",
                "https://www.example.com/team",
            ]
        );
    }

    #[test]
    fn test_scheme_change_on_same_authority_is_internal() {
        let origin = url("https://example.com/");
        let filter = LinkFilter::new(&origin, &[]);

        let links = filter.internal_links(&origin, &[Some("http://example.com/plain".to_string())]);
        assert_eq!(links, vec![url("http://example.com/plain")]);
    }

    #[test]
    fn test_exclude_patterns() {
        let origin = url("https://example.com/");
        let filter = LinkFilter::new(&origin, &[r"\.(pdf|jpg)$".to_string(), "(".to_string()]);

        let links = filter.internal_links(
            &origin,
            &[Some("/report.pdf".to_string()), Some("/page".to_string())],
        );
        assert_eq!(links, vec![url("https://example.com/page")]);
    }

    #[test]
    fn test_visited_urls_never_reenter_frontier() {
        let mut frontier = Frontier::new(StdRng::seed_from_u64(7));
        assert!(frontier.offer(url("https://example.com/")));

        let popped = frontier.pop_random().unwrap();
        assert!(frontier.mark_visited(&popped));

        assert!(!frontier.offer(url("https://example.com/?ref=nav")));
        assert!(!frontier.offer(url("https://example.com/#top")));
        assert!(frontier.is_empty());
        assert!(!frontier.mark_visited(&popped));
    }

    #[test]
    fn test_pending_urls_are_not_duplicated() {
        let mut frontier = Frontier::new(StdRng::seed_from_u64(7));
        assert!(frontier.offer(url("https://example.com/a")));
        assert!(!frontier.offer(url("https://example.com/a?x=1")));
        assert_eq!(frontier.pending_count(), 1);
    }

    #[test]
    fn test_random_pop_drains_every_candidate_once() {
        let mut frontier = Frontier::new(StdRng::seed_from_u64(42));
        for i in 0..50 {
            frontier.offer(url(&format!("https://example.com/p{}", i)));
        }

        let mut drained = HashSet::new();
        while let Some(next) = frontier.pop_random() {
            assert!(frontier.mark_visited(&next));
            assert!(frontier.is_disjoint());
            assert!(drained.insert(next.to_string()));
        }

        assert_eq!(drained.len(), 50);
        assert_eq!(frontier.visited_count(), 50);
    }

    #[test]
    fn test_random_pop_is_not_fifo() {
        // Over many seeds the first pop must not always be the first offer
        let first_pops: HashSet<String> = (0..20)
            .map(|seed| {
                let mut frontier = Frontier::new(StdRng::seed_from_u64(seed));
                for i in 0..10 {
                    frontier.offer(url(&format!("https://example.com/p{}", i)));
                }
                frontier.pop_random().unwrap().to_string()
            })
            .collect();

        assert!(first_pops.len() > 1);
    }
}
