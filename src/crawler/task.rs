use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One site to sample, as sent by the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    /// Position of the site in the input list
    pub rank: u64,

    /// Bare domain name, e.g. `example.com`
    pub site: String,

    /// Extra input columns carried through to the result untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// Internal pages found for one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub rank: u64,

    pub site: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,

    /// Accepted pages in the order they were explored
    pub urls: Vec<String>,
}

impl CrawlTask {
    pub fn new(rank: u64, site: impl Into<String>) -> Self {
        Self {
            rank,
            site: site.into(),
            extra: BTreeMap::new(),
        }
    }
}

impl CrawlResult {
    pub fn from_task(task: CrawlTask, urls: Vec<String>) -> Self {
        let CrawlTask { rank, site, extra } = task;

        Self { rank, site, extra, urls }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_carries_task_fields() {
        let mut task = CrawlTask::new(3, "example.com");
        task.extra.insert("list".to_string(), "tranco".to_string());

        let result = CrawlResult::from_task(task, vec!["https://example.com/".to_string()]);

        assert_eq!(result.rank, 3);
        assert_eq!(result.site, "example.com");
        assert_eq!(result.extra.get("list").map(String::as_str), Some("tranco"));
        assert_eq!(result.urls, vec!["https://example.com/"]);
    }

    #[test]
    fn test_result_json_shape() {
        let result = CrawlResult::from_task(CrawlTask::new(1, "a.com"), vec!["https://a.com/".to_string()]);
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"rank":1,"site":"a.com","urls":["https://a.com/"]}"#);
    }

    #[test]
    fn test_passthrough_fields_are_flattened() {
        let json = r#"{"rank":2,"site":"b.com","category":"news"}"#;
        let task: CrawlTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.extra.get("category").map(String::as_str), Some("news"));
        assert_eq!(serde_json::to_string(&task).unwrap(), json);
    }
}
