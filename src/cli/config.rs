use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerSettings,
    pub queues: QueueNames,
    pub crawler: CrawlerSettings,
    pub browser: BrowserSettings,
    pub leader: LeaderSettings,
    pub worker: WorkerSettings,
}

/// Which message broker carries tasks and results
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Amqp,
    Redis,
}

/// Message broker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerSettings {
    pub backend: BrokerBackend,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    /// Used when `backend` is `redis`
    pub redis_url: String,
}

/// Queue names shared by leader and workers
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueNames {
    pub tasks: String,
    pub results: String,
    /// Consumed messages inflating past this size are rejected as malformed
    pub max_message_bytes: usize,
}

/// Internal link exploration settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Number of internal pages to collect per site
    pub sample_size: usize,
    /// Upper bound on a whole crawl unit, origin detection included
    pub unit_timeout_secs: u64,
    /// Links matching any of these patterns are never explored
    pub exclude_patterns: Vec<String>,
}

/// How pages are fetched
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetcherBackend {
    /// Remote WebDriver server, one browser session per crawl unit
    Webdriver,
    /// Plain HTTP client, one cookie jar per crawl unit
    Http,
}

/// Page fetching settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub backend: FetcherBackend,
    pub webdriver_url: String,
    pub headless: bool,
    /// Pause after each navigation so scripts can insert links
    pub settle_delay_ms: u64,
    pub navigation_timeout_secs: u64,
    /// One is picked at random for every browsing context
    pub user_agents: Vec<String>,
}

/// Leader settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LeaderSettings {
    pub sites_file: PathBuf,
    pub results_file: PathBuf,
    /// Wait between attempts to send an unroutable message
    pub send_backoff_secs: u64,
}

/// Worker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_workers: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Amqp,
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "ews".to_string(),
            password: String::new(),
            redis_url: "redis://localhost:6379".to_string(),
        }
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            tasks: "internal_crawler_tasks".to_string(),
            results: "internal_crawler_results".to_string(),
            max_message_bytes: 1024 * 1024,
        }
    }
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            sample_size: 15,
            unit_timeout_secs: 300,
            exclude_patterns: vec![],
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            backend: FetcherBackend::Webdriver,
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            settle_delay_ms: 1000,
            navigation_timeout_secs: 30,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
            ],
        }
    }
}

impl Default for LeaderSettings {
    fn default() -> Self {
        Self {
            sites_file: PathBuf::from("data/tranco_sample.csv"),
            results_file: PathBuf::from("results/internal_links.jsonl"),
            send_backoff_secs: 5,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { max_workers: 5 }
    }
}

impl CrawlerSettings {
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }
}

impl BrowserSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }
}

impl LeaderSettings {
    pub fn send_backoff(&self) -> Duration {
        Duration::from_secs(self.send_backoff_secs)
    }
}

impl AppConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "link-sampler", "link-sampler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Load from an explicit file, or from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load_default(),
        }
    }

    /// Load the default configuration, writing it out on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            if let Err(e) = config.save_to_file(&config_path) {
                warn!("Could not save default configuration: {:#}", e);
            }
            Ok(config)
        }
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents).context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.crawler.sample_size == 0 {
            anyhow::bail!("crawler.sample_size must be at least 1");
        }
        if self.queues.max_message_bytes == 0 {
            anyhow::bail!("queues.max_message_bytes must be at least 1");
        }
        if self.worker.max_workers == 0 {
            anyhow::bail!("worker.max_workers must be at least 1");
        }
        if self.browser.user_agents.is_empty() {
            anyhow::bail!("browser.user_agents must not be empty");
        }
        Ok(())
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = self.to_yaml()?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_batch_job() {
        let config = AppConfig::default();
        assert_eq!(config.crawler.sample_size, 15);
        assert_eq!(config.worker.max_workers, 5);
        assert_eq!(config.leader.send_backoff(), Duration::from_secs(5));
        assert_eq!(config.browser.settle_delay(), Duration::from_millis(1000));
        assert_eq!(config.broker.backend, BrokerBackend::Amqp);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml(
            "broker:\n  backend: redis\ncrawler:\n  sample_size: 3\nbrowser:\n  backend: http\n",
        )
        .unwrap();

        assert_eq!(config.broker.backend, BrokerBackend::Redis);
        assert_eq!(config.broker.redis_url, "redis://localhost:6379");
        assert_eq!(config.crawler.sample_size, 3);
        assert_eq!(config.browser.backend, FetcherBackend::Http);
        assert_eq!(config.queues.tasks, "internal_crawler_tasks");
        assert_eq!(config.queues.max_message_bytes, 1024 * 1024);
    }

    #[test]
    fn test_message_size_limit_is_configurable() {
        let config = AppConfig::from_yaml("queues:\n  max_message_bytes: 4096\n").unwrap();
        assert_eq!(config.queues.max_message_bytes, 4096);

        assert!(AppConfig::from_yaml("queues:\n  max_message_bytes: 0\n").is_err());
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        assert!(AppConfig::from_yaml("worker:\n  max_workers: 0\n").is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = AppConfig::default();
        let parsed = AppConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed.queues.results, config.queues.results);
        assert_eq!(parsed.browser.user_agents.len(), 3);
    }
}
