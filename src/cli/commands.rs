use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::browser::{ContextFactory, FingerprintManager, HttpContextFactory, WebDriverFactory};
use crate::cli::config::{AppConfig, BrokerBackend, BrokerSettings, BrowserSettings, FetcherBackend};
use crate::crawler::{CrawlResult, CrawlTask, PoolSettings, WorkerPool};
use crate::queue::{AmqpParams, AmqpTransport, Channel, Consumer, MemoryTransport, RedisTransport, Transport};
use crate::storage::{load_tasks, ResultWriter};

/// Enqueue every site and write results until interrupted
pub async fn leader(config: AppConfig, resume: bool) -> Result<()> {
    let tasks = load_tasks(&config.leader.sites_file)?;
    info!("Loaded {} site(s) from {}", tasks.len(), config.leader.sites_file.display());

    let transport = connect(&config.broker).await?;
    let outcome = run_leader(transport.clone(), &config, tasks, resume, shutdown_on_ctrl_c()).await;
    close(transport.as_ref()).await;

    outcome
}

/// Crawl tasks from the broker until interrupted
pub async fn worker(config: AppConfig) -> Result<()> {
    let contexts = context_factory(&config.browser);

    let transport = connect(&config.broker).await?;
    let outcome = run_worker(transport.clone(), &config, contexts, shutdown_on_ctrl_c()).await;
    close(transport.as_ref()).await;

    outcome
}

/// Leader and worker pool in one process, over the in-memory transport
pub async fn local(config: AppConfig) -> Result<()> {
    let tasks = load_tasks(&config.leader.sites_file)?;
    info!("Loaded {} site(s) from {}", tasks.len(), config.leader.sites_file.display());

    let memory = MemoryTransport::new();
    let contexts = context_factory(&config.browser);
    let outcome = run_local(&memory, &config, tasks, contexts, shutdown_on_ctrl_c()).await;
    close(&memory).await;

    outcome
}

/// Show the effective configuration
pub fn show_config(config: &AppConfig) -> Result<()> {
    println!("Current configuration:");
    println!("{}", config.to_yaml()?);

    Ok(())
}

async fn connect(broker: &BrokerSettings) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match broker.backend {
        BrokerBackend::Amqp => {
            let params = AmqpParams {
                host: broker.host.clone(),
                port: broker.port,
                vhost: broker.vhost.clone(),
                username: broker.username.clone(),
                password: broker.password.clone(),
            };
            Arc::new(AmqpTransport::connect(&params).await?)
        }
        BrokerBackend::Redis => Arc::new(RedisTransport::connect(&broker.redis_url).await?),
    };

    info!("Connected to message queue");
    Ok(transport)
}

async fn close(transport: &dyn Transport) {
    if let Err(e) = transport.close().await {
        warn!("Failed to close message queue connection: {}", e);
    }
}

fn context_factory(browser: &BrowserSettings) -> Arc<dyn ContextFactory> {
    match browser.backend {
        FetcherBackend::Webdriver => Arc::new(WebDriverFactory::new(browser.clone())),
        FetcherBackend::Http => Arc::new(HttpContextFactory::new(
            FingerprintManager::new(browser.user_agents.clone()),
            browser.navigation_timeout(),
        )),
    }
}

fn pool_settings(config: &AppConfig) -> PoolSettings {
    PoolSettings {
        concurrency_limit: config.worker.max_workers,
        sample_size: config.crawler.sample_size,
        unit_timeout: config.crawler.unit_timeout(),
        exclude_patterns: config.crawler.exclude_patterns.clone(),
        send_backoff: config.leader.send_backoff(),
    }
}

/// Turns true once Ctrl-C is pressed
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (stop, shutdown) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, finishing in-flight work");
                let _ = stop.send(true);
            }
            Err(e) => {
                warn!("Cannot listen for Ctrl-C: {}", e);
                // Hold the sender so receivers never see a closed channel
                std::future::pending::<()>().await;
            }
        }
    });

    shutdown
}

async fn run_leader(
    transport: Arc<dyn Transport>,
    config: &AppConfig,
    tasks: Vec<CrawlTask>,
    resume: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let task_channel: Channel<CrawlTask> = Channel::open(transport.clone(), &config.queues.tasks, !resume, false)
        .await?
        .with_max_message_bytes(config.queues.max_message_bytes);
    let result_channel: Channel<CrawlResult> = Channel::open(transport, &config.queues.results, !resume, true)
        .await?
        .with_max_message_bytes(config.queues.max_message_bytes);

    // Bind before any worker can publish
    let collector = result_channel.consume().await?;
    let mut writer = ResultWriter::open(&config.leader.results_file, resume).await?;

    let (sent, drained) = tokio::join!(
        send_tasks(&task_channel, &tasks, config.leader.send_backoff(), shutdown.clone()),
        drain_results(collector, &mut writer, shutdown),
    );
    sent?;
    drained?;

    info!(
        "Leader stopped with {} result(s) written to {}",
        writer.written(),
        config.leader.results_file.display()
    );

    Ok(())
}

async fn run_worker(
    transport: Arc<dyn Transport>,
    config: &AppConfig,
    contexts: Arc<dyn ContextFactory>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let tasks: Channel<CrawlTask> = Channel::open(transport.clone(), &config.queues.tasks, false, false)
        .await?
        .with_max_message_bytes(config.queues.max_message_bytes);
    let results: Channel<CrawlResult> = Channel::open(transport, &config.queues.results, false, true)
        .await?
        .with_max_message_bytes(config.queues.max_message_bytes);

    let pool = WorkerPool::new(contexts, pool_settings(config));
    pool.run(&tasks, Arc::new(results), shutdown).await?;

    Ok(())
}

async fn run_local(
    memory: &MemoryTransport,
    config: &AppConfig,
    tasks: Vec<CrawlTask>,
    contexts: Arc<dyn ContextFactory>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(memory.clone());

    let task_channel: Channel<CrawlTask> = Channel::open(transport.clone(), &config.queues.tasks, true, false)
        .await?
        .with_max_message_bytes(config.queues.max_message_bytes);
    let result_channel: Channel<CrawlResult> = Channel::open(transport, &config.queues.results, true, true)
        .await?
        .with_max_message_bytes(config.queues.max_message_bytes);

    let collector = result_channel.consume().await?;
    let mut writer = ResultWriter::open(&config.leader.results_file, false).await?;

    let backoff = config.leader.send_backoff();
    for task in &tasks {
        task_channel
            .send_with_retry(task, backoff)
            .await
            .context(format!("Failed to queue task for {}", task.site))?;
    }
    memory.close_queue(&config.queues.tasks);

    let pool = WorkerPool::new(contexts, pool_settings(config));

    // Results are drained to the end even after an interrupt
    let (_keep_draining, never) = watch::channel(false);

    let crawling = async {
        let outcome = pool.run(&task_channel, Arc::new(result_channel), shutdown).await;
        memory.close_queue(&config.queues.results);
        outcome
    };

    let (crawled, drained) = tokio::join!(crawling, drain_results(collector, &mut writer, never));
    let metrics = crawled?;
    drained?;

    info!(
        "Local run finished: {} of {} site(s) sampled, {} page(s), results in {}",
        writer.written(),
        tasks.len(),
        metrics.pages_sampled,
        config.leader.results_file.display()
    );

    Ok(())
}

/// Send every task, waiting out unroutable periods, unless shut down first
async fn send_tasks(
    channel: &Channel<CrawlTask>,
    tasks: &[CrawlTask],
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    for task in tasks {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => {
                warn!("Stopped sending tasks at {}", task.site);
                return Ok(());
            }
            sent = channel.send_with_retry(task, backoff) => {
                sent.context(format!("Failed to send task for {}", task.site))?;
            }
        }
    }

    info!("Sent all {} task(s) to {}", tasks.len(), channel.queue());
    Ok(())
}

/// Persist each result, acking it only once its line is written
async fn drain_results(
    mut collector: Consumer<CrawlResult>,
    writer: &mut ResultWriter,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            delivery = collector.next_delivery() => delivery?,
        };

        let Some(delivery) = delivery else {
            break;
        };

        let (result, handle) = delivery.into_parts();
        info!("Writing result for {} to file", result.site);
        writer.append(&result).await?;
        handle.ack().await?;
    }

    collector.cancel().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowsingContext, FetchFailure, FetchOutcome, FetchedPage, PageFetcher};
    use async_trait::async_trait;
    use url::Url;

    /// Sites starting with "down" never answer; every other site is a
    /// landing page linking to /about
    struct TinyWeb;

    #[async_trait]
    impl ContextFactory for TinyWeb {
        async fn new_context(&self) -> Result<Box<dyn BrowsingContext>> {
            Ok(Box::new(TinyWeb))
        }
    }

    #[async_trait]
    impl PageFetcher for TinyWeb {
        async fn probe(&self, url: &Url) -> FetchOutcome<Url> {
            match url.host_str() {
                Some(host) if host.trim_start_matches("www.").starts_with("down") => {
                    Err(FetchFailure::Navigation("ERR_NAME_NOT_RESOLVED".to_string()))
                }
                _ => Ok(url.clone()),
            }
        }

        async fn fetch_page(&self, _url: &Url) -> FetchOutcome<FetchedPage> {
            Ok(FetchedPage {
                content_type: Some("text/html".to_string()),
                hrefs: vec![Some("/about".to_string())],
            })
        }
    }

    #[async_trait]
    impl BrowsingContext for TinyWeb {
        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    fn config_in(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.leader.results_file = dir.join("out").join("links.jsonl");
        config.leader.send_backoff_secs = 0;
        config.worker.max_workers = 2;
        config
    }

    fn read_results(config: &AppConfig) -> Vec<CrawlResult> {
        std::fs::read_to_string(&config.leader.results_file)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_local_run_writes_one_line_per_reachable_site() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let memory = MemoryTransport::new();
        let tasks = vec![
            CrawlTask::new(1, "a.com"),
            CrawlTask::new(2, "down.com"),
            CrawlTask::new(3, "b.org"),
        ];
        let (_stop, shutdown) = watch::channel(false);

        run_local(&memory, &config, tasks, Arc::new(TinyWeb), shutdown).await.unwrap();

        let mut results = read_results(&config);
        results.sort_by_key(|r| r.rank);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].site, "a.com");
        assert_eq!(results[1].site, "b.org");
        assert_eq!(results[1].urls.len(), 2);
        assert_eq!(memory.nack_count(), 0);
        assert_eq!(memory.unacked(), 0);
    }

    #[tokio::test]
    async fn test_leader_sends_tasks_and_persists_results() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let memory = MemoryTransport::new();
        let transport: Arc<dyn Transport> = Arc::new(memory.clone());
        let (stop, shutdown) = watch::channel(false);

        let leader = {
            let transport = transport.clone();
            let config = config.clone();
            let tasks = vec![CrawlTask::new(1, "a.com"), CrawlTask::new(2, "b.com")];
            tokio::spawn(async move { run_leader(transport, &config, tasks, false, shutdown).await })
        };

        // Stand-in worker
        let tasks: Channel<CrawlTask> = Channel::open(transport.clone(), &config.queues.tasks, false, false).await.unwrap();
        let results: Channel<CrawlResult> = Channel::open(transport.clone(), &config.queues.results, false, true).await.unwrap();
        let mut consumer = tasks.consume().await.unwrap();

        for _ in 0..2 {
            let (task, handle) = consumer.next_delivery().await.unwrap().unwrap().into_parts();
            let urls = vec![format!("https://{}/", task.site)];
            results.send_with_retry(&CrawlResult::from_task(task, urls), Duration::from_millis(5)).await.unwrap();
            handle.ack().await.unwrap();
        }

        // Two task acks plus two result acks from the leader
        tokio::time::timeout(Duration::from_secs(5), async {
            while memory.ack_count() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop.send(true).unwrap();
        leader.await.unwrap().unwrap();

        let results = read_results(&config);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].urls, vec!["https://a.com/".to_string()]);
        assert_eq!(memory.nack_count(), 0);
    }
}
