use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::browser::fetcher::ContextFactory;
use crate::crawler::navigator::InternalNavigator;
use crate::crawler::task::{CrawlResult, CrawlTask};
use crate::queue::{Channel, Consumer, Delivery};
use crate::utils::metrics::{Metrics, MetricsCollector};

/// Settings for one pool run
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Crawl units allowed in flight at once
    pub concurrency_limit: usize,
    /// Pages to collect per site
    pub sample_size: usize,
    pub unit_timeout: Duration,
    pub exclude_patterns: Vec<String>,
    /// Wait between attempts to publish an unroutable result
    pub send_backoff: Duration,
}

/// Runs crawl units for tasks from a queue with bounded concurrency.
///
/// The pool is a fixed set of slots. Every slot owns one prefetch-1
/// subscription to the task queue and holds a permit from a shared
/// semaphore while its unit runs, so neither the broker nor the process
/// ever has more than `concurrency_limit` tasks outstanding.
pub struct WorkerPool {
    contexts: Arc<dyn ContextFactory>,
    settings: Arc<PoolSettings>,
    metrics: MetricsCollector,
}

impl WorkerPool {
    pub fn new(contexts: Arc<dyn ContextFactory>, settings: PoolSettings) -> Self {
        Self {
            contexts,
            settings: Arc::new(settings),
            metrics: MetricsCollector::new(),
        }
    }

    /// Consume tasks until every subscription ends or `shutdown` turns true,
    /// then wait for in-flight units to finish.
    ///
    /// A failing slot halts its siblings. They finish the unit they hold
    /// before stopping, and the first error is returned.
    pub async fn run(
        &self,
        tasks: &Channel<CrawlTask>,
        results: Arc<Channel<CrawlResult>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Metrics> {
        let limit = self.settings.concurrency_limit.max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let (halt, halted) = watch::channel(false);
        let mut slots = JoinSet::new();

        for id in 0..limit {
            let consumer = match tasks.consume().await {
                Ok(consumer) => consumer,
                Err(e) => {
                    halt.send_replace(true);
                    while slots.join_next().await.is_some() {}
                    return Err(e).context(format!("Failed to subscribe slot {} to {}", id, tasks.queue()));
                }
            };

            let slot = Slot {
                id,
                consumer,
                permits: permits.clone(),
                shutdown: shutdown.clone(),
                halt: halted.clone(),
                unit: CrawlUnit {
                    results: results.clone(),
                    contexts: self.contexts.clone(),
                    settings: self.settings.clone(),
                    metrics: self.metrics.clone(),
                },
            };

            slots.spawn(slot.run());
        }

        info!("Worker pool started with {} slot(s) on {}", limit, tasks.queue());

        let mut first_error: Option<anyhow::Error> = None;

        while let Some(joined) = slots.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => anyhow::Error::new(e).context("Worker slot panicked"),
            };

            error!("Worker slot failed: {:#}", failure);
            if first_error.is_none() {
                halt.send_replace(true);
                first_error = Some(failure);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let metrics = self.metrics.snapshot().await;
        info!(
            "Worker pool drained after {}s: {} task(s), {} result(s), {} unreachable, peak {} in flight",
            self.metrics.elapsed_secs().await,
            metrics.tasks_received,
            metrics.results_published,
            metrics.sites_unreachable,
            metrics.peak_in_flight
        );

        Ok(metrics)
    }
}

/// One execution slot of the pool
struct Slot {
    id: usize,
    consumer: Consumer<CrawlTask>,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    /// Set by the pool once a sibling slot has failed
    halt: watch::Receiver<bool>,
    unit: CrawlUnit,
}

/// Everything a slot needs to turn one task into a settled delivery
struct CrawlUnit {
    results: Arc<Channel<CrawlResult>>,
    contexts: Arc<dyn ContextFactory>,
    settings: Arc<PoolSettings>,
    metrics: MetricsCollector,
}

impl Slot {
    async fn run(mut self) -> Result<()> {
        let outcome = self.consume_loop().await;

        if let Err(e) = self.consumer.cancel().await {
            warn!("Slot {} could not cancel its consumer: {}", self.id, e);
        }

        outcome
    }

    async fn consume_loop(&mut self) -> Result<()> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => {
                    debug!("Slot {} stopping on shutdown", self.id);
                    return Ok(());
                }
                _ = self.halt.wait_for(|halted| *halted) => {
                    debug!("Slot {} halting after a sibling failed", self.id);
                    return Ok(());
                }
                delivery = self.consumer.next_delivery() => delivery?,
            };

            let Some(delivery) = delivery else {
                debug!("Slot {} subscription ended", self.id);
                return Ok(());
            };

            let _permit = self.permits.clone().acquire_owned().await?;
            self.unit.run(delivery).await?;
        }
    }
}

impl CrawlUnit {
    /// Crawl one site, publish its result and settle the task.
    /// Every crawl outcome ends in an ack; the task is never nacked.
    async fn run(&self, delivery: Delivery<CrawlTask>) -> Result<()> {
        let (task, handle) = delivery.into_parts();

        self.metrics.record_task_received().await;
        self.metrics.unit_started().await;
        info!("Starting work: {} (rank {})", task.site, task.rank);

        let crawled = self.crawl(&task.site).await;
        self.metrics.unit_finished().await;

        match crawled? {
            Some(urls) => {
                let pages = urls.len();
                let site = task.site.clone();
                let result = CrawlResult::from_task(task, urls);

                self.results
                    .send_with_retry(&result, self.settings.send_backoff)
                    .await
                    .context(format!("Failed to publish result for {}", site))?;

                self.metrics.record_result(pages).await;
                info!("Published {} page(s) for {}", pages, site);
            }
            None => {
                self.metrics.record_unreachable().await;
                info!("Failed to crawl: {}", task.site);
            }
        }

        handle.ack().await?;
        self.metrics.record_task_acked().await;

        Ok(())
    }

    /// Sampled pages, or `None` when the site could not be crawled.
    /// Only failing to open a browsing context is an error.
    async fn crawl(&self, site: &str) -> Result<Option<Vec<String>>> {
        let context = self
            .contexts
            .new_context()
            .await
            .context("Failed to open browsing context")?;

        let navigator = InternalNavigator::new(
            context.as_ref(),
            &self.settings.exclude_patterns,
            StdRng::from_entropy(),
        );

        let outcome = tokio::time::timeout(
            self.settings.unit_timeout,
            navigator.visit(site, self.settings.sample_size),
        )
        .await;

        if let Err(e) = context.close().await {
            warn!("Failed to close browsing context for {}: {:#}", site, e);
        }

        Ok(match outcome {
            Ok(Ok(urls)) => Some(urls),
            Ok(Err(e)) => {
                warn!("{}", e);
                None
            }
            Err(_) => {
                warn!("{}: crawl exceeded {:?}", site, self.settings.unit_timeout);
                None
            }
        })
    }
}
