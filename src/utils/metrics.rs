use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Counters for one worker pool run
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Metrics {
    pub start_time: DateTime<Utc>,

    /// Tasks pulled from the queue
    pub tasks_received: usize,

    /// Tasks settled with an ack
    pub tasks_acked: usize,

    /// Sites where no origin answered, or the unit ran out of time
    pub sites_unreachable: usize,

    pub results_published: usize,

    /// Sum of `urls` lengths over published results
    pub pages_sampled: usize,

    pub units_in_flight: usize,

    /// Highest `units_in_flight` seen so far
    pub peak_in_flight: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    pub async fn record_task_received(&self) {
        self.metrics.lock().await.tasks_received += 1;
    }

    pub async fn record_task_acked(&self) {
        self.metrics.lock().await.tasks_acked += 1;
    }

    pub async fn record_unreachable(&self) {
        self.metrics.lock().await.sites_unreachable += 1;
    }

    pub async fn record_result(&self, pages: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.results_published += 1;
        metrics.pages_sampled += pages;
    }

    pub async fn unit_started(&self) {
        let mut metrics = self.metrics.lock().await;
        metrics.units_in_flight += 1;
        metrics.peak_in_flight = metrics.peak_in_flight.max(metrics.units_in_flight);
    }

    pub async fn unit_finished(&self) {
        let mut metrics = self.metrics.lock().await;
        metrics.units_in_flight = metrics.units_in_flight.saturating_sub(1);
    }

    /// Get all metrics
    pub async fn snapshot(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Seconds since the collector was created
    pub async fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.metrics.lock().await.start_time).num_seconds()
    }
}
