pub mod frontier;
pub mod navigator;
pub mod pool;
pub mod task;

// Re-export common types
pub use navigator::{CrawlError, InternalNavigator};
pub use pool::{PoolSettings, WorkerPool};
pub use task::{CrawlResult, CrawlTask};
