pub mod fetcher;
pub mod fingerprint;
pub mod http;
pub mod session;

// Re-export common types
pub use fetcher::{BrowsingContext, ContextFactory, FetchFailure, FetchOutcome, FetchedPage, PageFetcher};
pub use fingerprint::FingerprintManager;
pub use http::HttpContextFactory;
pub use session::WebDriverFactory;
