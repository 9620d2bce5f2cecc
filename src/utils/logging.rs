use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::PathBuf;
use std::fs;

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = build_filter(verbose, rust_log.as_deref())?;

    let fmt_layer = fmt::layer().with_target(true);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(log_file)?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// RUST_LOG, when set, replaces the default directives entirely
fn build_filter(verbose: bool, rust_log: Option<&str>) -> Result<EnvFilter> {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return Ok(EnvFilter::try_new(directives)?);
    }

    let level = if verbose { "debug" } else { "info" };

    Ok(EnvFilter::default()
        .add_directive("warn".parse()?)
        .add_directive(format!("link_sampler={}", level).parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_follow_verbosity() {
        let quiet = build_filter(false, None).unwrap().to_string();
        assert!(quiet.contains("link_sampler=info"));

        let verbose = build_filter(true, Some("  ")).unwrap().to_string();
        assert!(verbose.contains("link_sampler=debug"));
        assert!(verbose.contains("warn"));
    }

    #[test]
    fn test_rust_log_overrides_crate_level() {
        let filter = build_filter(true, Some("link_sampler=trace")).unwrap().to_string();

        assert!(filter.contains("link_sampler=trace"));
        assert!(!filter.contains("link_sampler=debug"));
    }

    #[test]
    fn test_invalid_rust_log_is_an_error() {
        assert!(build_filter(false, Some("link_sampler=loud")).is_err());
    }
}
