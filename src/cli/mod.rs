pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::AppConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Broker connection overrides shared by leader and worker
#[derive(clap::Args, Debug, Default)]
pub struct BrokerArgs {
    /// Broker host name
    #[arg(long)]
    pub host: Option<String>,

    /// Broker user name
    #[arg(short, long)]
    pub username: Option<String>,

    /// Broker password
    #[arg(short, long, env = "LINK_SAMPLER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue one task per site and collect results into a file
    Leader {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Keep queued tasks and results and append to the results file
        #[arg(short, long)]
        resume: bool,

        /// Site list (CSV with a `site` column)
        #[arg(short, long)]
        sites: Option<PathBuf>,

        /// Results file (one JSON object per line)
        #[arg(long)]
        results: Option<PathBuf>,
    },

    /// Consume tasks and publish sampled internal links
    Worker {
        #[command(flatten)]
        broker: BrokerArgs,

        /// Crawl units allowed to run at once
        #[arg(short, long)]
        max_workers: Option<usize>,
    },

    /// Run leader and workers in one process without a broker
    Local {
        /// Site list (CSV with a `site` column)
        #[arg(short, long)]
        sites: Option<PathBuf>,

        /// Results file (one JSON object per line)
        #[arg(long)]
        results: Option<PathBuf>,

        /// Crawl units allowed to run at once
        #[arg(short, long)]
        max_workers: Option<usize>,
    },

    /// Show the effective configuration
    Config,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Leader { broker, resume, sites, results } => {
            broker.apply(&mut config);
            if let Some(sites) = sites {
                config.leader.sites_file = sites;
            }
            if let Some(results) = results {
                config.leader.results_file = results;
            }

            info!("Starting leader (resume: {})", resume);
            commands::leader(config, resume).await
        }
        Commands::Worker { broker, max_workers } => {
            broker.apply(&mut config);
            if let Some(max_workers) = max_workers {
                config.worker.max_workers = max_workers;
            }

            info!("Starting worker with {} slot(s)", config.worker.max_workers);
            commands::worker(config).await
        }
        Commands::Local { sites, results, max_workers } => {
            if let Some(sites) = sites {
                config.leader.sites_file = sites;
            }
            if let Some(results) = results {
                config.leader.results_file = results;
            }
            if let Some(max_workers) = max_workers {
                config.worker.max_workers = max_workers;
            }

            info!("Starting local run");
            commands::local(config).await
        }
        Commands::Config => commands::show_config(&config),
    }
}

impl BrokerArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.broker.host = host.clone();
        }
        if let Some(username) = &self.username {
            config.broker.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.broker.password = password.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_leader_flags() {
        let cli = Cli::try_parse_from([
            "link-sampler",
            "leader",
            "--host",
            "broker.local",
            "-u",
            "ews",
            "--resume",
            "--sites",
            "top.csv",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Leader { broker, resume, sites, results } => {
                assert_eq!(broker.host.as_deref(), Some("broker.local"));
                assert_eq!(broker.username.as_deref(), Some("ews"));
                assert!(resume);
                assert_eq!(sites, Some(PathBuf::from("top.csv")));
                assert!(results.is_none());
            }
            _ => panic!("expected leader"),
        }
    }

    #[test]
    fn test_broker_overrides() {
        let mut config = AppConfig::default();
        let args = BrokerArgs {
            host: Some("rabbit".to_string()),
            username: None,
            password: Some("secret".to_string()),
        };

        args.apply(&mut config);

        assert_eq!(config.broker.host, "rabbit");
        assert_eq!(config.broker.username, "ews");
        assert_eq!(config.broker.password, "secret");
    }
}
