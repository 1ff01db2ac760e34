//! Configuration management.
//!
//! Configuration is loaded from a YAML file (default `config.yaml`) and then
//! overridden by environment variables prefixed with `PREDICTION_QUEUE_`.
//! Double underscores separate nested keys:
//!
//! ```bash
//! PREDICTION_QUEUE_MODEL_PATH=/models/churn.json
//! PREDICTION_QUEUE_QUEUE__MAX_QUEUE_SIZE=20
//! PREDICTION_QUEUE_EXECUTOR__MODE=isolated
//! PREDICTION_QUEUE_DAEMON__RETENTION=2h
//! ```
//!
//! A full file looks like this (every key is optional):
//!
//! ```yaml
//! model_path: model.json
//! queue:
//!   max_queue_size: 100
//!   max_batch_size: 10000
//!   chunk_size: 100
//!   return_probabilities: true
//!   drain_interval: 100ms
//! executor:
//!   max_workers: 8
//!   mode: threads
//! daemon:
//!   process_interval: 1s
//!   cleanup_interval: 5m
//!   retention: 60m
//!   status_log_interval: 30s
//! ```

use std::path::PathBuf;

use anyhow::ensure;
use clap::Parser;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::daemon::DaemonConfig;
use crate::executor::ExecutorConfig;
use crate::queue::QueueConfig;

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(
        short = 'f',
        long,
        env = "PREDICTION_QUEUE_CONFIG",
        default_value = "config.yaml"
    )]
    pub config: String,

    /// Validate configuration and exit.
    #[arg(long)]
    pub validate: bool,

    /// JSON-lines file to submit, one batch (an array of feature vectors) per line
    #[arg(short, long)]
    pub input: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Linear model file loaded at startup
    pub model_path: PathBuf,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.json"),
            queue: QueueConfig::default(),
            executor: ExecutorConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config
            .validate()
            .map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(
                Env::prefixed("PREDICTION_QUEUE_")
                    .ignore(&["config"])
                    .split("__"),
            )
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.queue.max_queue_size > 0,
            "Config validation: queue.max_queue_size must be greater than zero"
        );
        ensure!(
            self.queue.max_batch_size > 0,
            "Config validation: queue.max_batch_size must be greater than zero"
        );
        ensure!(
            self.queue.chunk_size > 0,
            "Config validation: queue.chunk_size must be greater than zero"
        );
        ensure!(
            !self.daemon.process_interval.is_zero(),
            "Config validation: daemon.process_interval must be greater than zero"
        );
        ensure!(
            !self.daemon.cleanup_interval.is_zero(),
            "Config validation: daemon.cleanup_interval must be greater than zero"
        );
        Ok(())
    }
}
