//! Configuration loading: a YAML file merged with environment variable overrides.
//!
//! Sources are merged in order, later overriding earlier:
//!
//! 1. **YAML config file** — base configuration (default: `config.yaml`).
//! 2. **Environment variables** — prefixed `WEBHOOK_DISPATCH_`, double underscores
//!    address nested fields (e.g. `WEBHOOK_DISPATCH_BATCHING__MAX_SIZE=20`).
//!
//! Grounded on `dwctl/src/config.rs`'s `Args`/`Config::load` pairing of `clap` +
//! `figment` (YAML + env providers), scaled down to this crate's much smaller
//! configuration surface.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::batcher::BatchingConfig as CoreBatchingConfig;
use crate::engine::EngineConfig;
use crate::retry::RetryConfig as CoreRetryConfig;
use crate::subscription::ShutdownConfig as CoreShutdownConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file.
    #[arg(short = 'f', long, env = "WEBHOOK_DISPATCH_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Validate configuration and exit without starting the engine.
    #[arg(long)]
    pub validate: bool,
}

/// Root configuration, mirroring [`EngineConfig`] field-for-field in a
/// (de)serializable, human-readable form.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// `None` disables Batched delivery modes entirely (§6.3): a webhook configured
    /// for batched delivery then has its events rejected with `InvalidStateChangeError`
    /// rather than falling back to some default window. Set `batching: null` in YAML
    /// or unset `WEBHOOK_DISPATCH_BATCHING__*` to opt out.
    pub batching: Option<BatchingConfig>,
    pub retry: RetryConfig,
    pub shutdown: ShutdownConfig,
    /// Capacity of the error channel's broadcast buffer (§4.6).
    pub error_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batching: Some(BatchingConfig::default()),
            retry: RetryConfig::default(),
            shutdown: ShutdownConfig::default(),
            error_buffer: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_size: usize,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        let core = CoreBatchingConfig::default();
        Self { max_size: core.max_size, max_wait: core.max_wait }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    #[serde(with = "humantime_serde")]
    pub failure_horizon: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let core = CoreRetryConfig::default();
        Self { base: core.base, max: core.max, failure_horizon: core.failure_horizon }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(with = "humantime_serde")]
    pub drain_deadline: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        let core = CoreShutdownConfig::default();
        Self { drain_deadline: core.drain_deadline }
    }
}

impl Config {
    /// Load from `args.config`, merging `WEBHOOK_DISPATCH_`-prefixed environment
    /// variables on top (double-underscore-separated for nested fields).
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let config: Config = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("WEBHOOK_DISPATCH_").split("__"))
            .extract()?;
        Ok(config)
    }
}

impl From<Config> for EngineConfig {
    fn from(config: Config) -> Self {
        EngineConfig {
            batching: config.batching.map(|b| CoreBatchingConfig { max_size: b.max_size, max_wait: b.max_wait }),
            retry: CoreRetryConfig {
                base: config.retry.base,
                max: config.retry.max,
                failure_horizon: config.retry.failure_horizon,
            },
            shutdown: CoreShutdownConfig { drain_deadline: config.shutdown.drain_deadline },
            error_buffer: config.error_buffer,
        }
    }
}
