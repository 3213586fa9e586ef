//! # Batcher Config
//!
//! Configuration options for a batcher wallet.
//!
//! Options can be read from a TOML file or from `BATCHER_*` environment
//! variables. File contents are described by the [`BatcherConfig`] struct;
//! every field has a default so partial files are accepted.

use batcher_errors::BatcherError;
use bitcoin::Network;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use std::{fs::File, io::Read, path::PathBuf};

pub mod env;
pub mod options;

pub use env::{read_string_from_env, read_string_from_env_then_parse};
pub use options::{BatcherOptions, FeeLevel, Strategy, TxOptions};

/// Configuration of a batcher process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Bitcoin network the wallet and all send addresses belong to.
    pub network: Network,
    /// Base URL of an Esplora-compatible indexer, e.g. `https://blockstream.info/api`.
    pub indexer_url: String,
    /// Base URL of a mempool.space-compatible fee API.
    pub fee_api_url: String,
    /// Directory of the sled database. If None, state is kept in memory and
    /// lost on restart.
    pub db_path: Option<PathBuf>,
    /// Hex encoded secret key of the wallet.
    pub secret_key: SecretString,
    /// Log level, 0 (off) to 5 (trace).
    pub log_level: u8,
    pub batcher: BatcherOptions,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            indexer_url: "http://127.0.0.1:3002".to_string(),
            fee_api_url: "http://127.0.0.1:3006/api/v1/fees/recommended".to_string(),
            db_path: None,
            secret_key: SecretString::from(String::new()),
            log_level: 3,
            batcher: BatcherOptions::default(),
        }
    }
}

impl BatcherConfig {
    /// Create a new `BatcherConfig` with default values.
    pub fn new() -> Self {
        BatcherConfig::default()
    }

    /// Parse a `BatcherConfig` from the TOML file at `path`.
    pub fn try_parse_file(path: PathBuf) -> Result<Self, BatcherError> {
        let mut contents = String::new();

        let mut file = match File::open(path.clone()) {
            Ok(f) => f,
            Err(e) => return Err(BatcherError::ConfigError(e.to_string())),
        };

        if let Err(e) = file.read_to_string(&mut contents) {
            return Err(BatcherError::ConfigError(e.to_string()));
        }

        tracing::trace!("Using configuration file: {:?}", path);

        BatcherConfig::try_parse_from(contents)
    }

    /// Try to parse a `BatcherConfig` from given TOML formatted string.
    pub fn try_parse_from(input: String) -> Result<Self, BatcherError> {
        let config = toml::from_str::<BatcherConfig>(&input)
            .map_err(|e| BatcherError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration from `BATCHER_*` environment variables.
    /// Unset optional variables keep their default.
    pub fn from_env() -> Result<Self, BatcherError> {
        let defaults = BatcherConfig::default();
        let default_opts = defaults.batcher.clone();

        let network = read_string_from_env_then_parse::<Network>("BATCHER_NETWORK")?;
        let indexer_url = read_string_from_env("BATCHER_INDEXER_URL")?;
        let fee_api_url = read_string_from_env("BATCHER_FEE_API_URL")?;
        let secret_key = SecretString::from(read_string_from_env("BATCHER_SECRET_KEY")?);
        let db_path = std::env::var("BATCHER_DB_PATH").ok().map(PathBuf::from);

        let log_level = optional_env("BATCHER_LOG_LEVEL", defaults.log_level)?;
        let strategy = optional_env("BATCHER_STRATEGY", default_opts.strategy)?;
        let pti = Duration::from_secs(optional_env(
            "BATCHER_PTI_SECS",
            default_opts.pti.as_secs(),
        )?);
        let call_timeout = Duration::from_secs(optional_env(
            "BATCHER_CALL_TIMEOUT_SECS",
            default_opts.call_timeout.as_secs(),
        )?);

        let tx_defaults = default_opts.tx_options.clone();
        let tx_options = TxOptions {
            max_outputs: optional_env("BATCHER_MAX_OUTPUTS", tx_defaults.max_outputs)?,
            max_inputs: optional_env("BATCHER_MAX_INPUTS", tx_defaults.max_inputs)?,
            max_unconfirmed_age: optional_env(
                "BATCHER_MAX_UNCONFIRMED_AGE",
                tx_defaults.max_unconfirmed_age,
            )?,
            max_batches: optional_env("BATCHER_MAX_BATCHES", tx_defaults.max_batches)?,
            max_batch_size: optional_env("BATCHER_MAX_BATCH_SIZE", tx_defaults.max_batch_size)?,
            fee_level: std::env::var("BATCHER_FEE_LEVEL")
                .map(|s| FeeLevel::parse_lenient(&s))
                .unwrap_or(tx_defaults.fee_level),
            max_fee_rate: optional_env("BATCHER_MAX_FEE_RATE", tx_defaults.max_fee_rate)?,
            min_fee_delta: optional_env("BATCHER_MIN_FEE_DELTA", tx_defaults.min_fee_delta)?,
            max_fee_delta: optional_env("BATCHER_MAX_FEE_DELTA", tx_defaults.max_fee_delta)?,
        };

        let config = BatcherConfig {
            network,
            indexer_url,
            fee_api_url,
            db_path,
            secret_key,
            log_level,
            batcher: BatcherOptions {
                pti,
                strategy,
                tx_options,
                call_timeout,
                ..default_opts
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks values that serde defaults can not guard.
    pub fn validate(&self) -> Result<(), BatcherError> {
        if self.secret_key.expose_secret().is_empty() {
            return Err(BatcherError::ConfigError("secret_key is not set".to_string()));
        }
        if self.indexer_url.is_empty() {
            return Err(BatcherError::ConfigError("indexer_url is empty".to_string()));
        }
        if self.batcher.pti.is_zero() {
            return Err(BatcherError::ConfigError("pti must be positive".to_string()));
        }
        if self.batcher.convergence_depth == 0 {
            return Err(BatcherError::ConfigError(
                "convergence_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn optional_env<T: FromStr>(var_name: &'static str, default: T) -> Result<T, BatcherError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var_name) {
        Ok(_) => read_string_from_env_then_parse::<T>(var_name),
        Err(_) => Ok(default),
    }
}
