//! Batching and fee-bumping options.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

/// Fee-bumping protocol a wallet runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Rbf,
    Cpfp,
    #[serde(rename = "rbf-cpfp")]
    RbfCpfp,
    #[serde(rename = "multi-cpfp")]
    MultiCpfp,
}

impl Strategy {
    /// Single byte prefixing every storage key owned by this strategy.
    pub fn tag(&self) -> u8 {
        match self {
            Strategy::Rbf => 0x01,
            Strategy::Cpfp => 0x02,
            Strategy::RbfCpfp => 0x03,
            Strategy::MultiCpfp => 0x04,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Rbf => "rbf",
            Strategy::Cpfp => "cpfp",
            Strategy::RbfCpfp => "rbf-cpfp",
            Strategy::MultiCpfp => "multi-cpfp",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rbf" => Ok(Strategy::Rbf),
            "cpfp" => Ok(Strategy::Cpfp),
            "rbf-cpfp" => Ok(Strategy::RbfCpfp),
            "multi-cpfp" => Ok(Strategy::MultiCpfp),
            other => Err(format!("unknown strategy {other}")),
        }
    }
}

/// Urgency tier picked from the fee oracle's suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeeLevel {
    Low,
    Medium,
    #[default]
    High,
}

impl FeeLevel {
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => FeeLevel::Low,
            "medium" => FeeLevel::Medium,
            _ => FeeLevel::High,
        }
    }
}

// Unknown names fall back to the most aggressive level.
impl<'de> Deserialize<'de> for FeeLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(FeeLevel::parse_lenient(&s))
    }
}

/// Per-batch limits and fee policy. A zero limit means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    /// Maximum number of send outputs in a single batch.
    pub max_outputs: usize,
    /// Maximum number of wallet inputs in a single batch.
    pub max_inputs: usize,
    /// Age in seconds after which a pending batch is bumped even if the fee
    /// delta is below `min_fee_delta`.
    pub max_unconfirmed_age: u64,
    /// Maximum number of pending CPFP batches.
    pub max_batches: usize,
    /// Maximum number of requests in a single batch.
    pub max_batch_size: usize,
    pub fee_level: FeeLevel,
    /// Hard cap on the fee rate in sat/vB.
    pub max_fee_rate: u64,
    /// Smallest fee rate increase in sat/vB worth a replacement.
    pub min_fee_delta: u64,
    /// Largest fee rate increase in sat/vB accepted in one step.
    pub max_fee_delta: u64,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            max_outputs: 0,
            max_inputs: 0,
            max_unconfirmed_age: 0,
            max_batches: 0,
            max_batch_size: 0,
            fee_level: FeeLevel::High,
            max_fee_rate: 0,
            min_fee_delta: 0,
            max_fee_delta: 0,
        }
    }
}

/// Options of a single batcher wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherOptions {
    /// Tick period of the background loop, in seconds in configuration files.
    #[serde(with = "duration_secs")]
    pub pti: Duration,
    pub strategy: Strategy,
    pub tx_options: TxOptions,
    /// Timeout applied to every indexer, oracle and store call.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    /// Number of attempts when fetching a transaction from the indexer.
    pub tx_fetch_attempts: u32,
    /// Base backoff between transaction fetch attempts, multiplied by the
    /// attempt number.
    #[serde(with = "duration_millis")]
    pub tx_fetch_backoff: Duration,
    /// Iteration bound of the fee convergence loops.
    pub convergence_depth: u32,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            pti: Duration::from_secs(60),
            strategy: Strategy::Rbf,
            tx_options: TxOptions::default(),
            call_timeout: Duration::from_secs(5),
            tx_fetch_attempts: 3,
            tx_fetch_backoff: Duration::from_millis(500),
            convergence_depth: 10,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
