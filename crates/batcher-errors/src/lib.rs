//! # Batcher Errors
//!
//! This crate defines the error types shared by the batcher crates, the main
//! error wrapper ([`BatcherError`]) and extension traits for error/result
//! conversion.
//!
//! ## Error Hierarchy
//!
//! 1. **Domain-specific errors** - Errors for a single subsystem, e.g.
//!    [`StoreError`] for the persistent cache, [`BroadcastError`] for
//!    classified broadcast rejections and [`FeeErr`] for the fee oracle.
//!
//! 2. **[`BatcherError`]** - The main error wrapper that:
//!    - Wraps domain-specific errors
//!    - Carries the batching/fee-bumping outcomes the background loop branches on
//!    - Wraps arbitrary context as an `eyre::Report`
//!
//! Errors the loop treats as routine ([`BatcherError::BatchParametersNotMet`],
//! [`BatcherError::FeeUpdateNotNeeded`]) are recognized with
//! [`BatcherError::is_benign`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use batcher_errors::{BatcherError, ResultExt};
//!
//! fn save() -> Result<(), BatcherError> {
//!     Err(eyre::eyre!("disk is gone").into())
//! }
//!
//! fn example() -> Result<(), eyre::Report> {
//!     save().map_to_eyre()?;
//!     Ok(())
//! }
//! ```

use bitcoin::Txid;
use core::fmt::Debug;
use reqwest::StatusCode;
use thiserror::Error;

// ============================================================================
// Module-level errors
// ============================================================================

/// Errors of the persistent state layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found in store: {0}")]
    NotFound(String),
    #[error("Entry already exists in store: {0}")]
    AlreadyExists(String),
    #[error("Nothing to update")]
    NothingToUpdate,

    #[error("Key-value engine error: {0}")]
    Engine(#[from] sled::Error),
    #[error("Failed to encode/decode stored value: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Stored value is corrupted: {0}")]
    Corrupted(String),
    #[error("Store lock is poisoned")]
    Poisoned,
}

/// Classified rejections returned by the indexer when broadcasting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("Transaction already in block chain")]
    AlreadyInChain,
    #[error("Transaction conflicts with a mempool transaction")]
    MempoolConflict,
    #[error("Transaction inputs are missing or already spent")]
    InputsMissingOrSpent,
    #[error("Replacement does not pay enough to evict the transactions it conflicts with")]
    InsufficientReplacementFee,
    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

impl BroadcastError {
    /// Classifies a raw node/indexer rejection message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("already in block chain") || lower.contains("txn-already-known") {
            BroadcastError::AlreadyInChain
        } else if lower.contains("txn-mempool-conflict") {
            BroadcastError::MempoolConflict
        } else if lower.contains("insufficient fee") {
            BroadcastError::InsufficientReplacementFee
        } else if lower.contains("missingorspent")
            || lower.contains("missing-inputs")
            || lower.contains("missing inputs")
        {
            BroadcastError::InputsMissingOrSpent
        } else {
            BroadcastError::Rejected(message.to_string())
        }
    }
}

/// Fee estimation errors.
#[derive(Debug, Error)]
pub enum FeeErr {
    #[error("request timed out")]
    Timeout,
    #[error("transport/decode error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(StatusCode),
    #[error("json decode error: {0}")]
    JsonDecode(reqwest::Error),
    #[error("fee suggestion field not found or invalid in API response")]
    MissingField,
}

/// Errors of the indexer client outside of broadcast classification.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Indexer transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Indexer returned http status {0}: {1}")]
    Status(StatusCode, String),
    #[error("Failed to decode indexer response: {0}")]
    Decode(String),
}

// ============================================================================
// Batcher Error - Main crate-level error wrapper
// ============================================================================

/// Errors returned by the batcher.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BatcherError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Broadcast failed: {0}")]
    Broadcast(#[from] BroadcastError),
    #[error("Fee estimation failed: {0}")]
    Fee(#[from] FeeErr),
    #[error("Indexer error: {0}")]
    Indexer(#[from] IndexerError),

    // Expected outcomes of a tick
    #[error("Batch parameters not met")]
    BatchParametersNotMet,
    #[error("Fee update not needed")]
    FeeUpdateNotNeeded,

    // Policy rejections
    #[error("Fee estimate of {required} sat/vB is above the limit of {max} sat/vB")]
    HighFeeEstimate { required: u64, max: u64 },
    #[error("Fee delta of {delta} sat/vB is above the limit of {max} sat/vB")]
    FeeDeltaHigh { delta: u64, max: u64 },

    // Convergence
    #[error("Failed to build RBF transaction: depth exceeded")]
    BuildRbfDepthExceeded,
    #[error("Failed to build CPFP transaction: depth exceeded")]
    CpfpDepthExceeded,

    // Invariant violations
    #[error("CPFP batching is corrupted: {0}")]
    CpfpBatchingCorrupted(String),
    #[error("CPFP fee update parameters not met")]
    CpfpFeeUpdateParamsNotMet,
    #[error("Found {0} confirmed batches among pending batches, expected at most one")]
    MultipleConfirmedBatches(usize),

    #[error("Failed to save batch {txid}: {source}")]
    SavingBatch { txid: Txid, source: StoreError },

    // Lifecycle
    #[error("Batcher is still running")]
    BatcherStillRunning,
    #[error("Batcher is not running")]
    BatcherNotRunning,
    #[error("Strategy {0} is not implemented")]
    StrategyNotImplemented(String),

    #[error("Insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("Transaction {0} not found")]
    TxNotFound(Txid),
    #[error("Call timed out: {0}")]
    Timeout(&'static str),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Missing environment variable {1}: {0}")]
    EnvVarNotSet(std::env::VarError, &'static str),
    #[error("Environment variable {0} is malformed: {1}")]
    EnvVarMalformed(&'static str, String),

    // Base wrapper for eyre
    #[error(transparent)]
    Eyre(#[from] eyre::Report),
}

impl BatcherError {
    /// Returns true for outcomes that the background loop expects on a
    /// regular basis and must not report as failures.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            BatcherError::BatchParametersNotMet | BatcherError::FeeUpdateNotNeeded
        )
    }

    /// Returns true if the error is a store lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BatcherError::Store(StoreError::NotFound(_)))
    }
}

// ============================================================================
// Extension traits
// ============================================================================

/// Extension trait for errors to easily convert them to eyre::Report through
/// BatcherError.
pub trait ErrorExt: Sized {
    /// Converts the error into an eyre::Report, first wrapping in
    /// BatcherError if necessary. It does not rewrap in eyre::Report if
    /// the given error is already an eyre::Report.
    fn into_eyre(self) -> eyre::Report;
}

/// Extension trait for results to easily convert them to eyre::Report
/// through BatcherError.
pub trait ResultExt: Sized {
    type Output;

    fn map_to_eyre(self) -> Result<Self::Output, eyre::Report>;
}

impl<T: Into<BatcherError>> ErrorExt for T {
    fn into_eyre(self) -> eyre::Report {
        match self.into() {
            BatcherError::Eyre(report) => report,
            other => eyre::eyre!(other),
        }
    }
}

impl<U: Sized, T: Into<BatcherError>> ResultExt for Result<U, T> {
    type Output = U;

    fn map_to_eyre(self) -> Result<Self::Output, eyre::Report> {
        self.map_err(ErrorExt::into_eyre)
    }
}
