//! # Fee Calculator
//!
//! Fee level selection, aggregate fee obligations of pending batches, update
//! validation and dust filtering. All rates are in sat/vB.

use crate::indexer::FeeEstimator;
use crate::types::{Batch, FeeSuggestion, Utxo};
use batcher_config::{FeeLevel, TxOptions};
use batcher_errors::BatcherError;
use bitcoin::Amount;

/// Smallest output value the engine creates.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Minimum relay fee rate, also the incremental relay rate of replacements.
pub const MIN_RELAY_FEE_RATE: u64 = 1;

/// Picks the oracle's rate for `level`.
pub fn select_fee(suggestion: &FeeSuggestion, level: FeeLevel) -> u64 {
    match level {
        FeeLevel::Low => suggestion.low,
        FeeLevel::Medium => suggestion.medium,
        FeeLevel::High => suggestion.high,
    }
}

/// Queries the oracle and returns the required rate for the configured level,
/// never below the minimum relay rate.
pub async fn required_fee_rate<F: FeeEstimator + ?Sized>(
    estimator: &F,
    opts: &TxOptions,
) -> Result<u64, BatcherError> {
    let suggestion = estimator.fee_suggestion().await?;
    let rate = select_fee(&suggestion, opts.fee_level).max(MIN_RELAY_FEE_RATE);
    tracing::debug!(rate, level = ?opts.fee_level, "Required fee rate");
    Ok(rate)
}

/// Aggregate fee figures over a set of pending batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeStats {
    pub max_fee_rate: u64,
    /// Lowest per-batch rate, 0 when there are no batches.
    pub min_fee_rate: u64,
    /// Summed virtual size.
    pub total_size: u64,
    /// Satoshis needed to lift every underpriced batch to the required rate.
    pub fee_delta: u64,
}

pub fn calculate_fee_stats(required_fee_rate: u64, batches: &[Batch]) -> FeeStats {
    let mut stats = FeeStats::default();
    for (i, batch) in batches.iter().enumerate() {
        let size = batch.tx.vsize();
        let rate = batch.tx.fee_rate();

        stats.max_fee_rate = stats.max_fee_rate.max(rate);
        stats.min_fee_rate = if i == 0 { rate } else { stats.min_fee_rate.min(rate) };
        stats.total_size += size;
        stats.fee_delta += required_fee_rate.saturating_sub(rate) * size;
    }
    stats
}

/// Accepts a bump from `current` to `required` or explains why not.
///
/// A zero limit in `opts` disables that check.
pub fn validate_update(current: u64, required: u64, opts: &TxOptions) -> Result<(), BatcherError> {
    validate_update_with_age(current, required, opts, None)
}

/// Like [`validate_update`], but a pending batch older than
/// `max_unconfirmed_age` skips the `min_fee_delta` guard.
pub fn validate_update_with_age(
    current: u64,
    required: u64,
    opts: &TxOptions,
    oldest_pending_age: Option<u64>,
) -> Result<(), BatcherError> {
    if required <= current {
        return Err(BatcherError::FeeUpdateNotNeeded);
    }

    let delta = required - current;
    let stale = opts.max_unconfirmed_age > 0
        && oldest_pending_age.is_some_and(|age| age >= opts.max_unconfirmed_age);

    if opts.min_fee_delta > 0 && delta < opts.min_fee_delta && !stale {
        return Err(BatcherError::FeeUpdateNotNeeded);
    }
    if opts.max_fee_delta > 0 && delta > opts.max_fee_delta {
        return Err(BatcherError::FeeDeltaHigh {
            delta,
            max: opts.max_fee_delta,
        });
    }
    if opts.max_fee_rate > 0 && required > opts.max_fee_rate {
        return Err(BatcherError::HighFeeEstimate {
            required,
            max: opts.max_fee_rate,
        });
    }

    Ok(())
}

/// Drops UTXOs that can not pay for their own input at `fee_rate`.
pub fn filter_dust(utxos: Vec<Utxo>, fee_rate: u64, input_vsize: u64) -> Vec<Utxo> {
    let input_cost = fee_rate * input_vsize;
    utxos
        .into_iter()
        .filter(|u| u.value.to_sat() > input_cost)
        .collect()
}

/// Absolute fee floor of a transaction of `vsize` at the minimum relay rate.
pub fn min_relay_fee(vsize: u64) -> u64 {
    vsize * MIN_RELAY_FEE_RATE
}
