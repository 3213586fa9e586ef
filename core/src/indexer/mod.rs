//! # Indexer and Fee Oracle
//!
//! Chain access used by the engines. [`IndexerClient`] reads UTXOs and
//! transactions and broadcasts; [`FeeEstimator`] suggests fee rates.

pub mod esplora;
pub mod mempool;

use crate::types::{FeeSuggestion, IndexedTx, Utxo};
use crate::utils::with_timeout;
use async_trait::async_trait;
use batcher_errors::{BatcherError, BroadcastError, FeeErr};
use bitcoin::{Address, Transaction, Txid};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::RetryIf;

pub use esplora::EsploraClient;
pub use mempool::MempoolFeeEstimator;

#[async_trait]
pub trait IndexerClient: Send + Sync + 'static {
    /// Confirmed and unconfirmed UTXOs of `address`.
    async fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>, BatcherError>;

    /// # Errors
    ///
    /// [`BatcherError::TxNotFound`] if the indexer does not know `txid`.
    async fn get_tx(&self, txid: Txid) -> Result<IndexedTx, BatcherError>;

    /// # Errors
    ///
    /// Rejections are reported as [`BatcherError::Broadcast`].
    async fn submit_tx(&self, tx: &Transaction) -> Result<(), BatcherError>;
}

#[async_trait]
pub trait FeeEstimator: Send + Sync + 'static {
    async fn fee_suggestion(&self) -> Result<FeeSuggestion, FeeErr>;
}

#[async_trait]
impl<T: IndexerClient + ?Sized> IndexerClient for Arc<T> {
    async fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>, BatcherError> {
        (**self).get_utxos(address).await
    }

    async fn get_tx(&self, txid: Txid) -> Result<IndexedTx, BatcherError> {
        (**self).get_tx(txid).await
    }

    async fn submit_tx(&self, tx: &Transaction) -> Result<(), BatcherError> {
        (**self).submit_tx(tx).await
    }
}

#[async_trait]
impl<T: FeeEstimator + ?Sized> FeeEstimator for Arc<T> {
    async fn fee_suggestion(&self) -> Result<FeeSuggestion, FeeErr> {
        (**self).fee_suggestion().await
    }
}

/// Bounds on indexer calls made by the engines.
#[derive(Debug, Clone, Copy)]
pub struct CallLimits {
    pub call_timeout: Duration,
    pub tx_fetch_attempts: u32,
    pub tx_fetch_backoff: Duration,
}

impl CallLimits {
    pub fn from_options(opts: &batcher_config::BatcherOptions) -> Self {
        Self {
            call_timeout: opts.call_timeout,
            tx_fetch_attempts: opts.tx_fetch_attempts,
            tx_fetch_backoff: opts.tx_fetch_backoff,
        }
    }
}

impl Default for CallLimits {
    fn default() -> Self {
        Self::from_options(&batcher_config::BatcherOptions::default())
    }
}

/// Fetches a transaction, retrying with a linearly increasing delay while
/// the indexer does not know it yet.
pub async fn get_transaction<I: IndexerClient + ?Sized>(
    indexer: &I,
    txid: Txid,
    limits: &CallLimits,
) -> Result<IndexedTx, BatcherError> {
    let backoff = limits.tx_fetch_backoff;
    let strategy = (1..limits.tx_fetch_attempts.max(1)).map(move |attempt| backoff * attempt);

    RetryIf::spawn(
        strategy,
        move || async move {
            tracing::trace!(%txid, "Fetching transaction");
            with_timeout(limits.call_timeout, "get_tx", indexer.get_tx(txid)).await
        },
        |e: &BatcherError| matches!(e, BatcherError::TxNotFound(_) | BatcherError::Timeout(_)),
    )
    .await
}

/// Broadcasts `tx`. A transaction the chain already contains counts as sent.
pub async fn broadcast<I: IndexerClient + ?Sized>(
    indexer: &I,
    tx: &Transaction,
    limits: &CallLimits,
) -> Result<(), BatcherError> {
    let txid = tx.compute_txid();
    match with_timeout(limits.call_timeout, "submit_tx", indexer.submit_tx(tx)).await {
        Ok(()) => {
            tracing::info!(%txid, "Broadcast transaction");
            Ok(())
        }
        Err(BatcherError::Broadcast(BroadcastError::AlreadyInChain)) => {
            tracing::debug!(%txid, "Transaction already in chain");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(%txid, "Broadcast failed: {e}");
            Err(e)
        }
    }
}
