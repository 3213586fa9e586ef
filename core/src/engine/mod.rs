//! # Batching Engine
//!
//! Turns pending requests into broadcast batches and keeps their fees in line
//! with the oracle. One engine serves one strategy; the strategy specific
//! flows live in [`rbf`] and [`cpfp`].
//!
//! Every indexer, oracle and cache call goes through [`with_timeout`] so a
//! stalled dependency surfaces as [`BatcherError::Timeout`] instead of
//! wedging the tick.

mod cpfp;
mod rbf;

use crate::builder::{BuiltTx, PlannedInput, TxBuilder};
use crate::cache::BatcherCache;
use crate::fee::required_fee_rate;
use crate::indexer::{broadcast, get_transaction, CallLimits, FeeEstimator, IndexerClient};
use crate::types::{Batch, BatcherRequest, IndexedTx, SendRequest, TxStatus, Utxo};
use crate::utils::{now_secs, with_timeout};
use batcher_config::{BatcherOptions, Strategy};
use batcher_errors::{BatcherError, StoreError};
use bitcoin::{OutPoint, Txid};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

pub type Result<T, E = BatcherError> = std::result::Result<T, E>;

pub struct Engine<I, F, B, C> {
    pub(crate) indexer: Arc<I>,
    pub(crate) fees: Arc<F>,
    pub(crate) builder: Arc<B>,
    pub(crate) cache: Arc<C>,
    pub(crate) opts: BatcherOptions,
    pub(crate) limits: CallLimits,
}

impl<I, F, B, C> Engine<I, F, B, C>
where
    I: IndexerClient,
    F: FeeEstimator,
    B: TxBuilder,
    C: BatcherCache,
{
    pub fn new(
        indexer: Arc<I>,
        fees: Arc<F>,
        builder: Arc<B>,
        cache: Arc<C>,
        opts: BatcherOptions,
    ) -> Self {
        let limits = CallLimits::from_options(&opts);
        Self {
            indexer,
            fees,
            builder,
            cache,
            opts,
            limits,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.opts.strategy
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Batches pending requests with the configured strategy.
    ///
    /// # Errors
    ///
    /// [`BatcherError::BatchParametersNotMet`] when there is nothing to batch.
    pub async fn create_batch(&self) -> Result<Txid> {
        match self.opts.strategy {
            Strategy::Rbf => self.create_rbf_batch().await,
            Strategy::Cpfp => self.create_cpfp_batch().await,
            other => Err(BatcherError::StrategyNotImplemented(other.to_string())),
        }
    }

    /// Bumps pending batches to the oracle's current rate. Returns the txid
    /// of the replacement or child transaction, if one was broadcast.
    ///
    /// # Errors
    ///
    /// [`BatcherError::FeeUpdateNotNeeded`] when pending batches already pay
    /// enough.
    pub async fn update_fee(&self) -> Result<Option<Txid>> {
        let required = self.fee_rate().await?;
        match self.opts.strategy {
            Strategy::Rbf => self.update_rbf(required).await,
            Strategy::Cpfp => self.update_cpfp(required).await,
            other => Err(BatcherError::StrategyNotImplemented(other.to_string())),
        }
    }

    /// Returns the transaction settling request `id` and whether the request
    /// is batched.
    pub async fn request_status(&self, id: &str) -> Result<(Option<IndexedTx>, bool)> {
        let request = self.store("read_request", self.cache.read_request(id)).await?;
        if !request.status {
            return Ok((None, false));
        }

        let batch = self
            .store("read_batch_by_req_id", self.cache.read_batch_by_req_id(id))
            .await?;
        match get_transaction(&*self.indexer, batch.txid(), &self.limits).await {
            Ok(tx) => Ok((Some(tx), true)),
            Err(BatcherError::TxNotFound(_)) => {
                tracing::debug!(request_id = id, txid = %batch.txid(), "Indexer does not know batch, using stored view");
                Ok((Some(batch.tx), true))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn store<T, Fut>(&self, call: &'static str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_timeout(self.limits.call_timeout, call, fut).await
    }

    pub(crate) async fn fee_rate(&self) -> Result<u64> {
        with_timeout(
            self.limits.call_timeout,
            "fee_suggestion",
            required_fee_rate(&*self.fees, &self.opts.tx_options),
        )
        .await
    }

    pub(crate) async fn wallet_utxos(&self) -> Result<Vec<Utxo>> {
        with_timeout(
            self.limits.call_timeout,
            "get_utxos",
            self.indexer.get_utxos(self.builder.address()),
        )
        .await
    }

    /// Single lookup, [`BatcherError::TxNotFound`] is returned right away.
    pub(crate) async fn fetch_tx(&self, txid: Txid) -> Result<IndexedTx> {
        with_timeout(self.limits.call_timeout, "get_tx", self.indexer.get_tx(txid)).await
    }

    /// Broadcasts and returns the indexer's view of the transaction, or a
    /// locally built one if the indexer lags behind.
    pub(crate) async fn broadcast_built(&self, built: &BuiltTx) -> Result<IndexedTx> {
        broadcast(&*self.indexer, &built.tx, &self.limits).await?;

        let txid = built.tx.compute_txid();
        match get_transaction(&*self.indexer, txid, &self.limits).await {
            Ok(tx) => Ok(tx),
            Err(BatcherError::TxNotFound(_) | BatcherError::Timeout(_)) => {
                tracing::debug!(%txid, "Broadcast transaction not indexed yet");
                Ok(built.indexed(self.builder.address()))
            }
            Err(e) => Err(e),
        }
    }

    /// Position of a batch's confirmation: the stored flag, else the indexer.
    pub(crate) async fn confirmation(&self, batch: &Batch) -> Result<Option<TxStatus>> {
        if batch.is_confirmed {
            return Ok(Some(batch.tx.status.clone()));
        }
        match self.fetch_tx(batch.txid()).await {
            Ok(tx) if tx.status.confirmed => Ok(Some(tx.status)),
            Ok(_) | Err(BatcherError::TxNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Takes requests in order until a cap of the configured options would
    /// be exceeded. `requests` and `outputs` count what the batch already
    /// carries.
    pub(crate) fn select_requests(
        &self,
        pending: Vec<BatcherRequest>,
        mut requests: usize,
        mut outputs: usize,
    ) -> Vec<BatcherRequest> {
        let opts = &self.opts.tx_options;
        let mut selected = Vec::new();
        for request in pending {
            if opts.max_batch_size > 0 && requests + 1 > opts.max_batch_size {
                break;
            }
            if opts.max_outputs > 0 && outputs + request.sends.len() > opts.max_outputs {
                break;
            }
            requests += 1;
            outputs += request.sends.len();
            selected.push(request);
        }
        selected
    }

    /// Resolves the inputs of every spend instruction in `requests`.
    ///
    /// Outputs already spent by `reuse_from`, the transaction being replaced,
    /// are no longer listed by the indexer and are taken from its inputs.
    /// Requests with a spend that has nothing to spend are left pending.
    pub(crate) async fn script_inputs(
        &self,
        requests: Vec<BatcherRequest>,
        reuse_from: Option<&IndexedTx>,
    ) -> Result<(Vec<PlannedInput>, Vec<BatcherRequest>)> {
        let mut claimed: HashSet<OutPoint> = HashSet::new();
        let mut inputs = Vec::new();
        let mut kept = Vec::with_capacity(requests.len());

        'requests: for request in requests {
            let mut request_inputs = Vec::new();
            for spend in &request.spends {
                let script_pubkey = spend.script_address.script_pubkey();
                let mut utxos = with_timeout(
                    self.limits.call_timeout,
                    "get_utxos",
                    self.indexer.get_utxos(&spend.script_address),
                )
                .await?;

                if let Some(previous) = reuse_from {
                    utxos.extend(previous.vin.iter().filter_map(|vin| {
                        let prevout = vin.prevout.as_ref()?;
                        (prevout.scriptpubkey == script_pubkey).then(|| Utxo {
                            txid: vin.txid,
                            vout: vin.vout,
                            value: prevout.value,
                            status: TxStatus::default(),
                        })
                    }));
                }

                let fresh: Vec<Utxo> = utxos
                    .into_iter()
                    .filter(|u| {
                        !claimed.contains(&u.outpoint())
                            && !request_inputs
                                .iter()
                                .any(|i: &PlannedInput| i.utxo.outpoint() == u.outpoint())
                    })
                    .collect();
                if fresh.is_empty() {
                    tracing::warn!(
                        request_id = %request.id,
                        script_address = %spend.script_address,
                        "Nothing to spend at script address, leaving request pending"
                    );
                    continue 'requests;
                }
                request_inputs.extend(
                    fresh
                        .into_iter()
                        .map(|u| PlannedInput::script(u, spend.clone())),
                );
            }

            claimed.extend(request_inputs.iter().map(|i| i.utxo.outpoint()));
            inputs.extend(request_inputs);
            kept.push(request);
        }

        Ok((inputs, kept))
    }

    pub(crate) fn new_batch(
        &self,
        tx: IndexedTx,
        built: &BuiltTx,
        requests: &[BatcherRequest],
        is_stable: bool,
    ) -> Batch {
        Batch {
            tx,
            request_ids: requests.iter().map(|r| r.id.clone()).collect::<BTreeSet<_>>(),
            strategy: self.opts.strategy,
            is_stable,
            is_confirmed: false,
            change_utxo: built.change.clone(),
            funding_utxos: built.wallet_inputs(),
            created_at: now_secs(),
        }
    }

    pub(crate) async fn save(&self, batch: Batch) -> Result<()> {
        let txid = batch.txid();
        let requests = batch.request_ids.len();
        with_timeout(self.limits.call_timeout, "save_batch", async {
            self.cache
                .save_batch(batch)
                .await
                .map_err(|source| BatcherError::SavingBatch { txid, source })
        })
        .await?;

        tracing::info!(%txid, requests, strategy = %self.opts.strategy, "Saved batch");
        Ok(())
    }
}

/// Flattens the payments of `requests`, in request order.
pub(crate) fn sends_of(requests: &[BatcherRequest]) -> Vec<SendRequest> {
    requests.iter().flat_map(|r| r.sends.iter().cloned()).collect()
}

/// Seconds since the oldest of `batches` was created.
pub(crate) fn oldest_age(batches: &[Batch]) -> Option<u64> {
    batches
        .iter()
        .map(|b| b.created_at)
        .min()
        .map(|created| now_secs().saturating_sub(created))
}
