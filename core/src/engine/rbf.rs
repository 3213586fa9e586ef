//! Replace-by-fee batching. At most one batch of the chain is meant to
//! confirm: every resubmission spends the inputs of the latest batch, so
//! each new version replaces the previous one in the mempool.

use super::{oldest_age, sends_of, Engine, Result};
use crate::builder::{build_signed, BuiltTx, PlannedInput, TxBuilder};
use crate::cache::BatcherCache;
use crate::fee::{filter_dust, min_relay_fee, validate_update_with_age};
use crate::indexer::{FeeEstimator, IndexerClient};
use crate::types::{Batch, BatcherRequest, SendRequest, TxStatus, Utxo};
use batcher_errors::{BatcherError, BroadcastError};
use bitcoin::Txid;
use std::cmp::Reverse;

impl<I, F, B, C> Engine<I, F, B, C>
where
    I: IndexerClient,
    F: FeeEstimator,
    B: TxBuilder,
    C: BatcherCache,
{
    #[tracing::instrument(skip_all, fields(strategy = %self.opts.strategy))]
    pub(crate) async fn create_rbf_batch(&self) -> Result<Txid> {
        let pending = self
            .store("read_pending_requests", self.cache.read_pending_requests())
            .await?;
        if pending.is_empty() {
            return Err(BatcherError::BatchParametersNotMet);
        }

        let latest = match self
            .store("read_latest_batch", self.cache.read_latest_batch())
            .await
        {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => return self.create_new_rbf_batch(pending, None).await,
            Err(e) => return Err(e),
        };

        if latest.is_confirmed {
            return self.create_new_rbf_batch(pending, None).await;
        }
        if let Some(status) = self.confirmation(&latest).await? {
            self.finalize_rbf_batch(latest, status).await?;
            let pending = self
                .store("read_pending_requests", self.cache.read_pending_requests())
                .await?;
            if pending.is_empty() {
                return Err(BatcherError::BatchParametersNotMet);
            }
            return self.create_new_rbf_batch(pending, None).await;
        }

        self.resubmit_rbf_batch(latest, None).await
    }

    /// Bumps the latest batch to `required` if it is still unconfirmed and
    /// the bump passes [`validate_update_with_age`].
    #[tracing::instrument(skip_all, fields(strategy = %self.opts.strategy, required))]
    pub(crate) async fn update_rbf(&self, required: u64) -> Result<Option<Txid>> {
        let latest = match self
            .store("read_latest_batch", self.cache.read_latest_batch())
            .await
        {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if latest.is_confirmed {
            return Ok(None);
        }

        let current = match self.fetch_tx(latest.txid()).await {
            Ok(tx) if tx.status.confirmed => {
                self.finalize_rbf_batch(latest, tx.status).await?;
                return Ok(None);
            }
            Ok(tx) => tx.fee_rate(),
            Err(BatcherError::TxNotFound(_)) => latest.tx.fee_rate(),
            Err(e) => return Err(e),
        };

        let age = oldest_age(std::slice::from_ref(&latest));
        validate_update_with_age(current, required, &self.opts.tx_options, age)?;

        tracing::info!(txid = %latest.txid(), current, required, "Replacing batch with higher fee");
        self.resubmit_rbf_batch(latest, Some(required)).await.map(Some)
    }

    /// Broadcasts a replacement of `latest` carrying its requests and the
    /// newly pending ones.
    #[tracing::instrument(skip_all, fields(replaced = %latest.txid()))]
    pub(crate) async fn resubmit_rbf_batch(
        &self,
        latest: Batch,
        fee_rate: Option<u64>,
    ) -> Result<Txid> {
        let rate = match fee_rate {
            Some(rate) => rate,
            None => self.fee_rate().await?,
        };

        let pending = self
            .store("read_pending_requests", self.cache.read_pending_requests())
            .await?;
        let ids: Vec<String> = latest.request_ids.iter().cloned().collect();
        let mut requests = self
            .store("read_requests", self.cache.read_requests(&ids))
            .await?;

        let outputs = requests.iter().map(|r| r.sends.len()).sum();
        let selected = self.select_requests(pending, requests.len(), outputs);
        if selected.is_empty() && fee_rate.is_none() {
            return Err(BatcherError::BatchParametersNotMet);
        }
        requests.extend(selected);

        let (script_inputs, requests) = self.script_inputs(requests, Some(&latest.tx)).await?;
        let mut fixed: Vec<PlannedInput> = latest
            .funding_utxos
            .iter()
            .cloned()
            .map(PlannedInput::wallet)
            .collect();
        fixed.extend(script_inputs);

        let pending_batches = self
            .store("read_pending_batches", self.cache.read_pending_batches())
            .await?;
        let candidates = self.rbf_candidates(&pending_batches, rate).await?;

        let sends = sends_of(&requests);
        let built = self.create_rbf_tx(fixed, candidates, &sends, rate, latest.tx.fee.to_sat())?;

        let tx = match self.broadcast_built(&built).await {
            Ok(tx) => tx,
            Err(BatcherError::Broadcast(BroadcastError::InputsMissingOrSpent)) => {
                tracing::warn!("Inputs of the replaced batch are gone, looking for a confirmed batch");
                return self.recover_confirmed_rbf_batch(rate).await;
            }
            Err(e) => return Err(e),
        };

        let txid = tx.txid;
        self.save(self.new_batch(tx, &built, &requests, false)).await?;
        Ok(txid)
    }

    /// Fresh batch over `pending`, spending only wallet UTXOs no pending
    /// batch holds.
    #[tracing::instrument(skip_all, fields(pending = pending.len()))]
    pub(crate) async fn create_new_rbf_batch(
        &self,
        pending: Vec<BatcherRequest>,
        fee_rate: Option<u64>,
    ) -> Result<Txid> {
        let rate = match fee_rate {
            Some(rate) => rate,
            None => self.fee_rate().await?,
        };

        let requests = self.select_requests(pending, 0, 0);
        let (script_inputs, requests) = self.script_inputs(requests, None).await?;
        if requests.is_empty() {
            return Err(BatcherError::BatchParametersNotMet);
        }

        let pending_batches = self
            .store("read_pending_batches", self.cache.read_pending_batches())
            .await?;
        let candidates = self.rbf_candidates(&pending_batches, rate).await?;

        let sends = sends_of(&requests);
        let built = self.create_rbf_tx(script_inputs, candidates, &sends, rate, 0)?;
        let tx = self.broadcast_built(&built).await?;

        let txid = tx.txid;
        self.save(self.new_batch(tx, &built, &requests, false)).await?;
        Ok(txid)
    }

    /// Confirmed wallet UTXOs no pending batch claims, largest first.
    /// Replacements may not add unconfirmed inputs.
    async fn rbf_candidates(&self, pending_batches: &[Batch], rate: u64) -> Result<Vec<Utxo>> {
        let utxos: Vec<Utxo> = self
            .wallet_utxos()
            .await?
            .into_iter()
            .filter(|u| u.status.confirmed)
            .filter(|u| !pending_batches.iter().any(|b| b.claims(&u.outpoint())))
            .collect();

        let mut utxos = filter_dust(utxos, rate, self.builder.input_vsize());
        utxos.sort_by_key(|u| Reverse(u.value));
        Ok(utxos)
    }

    /// Searches pending batches for the one that confirmed in place of the
    /// latest, finalizes it and batches whatever is left.
    async fn recover_confirmed_rbf_batch(&self, rate: u64) -> Result<Txid> {
        let pending_batches = self
            .store("read_pending_batches", self.cache.read_pending_batches())
            .await?;

        let mut confirmed = Vec::new();
        for batch in pending_batches {
            if let Some(status) = self.confirmation(&batch).await? {
                confirmed.push((batch, status));
            }
        }

        if confirmed.len() > 1 {
            return Err(BatcherError::MultipleConfirmedBatches(confirmed.len()));
        }
        let Some((batch, status)) = confirmed.pop() else {
            return Err(BroadcastError::InputsMissingOrSpent.into());
        };

        let txid = batch.txid();
        self.finalize_rbf_batch(batch, status).await?;

        let pending = self
            .store("read_pending_requests", self.cache.read_pending_requests())
            .await?;
        if pending.is_empty() {
            return Ok(txid);
        }
        self.create_new_rbf_batch(pending, Some(rate)).await
    }

    /// Moves `batch` to the finalized partition and drops its superseded
    /// peers.
    async fn finalize_rbf_batch(
        &self,
        mut batch: Batch,
        status: TxStatus,
    ) -> Result<()> {
        let txid = batch.txid();
        batch.is_confirmed = true;
        batch.tx.status = status;

        self.store(
            "update_and_delete_pending_batches",
            self.cache.update_and_delete_pending_batches(vec![batch]),
        )
        .await?;
        tracing::info!(%txid, "Batch confirmed");
        Ok(())
    }

    /// Builds a transaction paying `sends` from `fixed` plus as many
    /// `candidates` as needed, raising the fee until it covers the measured
    /// size at `rate` and outbids `replaced_fee` by the relay increment.
    pub(crate) fn create_rbf_tx(
        &self,
        fixed: Vec<PlannedInput>,
        candidates: Vec<Utxo>,
        sends: &[SendRequest],
        rate: u64,
        replaced_fee: u64,
    ) -> Result<BuiltTx> {
        let send_total: u64 = sends.iter().map(|s| s.amount.to_sat()).sum();
        let mut fee = replaced_fee;

        for attempt in 0..self.opts.convergence_depth {
            let inputs = self.select_inputs(&fixed, &candidates, send_total + fee)?;
            let built = build_signed(&*self.builder, inputs, sends, fee)?;

            let vsize = built.vsize();
            let new_fee = (vsize * rate).max(replaced_fee + min_relay_fee(vsize));
            if new_fee <= fee {
                return Ok(built);
            }

            tracing::trace!(attempt, fee, new_fee, vsize, "Raising replacement fee");
            fee = new_fee;
        }

        Err(BatcherError::BuildRbfDepthExceeded)
    }

    fn select_inputs(
        &self,
        fixed: &[PlannedInput],
        candidates: &[Utxo],
        target: u64,
    ) -> Result<Vec<PlannedInput>> {
        let max_inputs = self.opts.tx_options.max_inputs;
        let mut inputs = fixed.to_vec();
        let mut total: u64 = inputs.iter().map(|i| i.utxo.value.to_sat()).sum();
        let mut wallet_inputs = inputs.iter().filter(|i| i.is_wallet()).count();

        for utxo in candidates {
            if total >= target || (max_inputs > 0 && wallet_inputs >= max_inputs) {
                break;
            }
            if fixed.iter().any(|i| i.utxo.outpoint() == utxo.outpoint()) {
                continue;
            }
            total += utxo.value.to_sat();
            wallet_inputs += 1;
            inputs.push(PlannedInput::wallet(utxo.clone()));
        }

        if total < target {
            return Err(BatcherError::InsufficientFunds {
                needed: target,
                available: total,
            });
        }
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::TxBuilder;
    use crate::cache::BatcherCache;
    use crate::test_utils::{queue_send, test_engine, TestEngine};
    use batcher_config::Strategy;
    use batcher_errors::{BatcherError, BroadcastError, StoreError};
    use bitcoin::Amount;

    #[tokio::test]
    async fn first_batch_spends_confirmed_wallet_utxos() {
        let TestEngine {
            engine, indexer, ..
        } = test_engine(Strategy::Rbf);
        indexer.fund(engine.builder().address(), Amount::from_sat(100_000));
        let id = queue_send(&engine, 30_000).await;

        let txid = engine.create_batch().await.unwrap();
        let batch = engine.cache().read_latest_batch().await.unwrap();
        assert_eq!(batch.txid(), txid);
        assert!(!batch.is_stable);
        assert!(batch.request_ids.contains(&id));
        assert_eq!(batch.funding_utxos.len(), 1);
        assert!(batch.tx.fee_rate() >= 10);
        assert!(engine.cache().read_pending_requests().await.unwrap().is_empty());

        // unconfirmed change is never used by a new rbf batch
        queue_send(&engine, 20_000).await;
        let resubmitted = engine.create_batch().await.unwrap();
        assert_ne!(resubmitted, txid);
        let replacement = engine.cache().read_latest_batch().await.unwrap();
        assert_eq!(replacement.request_ids.len(), 2);
        assert!(replacement.tx.fee > batch.tx.fee);
        assert!(replacement.claims(&batch.funding_utxos[0].outpoint()));

        // only the replacement is left in the mempool
        assert!(!indexer.in_mempool(txid));
        assert!(indexer.in_mempool(resubmitted));
    }

    #[tokio::test]
    async fn nothing_pending_is_not_met() {
        let TestEngine { engine, .. } = test_engine(Strategy::Rbf);
        assert!(matches!(
            engine.create_batch().await,
            Err(BatcherError::BatchParametersNotMet)
        ));
        assert_eq!(engine.update_fee().await.unwrap(), None);
    }

    #[tokio::test]
    async fn fee_update_replaces_latest() {
        let TestEngine {
            engine,
            indexer,
            fees,
            ..
        } = test_engine(Strategy::Rbf);
        indexer.fund(engine.builder().address(), Amount::from_sat(100_000));
        queue_send(&engine, 30_000).await;
        let first = engine.create_batch().await.unwrap();

        assert!(matches!(
            engine.update_fee().await,
            Err(BatcherError::FeeUpdateNotNeeded)
        ));

        fees.set_rate(25);
        let bumped = engine.update_fee().await.unwrap().unwrap();
        assert_ne!(bumped, first);

        let latest = engine.cache().read_latest_batch().await.unwrap();
        assert_eq!(latest.txid(), bumped);
        assert!(latest.tx.fee_rate() >= 25);
        assert!(!indexer.in_mempool(first));

        indexer.confirm(bumped);
        assert_eq!(engine.update_fee().await.unwrap(), None);
        let finalized = engine.cache().read_batch(bumped).await.unwrap();
        assert!(finalized.is_confirmed);
        assert!(engine.cache().read_pending_batches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fee_policy_limits_block_updates() {
        let TestEngine {
            mut engine,
            indexer,
            fees,
            ..
        } = test_engine(Strategy::Rbf);
        engine.opts.tx_options.max_fee_rate = 50;
        indexer.fund(engine.builder().address(), Amount::from_sat(100_000));
        queue_send(&engine, 30_000).await;
        engine.create_batch().await.unwrap();

        fees.set_rate(80);
        assert!(matches!(
            engine.update_fee().await,
            Err(BatcherError::HighFeeEstimate { required: 80, max: 50 })
        ));
    }

    #[tokio::test]
    async fn confirmed_older_version_is_recovered() {
        let TestEngine {
            engine, indexer, ..
        } = test_engine(Strategy::Rbf);
        indexer.fund(engine.builder().address(), Amount::from_sat(100_000));
        indexer.fund(engine.builder().address(), Amount::from_sat(80_000));

        let a = queue_send(&engine, 30_000).await;
        let first = engine.create_batch().await.unwrap();
        let b = queue_send(&engine, 20_000).await;
        let second = engine.create_batch().await.unwrap();
        assert!(indexer.in_mempool(second));

        // the first version confirms behind our back
        indexer.replace_and_confirm(second, first);

        let c = queue_send(&engine, 10_000).await;
        let third = engine.create_batch().await.unwrap();

        let confirmed = engine.cache().read_batch(first).await.unwrap();
        assert!(confirmed.is_confirmed);
        assert!(matches!(
            engine.cache().read_batch(second).await,
            Err(StoreError::NotFound(_))
        ));

        // request a settled by the confirmed batch, b and c go out again
        assert_eq!(
            engine.cache().read_batch_by_req_id(&a).await.unwrap().txid(),
            first
        );
        let fresh = engine.cache().read_batch(third).await.unwrap();
        assert!(fresh.request_ids.contains(&b));
        assert!(fresh.request_ids.contains(&c));
        assert!(!fresh.request_ids.contains(&a));
        assert!(engine.cache().read_pending_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insufficient_funds_surface() {
        let TestEngine {
            engine, indexer, ..
        } = test_engine(Strategy::Rbf);
        indexer.fund(engine.builder().address(), Amount::from_sat(5_000));
        queue_send(&engine, 30_000).await;
        assert!(matches!(
            engine.create_batch().await,
            Err(BatcherError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn latest_confirming_before_broadcast_is_recovered() {
        let TestEngine {
            engine, indexer, ..
        } = test_engine(Strategy::Rbf);
        indexer.fund(engine.builder().address(), Amount::from_sat(100_000));

        let a = queue_send(&engine, 30_000).await;
        let first = engine.create_batch().await.unwrap();
        let change = engine
            .cache()
            .read_batch(first)
            .await
            .unwrap()
            .change_utxo
            .unwrap();

        // mined after the latest batch was read, the replacement double spends
        let b = queue_send(&engine, 20_000).await;
        indexer.confirm_all_before_next_submit();
        let next = engine.create_batch().await.unwrap();
        assert_ne!(next, first);

        let confirmed = engine.cache().read_batch(first).await.unwrap();
        assert!(confirmed.is_confirmed);
        assert_eq!(
            engine.cache().read_batch_by_req_id(&a).await.unwrap().txid(),
            first
        );

        let fresh = engine.cache().read_latest_batch().await.unwrap();
        assert_eq!(fresh.txid(), next);
        assert!(fresh.request_ids.contains(&b));
        assert!(!fresh.request_ids.contains(&a));
        assert!(fresh.claims(&change.outpoint()));
        assert!(indexer.in_mempool(next));
        assert!(engine.cache().read_pending_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_broadcast_errors_propagate() {
        let TestEngine {
            engine, indexer, ..
        } = test_engine(Strategy::Rbf);
        indexer.fund(engine.builder().address(), Amount::from_sat(100_000));
        queue_send(&engine, 30_000).await;
        let first = engine.create_batch().await.unwrap();

        queue_send(&engine, 20_000).await;
        indexer.fail_next_submit(BroadcastError::MempoolConflict);
        assert!(matches!(
            engine.create_batch().await,
            Err(BatcherError::Broadcast(BroadcastError::MempoolConflict))
        ));

        // nothing was recorded, the first version is still the latest
        assert_eq!(engine.cache().read_latest_batch().await.unwrap().txid(), first);
        assert_eq!(engine.cache().read_pending_requests().await.unwrap().len(), 1);
        assert!(indexer.in_mempool(first));
        assert_eq!(indexer.submitted(), vec![first]);
    }
}
