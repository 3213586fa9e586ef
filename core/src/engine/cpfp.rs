//! Child-pays-for-parent batching. Batches are never replaced; each new
//! batch spends the unconfirmed change of the previous one and pays extra
//! to lift underpriced ancestors to the required rate.

use super::{oldest_age, sends_of, Engine, Result};
use crate::builder::{build_signed, BuiltTx, PlannedInput, TxBuilder};
use crate::cache::BatcherCache;
use crate::fee::{calculate_fee_stats, filter_dust, validate_update, validate_update_with_age};
use crate::indexer::{FeeEstimator, IndexerClient};
use crate::types::{Batch, SendRequest, Utxo};
use batcher_errors::BatcherError;
use bitcoin::{Amount, Txid};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

impl<I, F, B, C> Engine<I, F, B, C>
where
    I: IndexerClient,
    F: FeeEstimator,
    B: TxBuilder,
    C: BatcherCache,
{
    #[tracing::instrument(skip_all, fields(strategy = %self.opts.strategy))]
    pub(crate) async fn create_cpfp_batch(&self) -> Result<Txid> {
        let pending_requests = self
            .store("read_pending_requests", self.cache.read_pending_requests())
            .await?;
        if pending_requests.is_empty() {
            return Err(BatcherError::BatchParametersNotMet);
        }

        let utxos = self.wallet_utxos().await?;
        let required = self.fee_rate().await?;
        let pending = self.filter_pending_batches().await?;

        let max_batches = self.opts.tx_options.max_batches;
        if max_batches > 0 && pending.len() >= max_batches {
            tracing::debug!(pending = pending.len(), max_batches, "Too many pending batches");
            return Err(BatcherError::BatchParametersNotMet);
        }

        let requests = self.select_requests(pending_requests, 0, 0);
        let (script_inputs, requests) = self.script_inputs(requests, None).await?;
        if requests.is_empty() {
            return Err(BatcherError::BatchParametersNotMet);
        }

        let mut inputs = self.cpfp_wallet_inputs(utxos, &pending, required);
        let lifted = self.lifted_by(&inputs, &pending).await?;

        let stats = calculate_fee_stats(required, &lifted);
        let overhead = if lifted.is_empty() {
            0
        } else {
            match validate_update(stats.min_fee_rate, required, &self.opts.tx_options) {
                Ok(()) => stats.fee_delta,
                Err(BatcherError::FeeUpdateNotNeeded) => 0,
                Err(e) => return Err(e),
            }
        };
        inputs.extend(script_inputs);

        let sends = sends_of(&requests);
        let built = self.build_cpfp_tx(inputs, &sends, overhead, required)?;
        let tx = self.broadcast_built(&built).await?;

        let txid = tx.txid;
        self.save(self.new_batch(tx, &built, &requests, true)).await?;

        if overhead > 0 {
            self.record_bump(&lifted, required).await?;
        }
        Ok(txid)
    }

    /// Broadcasts a child sweeping every wallet UTXO back to the wallet so
    /// the pending chain pays `required` as a package.
    #[tracing::instrument(skip_all, fields(strategy = %self.opts.strategy, required))]
    pub(crate) async fn update_cpfp(&self, required: u64) -> Result<Option<Txid>> {
        let pending = self.filter_pending_batches().await?;
        if pending.is_empty() {
            return Err(BatcherError::FeeUpdateNotNeeded);
        }

        let utxos = self.wallet_utxos().await?;
        self.verify_cpfp_conditions(&pending, &utxos).await?;

        let inputs = self.cpfp_wallet_inputs(utxos, &pending, required);
        let lifted = self.lifted_by(&inputs, &pending).await?;
        if lifted.is_empty() {
            tracing::debug!("Sweep would not descend from any pending batch");
            return Err(BatcherError::CpfpFeeUpdateParamsNotMet);
        }

        let stats = calculate_fee_stats(required, &lifted);
        if stats.fee_delta == 0 {
            return Err(BatcherError::FeeUpdateNotNeeded);
        }
        validate_update_with_age(
            stats.min_fee_rate,
            required,
            &self.opts.tx_options,
            oldest_age(&lifted),
        )?;

        let built = self.build_cpfp_tx(inputs, &[], stats.fee_delta, required)?;
        let tx = self.broadcast_built(&built).await?;

        let txid = tx.txid;
        tracing::info!(%txid, bumped = lifted.len(), fee_delta = stats.fee_delta, "Broadcast fee bump");
        self.save(self.new_batch(tx, &built, &[], true)).await?;
        self.record_bump(&lifted, required).await?;
        Ok(Some(txid))
    }

    /// Pending batches that are still unconfirmed. Confirmed ones are moved
    /// to the finalized partition on the way.
    pub(crate) async fn filter_pending_batches(&self) -> Result<Vec<Batch>> {
        let batches = self
            .store("read_pending_batches", self.cache.read_pending_batches())
            .await?;

        let mut pending = Vec::with_capacity(batches.len());
        let mut confirmed = Vec::new();
        for mut batch in batches {
            match self.fetch_tx(batch.txid()).await {
                Ok(tx) if tx.status.confirmed => {
                    // recorded fees of bumped batches are kept
                    batch.tx.status = tx.status;
                    batch.is_confirmed = true;
                    confirmed.push(batch);
                }
                Ok(_) | Err(BatcherError::TxNotFound(_)) => pending.push(batch),
                Err(e) => return Err(e),
            }
        }

        if !confirmed.is_empty() {
            tracing::info!(confirmed = confirmed.len(), "Batches confirmed");
            self.store("update_batches", self.cache.update_batches(confirmed))
                .await?;
        }
        Ok(pending)
    }

    /// Picks the batches a wallet sweep would lift.
    ///
    /// # Errors
    ///
    /// - [`BatcherError::CpfpFeeUpdateParamsNotMet`] without unconfirmed
    ///   wallet UTXOs to hang a child on.
    /// - [`BatcherError::CpfpBatchingCorrupted`] if more than one pending
    ///   batch has unspent change.
    pub(crate) async fn verify_cpfp_conditions(
        &self,
        pending: &[Batch],
        utxos: &[Utxo],
    ) -> Result<Vec<Batch>> {
        let unconfirmed: HashSet<_> = utxos
            .iter()
            .filter(|u| !u.status.confirmed)
            .map(Utxo::outpoint)
            .collect();
        if unconfirmed.is_empty() {
            return Err(BatcherError::CpfpFeeUpdateParamsNotMet);
        }

        let trailing: Vec<&Batch> = pending
            .iter()
            .filter(|b| {
                b.change_utxo
                    .as_ref()
                    .is_some_and(|c| unconfirmed.contains(&c.outpoint()))
            })
            .collect();

        match trailing.as_slice() {
            [] => Ok(pending.to_vec()),
            [tail] => self.reconstruct_cpfp_batches(&[*tail], pending).await,
            tails => Err(BatcherError::CpfpBatchingCorrupted(format!(
                "{} pending batches with unspent change",
                tails.len()
            ))),
        }
    }

    /// Pending batches a transaction spending `inputs` descends from.
    async fn lifted_by(&self, inputs: &[PlannedInput], pending: &[Batch]) -> Result<Vec<Batch>> {
        let spent: HashSet<Txid> = inputs
            .iter()
            .filter(|i| i.is_wallet())
            .map(|i| i.utxo.txid)
            .collect();
        let parents: Vec<&Batch> = pending
            .iter()
            .filter(|b| spent.contains(&b.txid()))
            .collect();
        if parents.is_empty() {
            return Ok(Vec::new());
        }
        self.reconstruct_cpfp_batches(&parents, pending).await
    }

    /// Walks wallet inputs back from `tips`. Every unconfirmed parent must be
    /// a pending batch; the walk stops at confirmed transactions.
    async fn reconstruct_cpfp_batches(&self, tips: &[&Batch], pending: &[Batch]) -> Result<Vec<Batch>> {
        let by_txid: HashMap<Txid, &Batch> = pending.iter().map(|b| (b.txid(), b)).collect();
        let wallet_spk = self.builder.address().script_pubkey();

        let mut visited: HashSet<Txid> = HashSet::new();
        let mut confirmed_parents: HashSet<Txid> = HashSet::new();
        let mut ancestors = Vec::new();
        let mut stack = tips.to_vec();

        while let Some(batch) = stack.pop() {
            if !visited.insert(batch.txid()) {
                continue;
            }

            for input in &batch.tx.vin {
                let owned = input
                    .prevout
                    .as_ref()
                    .is_some_and(|p| p.scriptpubkey == wallet_spk);
                if !owned || confirmed_parents.contains(&input.txid) {
                    continue;
                }
                if let Some(parent) = by_txid.get(&input.txid) {
                    stack.push(*parent);
                    continue;
                }

                match self.fetch_tx(input.txid).await {
                    Ok(parent) if parent.status.confirmed => {
                        confirmed_parents.insert(input.txid);
                    }
                    Ok(_) | Err(BatcherError::TxNotFound(_)) => {
                        return Err(BatcherError::CpfpBatchingCorrupted(format!(
                            "batch {} spends {} which is neither confirmed nor a pending batch",
                            batch.txid(),
                            input.txid
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            ancestors.push(batch.clone());
        }

        for excluded in pending.iter().filter(|b| !visited.contains(&b.txid())) {
            tracing::warn!(txid = %excluded.txid(), "Pending batch is not an ancestor of the spent chain, not bumping it");
        }

        ancestors.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.txid().cmp(&b.txid()))
        });
        Ok(ancestors)
    }

    /// Signs a transaction paying `sends` from all of `inputs` with
    /// `overhead` sats on top of its own fee at `rate`. The rest returns to
    /// the wallet.
    pub(crate) fn build_cpfp_tx(
        &self,
        inputs: Vec<PlannedInput>,
        sends: &[SendRequest],
        overhead: u64,
        rate: u64,
    ) -> Result<BuiltTx> {
        let mut fee = overhead;

        for attempt in 0..self.opts.convergence_depth {
            let built = build_signed(&*self.builder, inputs.clone(), sends, fee)?;

            let new_fee = built.vsize() * rate + overhead;
            if new_fee <= fee {
                return Ok(built);
            }

            tracing::trace!(attempt, fee, new_fee, "Raising child fee");
            fee = new_fee;
        }

        Err(BatcherError::CpfpDepthExceeded)
    }

    /// Wallet UTXOs to spend at `rate`. Unconfirmed change of `pending`
    /// batches is always kept so the chain never forks. Other UTXOs must pay
    /// for their own input and fill what `max_inputs` leaves.
    fn cpfp_wallet_inputs(&self, utxos: Vec<Utxo>, pending: &[Batch], rate: u64) -> Vec<PlannedInput> {
        let tips: HashSet<_> = pending
            .iter()
            .filter_map(|b| b.change_utxo.as_ref().map(Utxo::outpoint))
            .collect();
        let (chain, others): (Vec<Utxo>, Vec<Utxo>) = utxos
            .into_iter()
            .partition(|u| !u.status.confirmed && tips.contains(&u.outpoint()));

        let mut others = filter_dust(others, rate, self.builder.input_vsize());
        others.sort_by_key(|u| (u.status.confirmed, Reverse(u.value)));

        let max_inputs = self.opts.tx_options.max_inputs;
        if max_inputs > 0 {
            others.truncate(max_inputs.saturating_sub(chain.len()));
        }
        chain
            .into_iter()
            .chain(others)
            .map(PlannedInput::wallet)
            .collect()
    }

    /// Records that `batches` now pay `required` through their child.
    async fn record_bump(&self, batches: &[Batch], required: u64) -> Result<()> {
        let bumped: Vec<Batch> = batches
            .iter()
            .filter(|b| b.tx.fee_rate() < required)
            .cloned()
            .map(|mut b| {
                b.tx.fee = Amount::from_sat(required * b.tx.vsize());
                b
            })
            .collect();
        if bumped.is_empty() {
            return Ok(());
        }

        tracing::debug!(bumped = bumped.len(), required, "Recording lifted fees");
        self.store("update_batches", self.cache.update_batches(bumped))
            .await
    }
}
