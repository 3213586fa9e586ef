//! # Batcher Wallet
//!
//! Public face of the crate. Accepts requests, reports their status and runs
//! the engine on a background loop, one tick every `pti`.

use crate::builder::TxBuilder;
use crate::cache::BatcherCache;
use crate::engine::Engine;
use crate::fee::DUST_LIMIT;
use crate::indexer::{FeeEstimator, IndexerClient};
use crate::task::{ShutdownSignal, Task, TaskExt};
use crate::types::{BatcherRequest, IndexedTx, SendRequest, SpendRequest};
use async_trait::async_trait;
use batcher_config::{BatcherOptions, Strategy};
use batcher_errors::{BatcherError, StoreError};
use bitcoin::Address;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

enum Lifecycle {
    Stopped,
    Running {
        cancel: oneshot::Sender<()>,
        handle: JoinHandle<Result<(), BatcherError>>,
    },
}

pub struct BatcherWallet<I, F, B, C> {
    engine: Arc<Engine<I, F, B, C>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<I, F, B, C> BatcherWallet<I, F, B, C>
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
    ) -> Result<Self, BatcherError> {
        Self::from_engine(Engine::new(indexer, fees, builder, cache, opts))
    }

    pub fn from_engine(engine: Engine<I, F, B, C>) -> Result<Self, BatcherError> {
        if engine.cache().strategy() != engine.strategy() {
            return Err(BatcherError::ConfigError(format!(
                "cache belongs to strategy {} but the batcher runs {}",
                engine.cache().strategy(),
                engine.strategy()
            )));
        }

        Ok(Self {
            engine: Arc::new(engine),
            lifecycle: Mutex::new(Lifecycle::Stopped),
        })
    }

    pub fn address(&self) -> &Address {
        self.engine.builder().address()
    }

    /// Queues a request and returns its id. Submitting the same payload
    /// twice returns the id of the first submission.
    #[tracing::instrument(skip_all, fields(sends = sends.len(), spends = spends.len()))]
    pub async fn send(
        &self,
        sends: Vec<SendRequest>,
        spends: Vec<SpendRequest>,
    ) -> Result<String, BatcherError> {
        self.validate(&sends, &spends)?;

        let request = BatcherRequest::new(spends, sends)?;
        let id = request.id.clone();
        match self.engine.cache().save_request(request).await {
            Ok(()) => {
                tracing::info!(request_id = %id, "Queued request");
                Ok(id)
            }
            Err(StoreError::AlreadyExists(_)) => {
                tracing::debug!(request_id = %id, "Request already queued");
                Ok(id)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self, sends: &[SendRequest], spends: &[SpendRequest]) -> Result<(), BatcherError> {
        if sends.is_empty() && spends.is_empty() {
            return Err(BatcherError::InvalidRequest("nothing to send or spend".into()));
        }

        let network = self.engine.builder().network();
        for send in sends {
            if send.amount < DUST_LIMIT {
                return Err(BatcherError::InvalidRequest(format!(
                    "amount {} to {} is below the dust limit",
                    send.amount, send.to
                )));
            }
            if !send.to.as_unchecked().is_valid_for_network(network) {
                return Err(BatcherError::InvalidRequest(format!(
                    "{} is not a {network} address",
                    send.to
                )));
            }
        }

        for spend in spends {
            if spend.script_address != Address::p2wsh(&spend.script, network) {
                return Err(BatcherError::InvalidRequest(format!(
                    "{} is not the p2wsh address of the given script",
                    spend.script_address
                )));
            }
        }
        Ok(())
    }

    /// `(None, false)` while the request waits for a batch, otherwise the
    /// settling transaction.
    pub async fn status(&self, id: &str) -> Result<(Option<IndexedTx>, bool), BatcherError> {
        self.engine.request_status(id).await
    }

    pub async fn is_running(&self) -> bool {
        match &*self.lifecycle.lock().await {
            Lifecycle::Stopped => false,
            Lifecycle::Running { handle, .. } => !handle.is_finished(),
        }
    }

    pub async fn start(&self) -> Result<(), BatcherError> {
        self.start_with_shutdown(futures::future::pending()).await
    }

    /// Starts the loop, which also ends once `shutdown` resolves.
    pub async fn start_with_shutdown<Fut>(&self, shutdown: Fut) -> Result<(), BatcherError>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Lifecycle::Running { handle, .. } = &*lifecycle {
            if !handle.is_finished() {
                return Err(BatcherError::BatcherStillRunning);
            }
        }

        let strategy = self.engine.strategy();
        if !matches!(strategy, Strategy::Rbf | Strategy::Cpfp) {
            return Err(BatcherError::StrategyNotImplemented(strategy.to_string()));
        }

        let (signal, cancel) = ShutdownSignal::new(shutdown);
        let handle = BatcherTick {
            engine: self.engine.clone(),
        }
        .into_polling(self.engine.opts.pti, signal.clone())
        .into_loop(signal)
        .into_bg();

        *lifecycle = Lifecycle::Running { cancel, handle };
        tracing::info!(%strategy, pti = ?self.engine.opts.pti, address = %self.address(), "Batcher started");
        Ok(())
    }

    /// Signals the loop and waits for the current tick to finish.
    pub async fn stop(&self) -> Result<(), BatcherError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Running { cancel, handle } =
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        else {
            return Err(BatcherError::BatcherNotRunning);
        };

        let was_running = !handle.is_finished();
        // the loop may already be gone after an external shutdown
        let _ = cancel.send(());
        handle
            .await
            .map_err(|e| eyre::eyre!("Batcher loop panicked: {e}"))??;

        if !was_running {
            return Err(BatcherError::BatcherNotRunning);
        }
        tracing::info!(strategy = %self.engine.strategy(), "Batcher stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), BatcherError> {
        self.stop().await?;
        self.start().await
    }
}

/// One pass of the loop: batch, then bump.
struct BatcherTick<I, F, B, C> {
    engine: Arc<Engine<I, F, B, C>>,
}

#[async_trait]
impl<I, F, B, C> Task for BatcherTick<I, F, B, C>
where
    I: IndexerClient,
    F: FeeEstimator,
    B: TxBuilder,
    C: BatcherCache,
{
    type Output = ();

    async fn run_once(&mut self) -> Result<(), BatcherError> {
        let strategy = self.engine.strategy().as_str();

        match self.engine.create_batch().await {
            Ok(txid) => {
                metrics::counter!("batcher_batches_created_total", "strategy" => strategy)
                    .increment(1);
                tracing::info!(%txid, strategy, "Batch broadcast");
            }
            Err(BatcherError::BatchParametersNotMet) => {
                tracing::trace!(strategy, "Nothing to batch");
            }
            Err(e) => {
                metrics::counter!("batcher_tick_errors_total", "strategy" => strategy).increment(1);
                tracing::error!(strategy, "Failed to create batch: {e}");
            }
        }

        match self.engine.update_fee().await {
            Ok(Some(txid)) => {
                metrics::counter!("batcher_fee_bumps_total", "strategy" => strategy).increment(1);
                tracing::info!(%txid, strategy, "Fee bumped");
            }
            Ok(None) => {}
            Err(e) if e.is_benign() => {
                tracing::debug!(strategy, "No fee update: {e}");
            }
            Err(e) => {
                metrics::counter!("batcher_tick_errors_total", "strategy" => strategy).increment(1);
                tracing::error!(strategy, "Failed to update fee: {e}");
            }
        }

        Ok(())
    }
}
