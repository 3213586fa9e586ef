use batcher_config::{BatcherConfig, Strategy};
use batcher_core::batcher::BatcherWallet;
use batcher_core::builder::P2wpkhSigner;
use batcher_core::cache::kv::KvStore;
use batcher_core::cache::{BatcherCache, KvCache, MemoryStore, SledStore};
use batcher_core::cli::get_configuration_from_cli;
use batcher_core::indexer::{EsploraClient, MempoolFeeEstimator};
use batcher_errors::BatcherError;
use eyre::Context;
use std::sync::Arc;

async fn run<S: KvStore>(config: BatcherConfig, store: Arc<S>) -> Result<(), BatcherError> {
    let strategy: Strategy = config.batcher.strategy;
    let signer = P2wpkhSigner::from_secret(&config.secret_key, config.network)?;
    let cache = KvCache::new(store, strategy);
    tracing::info!(
        %strategy,
        pending = cache.read_pending_requests().await?.len(),
        "Opened batcher cache"
    );

    let wallet = BatcherWallet::new(
        Arc::new(EsploraClient::new(&config.indexer_url)),
        Arc::new(MempoolFeeEstimator::new(&config.fee_api_url)),
        Arc::new(signer),
        Arc::new(cache),
        config.batcher,
    )?;

    wallet
        .start_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {e}");
            }
        })
        .await?;

    tokio::signal::ctrl_c()
        .await
        .wrap_err("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");
    match wallet.stop().await {
        Ok(()) | Err(BatcherError::BatcherNotRunning) => Ok(()),
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() {
    let (config, _args) = get_configuration_from_cli();
    tracing::info!(network = %config.network, strategy = %config.batcher.strategy, "Starting batcher");

    let res = match config.db_path.clone() {
        Some(path) => match SledStore::open(&path) {
            Ok(store) => run(config, Arc::new(store)).await,
            Err(e) => Err(e.into()),
        },
        None => {
            tracing::warn!("No db_path configured, state is kept in memory only");
            run(config, Arc::new(MemoryStore::new())).await
        }
    };

    if let Err(e) = res {
        tracing::error!("Batcher failed: {e}");
        std::process::exit(1);
    }
}
