//! # Batcher
//!
//! Batches payment requests into Bitcoin transactions and keeps them moving
//! through the mempool, either by replacing the latest batch (RBF) or by
//! chaining children that pay for their parents (CPFP).
//!
//! [`batcher::BatcherWallet`] is the entry point. It owns an
//! [`engine::Engine`] and runs it on a fixed interval in the background.

pub mod batcher;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod engine;
pub mod fee;
pub mod indexer;
pub mod task;
pub mod types;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

pub use batcher::BatcherWallet;
pub use batcher_config::{BatcherConfig, BatcherOptions, FeeLevel, Strategy, TxOptions};
pub use batcher_errors::BatcherError;
pub use builder::{P2wpkhSigner, TxBuilder};
pub use cache::{BatcherCache, KvCache, MemoryStore, SledStore};
pub use engine::Engine;
pub use indexer::{EsploraClient, FeeEstimator, IndexerClient, MempoolFeeEstimator};
