//! # Batcher Cache
//!
//! Persistent state of one strategy: requests and batches, split into pending
//! and finalized partitions. Every mutation that touches more than one key is
//! a single [`WriteBatch`], so a batch or request is never visible in both
//! partitions or in neither.
//!
//! Reads look in the pending partition first, then in the finalized one.

mod keys;
pub mod kv;

use crate::types::{Batch, BatcherRequest};
use async_trait::async_trait;
use batcher_config::Strategy;
use batcher_errors::StoreError;
use bitcoin::Txid;
use keys::CacheKey;
use kv::{KvStore, WriteBatch};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use kv::{MemoryStore, SledStore};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[async_trait]
pub trait BatcherCache: Send + Sync + 'static {
    fn strategy(&self) -> Strategy;

    async fn read_batch(&self, txid: Txid) -> Result<Batch>;

    /// The batch that currently settles request `id`.
    async fn read_batch_by_req_id(&self, id: &str) -> Result<Batch>;

    /// Pending batches, oldest first.
    async fn read_pending_batches(&self) -> Result<Vec<Batch>>;

    async fn read_latest_batch(&self) -> Result<Batch>;

    /// Stores a new batch, marks its requests as batched and moves the latest
    /// pointer to it.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if a batch with the same txid is stored.
    async fn save_batch(&self, batch: Batch) -> Result<()>;

    /// Overwrites stored batches, moving confirmed ones to the finalized
    /// partition.
    async fn update_batches(&self, batches: Vec<Batch>) -> Result<()>;

    /// Writes `batches` like [`BatcherCache::update_batches`] and deletes
    /// every other pending batch. Requests only settled by deleted batches
    /// return to pending.
    async fn update_and_delete_pending_batches(&self, batches: Vec<Batch>) -> Result<()>;

    /// Deletes every pending batch, returning their requests to pending.
    async fn delete_pending_batches(&self) -> Result<()>;

    async fn read_request(&self, id: &str) -> Result<BatcherRequest>;

    async fn read_requests(&self, ids: &[String]) -> Result<Vec<BatcherRequest>>;

    async fn read_pending_requests(&self) -> Result<Vec<BatcherRequest>>;

    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if a request with the same id is stored.
    async fn save_request(&self, request: BatcherRequest) -> Result<()>;
}

/// [`BatcherCache`] over any [`KvStore`]. Instances of different strategies
/// may share one store.
#[derive(Debug)]
pub struct KvCache<S: KvStore> {
    store: Arc<S>,
    strategy: Strategy,
    // serializes read-modify-write paths
    write_lock: Mutex<()>,
}

impl<S: KvStore> KvCache<S> {
    pub fn new(store: Arc<S>, strategy: Strategy) -> Self {
        Self {
            store,
            strategy,
            write_lock: Mutex::new(()),
        }
    }

    fn key(&self, key: CacheKey<'_>) -> Vec<u8> {
        key.as_key(self.strategy)
    }

    fn get_json<T: DeserializeOwned>(&self, key: CacheKey<'_>) -> Result<Option<T>> {
        match self.store.get(&self.key(key))? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: CacheKey<'_>) -> Result<Vec<T>> {
        self.store
            .scan_prefix(&prefix.as_prefix(self.strategy))?
            .into_iter()
            .map(|(_, v)| Ok(serde_json::from_slice(&v)?))
            .collect()
    }

    fn get_batch(&self, txid: &Txid) -> Result<Option<Batch>> {
        if let Some(batch) = self.get_json(CacheKey::PendingBatch(Some(txid)))? {
            return Ok(Some(batch));
        }
        self.get_json(CacheKey::FinalizedBatch(Some(txid)))
    }

    fn get_request(&self, id: &str) -> Result<Option<BatcherRequest>> {
        if let Some(request) = self.get_json(CacheKey::PendingRequest(Some(id)))? {
            return Ok(Some(request));
        }
        self.get_json(CacheKey::FinalizedRequest(Some(id)))
    }

    fn get_index(&self, id: &str) -> Result<Option<Txid>> {
        match self.store.get(&self.key(CacheKey::RequestIndex(Some(id))))? {
            Some(v) => Ok(Some(decode_txid(&v)?)),
            None => Ok(None),
        }
    }

    fn get_latest(&self) -> Result<Option<Txid>> {
        match self.store.get(&self.key(CacheKey::LatestBatch))? {
            Some(v) => Ok(Some(decode_txid(&v)?)),
            None => Ok(None),
        }
    }

    fn pending_batches(&self) -> Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = self.scan_json(CacheKey::PendingBatch(None))?;
        batches.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.txid().cmp(&b.txid()))
        });
        Ok(batches)
    }

    /// Puts `batch` in the partition matching its confirmation state.
    fn put_batch(&self, wb: &mut WriteBatch, batch: &Batch) -> Result<()> {
        let txid = batch.txid();
        let value = serde_json::to_vec(batch)?;
        if batch.is_confirmed {
            wb.delete(self.key(CacheKey::PendingBatch(Some(&txid))));
            wb.put(self.key(CacheKey::FinalizedBatch(Some(&txid))), value);
        } else {
            wb.put(self.key(CacheKey::PendingBatch(Some(&txid))), value);
        }
        Ok(())
    }

    /// Deletes every pending batch not in `keep` and returns requests that
    /// are left without a settling batch to pending.
    fn delete_pending_except(&self, wb: &mut WriteBatch, keep: &[Batch]) -> Result<usize> {
        let kept: BTreeSet<Txid> = keep.iter().map(Batch::txid).collect();
        let kept_requests: BTreeSet<&String> =
            keep.iter().flat_map(|b| b.request_ids.iter()).collect();

        let deleted: Vec<Batch> = self
            .pending_batches()?
            .into_iter()
            .filter(|b| !kept.contains(&b.txid()))
            .collect();
        let deleted_txids: BTreeSet<Txid> = deleted.iter().map(Batch::txid).collect();

        // Requeue each request once even if several deleted batches carry it.
        let mut requeued: BTreeSet<String> = BTreeSet::new();
        for batch in &deleted {
            wb.delete(self.key(CacheKey::PendingBatch(Some(&batch.txid()))));

            for id in &batch.request_ids {
                if kept_requests.contains(id) || requeued.contains(id) {
                    continue;
                }
                let settled_elsewhere = match self.get_index(id)? {
                    Some(txid) => !deleted_txids.contains(&txid),
                    None => false,
                };
                if settled_elsewhere {
                    continue;
                }
                if let Some(mut request) = self.get_request(id)? {
                    request.status = false;
                    wb.delete(self.key(CacheKey::FinalizedRequest(Some(id))));
                    wb.delete(self.key(CacheKey::RequestIndex(Some(id))));
                    wb.put(
                        self.key(CacheKey::PendingRequest(Some(id))),
                        serde_json::to_vec(&request)?,
                    );
                    requeued.insert(id.clone());
                }
            }
        }

        if let Some(latest) = self.get_latest()? {
            if deleted_txids.contains(&latest) {
                match keep.last() {
                    Some(batch) => wb.put(
                        self.key(CacheKey::LatestBatch),
                        batch.txid().to_string().into_bytes(),
                    ),
                    None => wb.delete(self.key(CacheKey::LatestBatch)),
                }
            }
        }

        if !deleted.is_empty() {
            tracing::debug!(
                strategy = %self.strategy,
                deleted = deleted.len(),
                requeued = requeued.len(),
                "Deleted pending batches"
            );
        }
        Ok(deleted.len())
    }
}

fn decode_txid(v: &[u8]) -> Result<Txid> {
    let s = std::str::from_utf8(v).map_err(|e| StoreError::Corrupted(e.to_string()))?;
    Txid::from_str(s).map_err(|e| StoreError::Corrupted(e.to_string()))
}

#[async_trait]
impl<S: KvStore> BatcherCache for KvCache<S> {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    async fn read_batch(&self, txid: Txid) -> Result<Batch> {
        self.get_batch(&txid)?
            .ok_or_else(|| StoreError::NotFound(format!("batch {txid}")))
    }

    async fn read_batch_by_req_id(&self, id: &str) -> Result<Batch> {
        let txid = self
            .get_index(id)?
            .ok_or_else(|| StoreError::NotFound(format!("batch of request {id}")))?;
        self.read_batch(txid).await
    }

    async fn read_pending_batches(&self) -> Result<Vec<Batch>> {
        self.pending_batches()
    }

    async fn read_latest_batch(&self) -> Result<Batch> {
        let txid = self
            .get_latest()?
            .ok_or_else(|| StoreError::NotFound("latest batch".to_string()))?;
        self.read_batch(txid).await
    }

    async fn save_batch(&self, batch: Batch) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let txid = batch.txid();

        if self.get_batch(&txid)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("batch {txid}")));
        }

        let mut wb = WriteBatch::new();
        self.put_batch(&mut wb, &batch)?;

        for id in &batch.request_ids {
            let mut request = self
                .get_request(id)?
                .ok_or_else(|| StoreError::NotFound(format!("request {id}")))?;
            request.status = true;
            wb.delete(self.key(CacheKey::PendingRequest(Some(id))));
            wb.put(
                self.key(CacheKey::FinalizedRequest(Some(id))),
                serde_json::to_vec(&request)?,
            );
            wb.put(
                self.key(CacheKey::RequestIndex(Some(id))),
                txid.to_string().into_bytes(),
            );
        }

        wb.put(
            self.key(CacheKey::LatestBatch),
            txid.to_string().into_bytes(),
        );

        self.store.write(wb)?;
        tracing::debug!(strategy = %self.strategy, %txid, requests = batch.request_ids.len(), "Saved batch");
        Ok(())
    }

    async fn update_batches(&self, batches: Vec<Batch>) -> Result<()> {
        if batches.is_empty() {
            return Err(StoreError::NothingToUpdate);
        }
        let _guard = self.write_lock.lock().await;

        let mut wb = WriteBatch::new();
        for batch in &batches {
            self.put_batch(&mut wb, batch)?;
        }
        self.store.write(wb)
    }

    async fn update_and_delete_pending_batches(&self, batches: Vec<Batch>) -> Result<()> {
        if batches.is_empty() {
            return Err(StoreError::NothingToUpdate);
        }
        let _guard = self.write_lock.lock().await;

        let mut wb = WriteBatch::new();
        for batch in &batches {
            self.put_batch(&mut wb, batch)?;
            for id in &batch.request_ids {
                wb.put(
                    self.key(CacheKey::RequestIndex(Some(id))),
                    batch.txid().to_string().into_bytes(),
                );
            }
        }
        self.delete_pending_except(&mut wb, &batches)?;
        self.store.write(wb)
    }

    async fn delete_pending_batches(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut wb = WriteBatch::new();
        self.delete_pending_except(&mut wb, &[])?;
        if wb.is_empty() {
            return Ok(());
        }
        self.store.write(wb)
    }

    async fn read_request(&self, id: &str) -> Result<BatcherRequest> {
        self.get_request(id)?
            .ok_or_else(|| StoreError::NotFound(format!("request {id}")))
    }

    async fn read_requests(&self, ids: &[String]) -> Result<Vec<BatcherRequest>> {
        let mut requests = Vec::with_capacity(ids.len());
        for id in ids {
            requests.push(self.read_request(id).await?);
        }
        Ok(requests)
    }

    async fn read_pending_requests(&self) -> Result<Vec<BatcherRequest>> {
        self.scan_json(CacheKey::PendingRequest(None))
    }

    async fn save_request(&self, request: BatcherRequest) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.get_request(&request.id)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("request {}", request.id)));
        }

        let mut wb = WriteBatch::new();
        wb.put(
            self.key(CacheKey::PendingRequest(Some(&request.id))),
            serde_json::to_vec(&request)?,
        );
        self.store.write(wb)
    }
}
