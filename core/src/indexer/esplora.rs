//! Esplora HTTP API client.

use super::IndexerClient;
use crate::types::{IndexedTx, Utxo};
use async_trait::async_trait;
use batcher_errors::{BatcherError, BroadcastError, IndexerError};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Address, Transaction, Txid};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: reqwest::Client,
    base_url: String,
}

impl EsploraClient {
    /// `base_url` is the API root, e.g. `https://blockstream.info/testnet/api`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, IndexerError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IndexerError::Status(status, body));
        }

        resp.json::<T>()
            .await
            .map_err(|e| IndexerError::Decode(format!("{url}: {e}")))
    }
}

#[async_trait]
impl IndexerClient for EsploraClient {
    async fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>, BatcherError> {
        Ok(self.get_json(&format!("/address/{address}/utxo")).await?)
    }

    async fn get_tx(&self, txid: Txid) -> Result<IndexedTx, BatcherError> {
        match self.get_json(&format!("/tx/{txid}")).await {
            Ok(tx) => Ok(tx),
            Err(IndexerError::Status(code, _)) if code == StatusCode::NOT_FOUND => {
                Err(BatcherError::TxNotFound(txid))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn submit_tx(&self, tx: &Transaction) -> Result<(), BatcherError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self
            .client
            .post(&url)
            .body(serialize_hex(tx))
            .send()
            .await
            .map_err(IndexerError::from)?;

        if resp.status().is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(BroadcastError::classify(&body).into())
    }
}
