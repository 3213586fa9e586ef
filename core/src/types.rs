//! # Batcher Types
//!
//! Requests submitted by callers, batches persisted by the engine and the
//! indexer's view of transactions and UTXOs.

use batcher_config::Strategy;
use batcher_errors::BatcherError;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Address, Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Witness element replaced by the wallet's segwit v0 ECDSA signature when a
/// script spend is signed.
pub const ADD_SIGNATURE_SEGWIT_V0: &[u8] = b"ADD_SIGNATURE_SEGWIT_V0";

/// Pay `amount` to `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    #[serde(with = "address_serde")]
    pub to: Address,
}

/// Spend every UTXO locked to the P2WSH `script_address`.
///
/// The final witness of each input is `witness`, with every
/// [`ADD_SIGNATURE_SEGWIT_V0`] element replaced by the wallet signature,
/// followed by `script`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendRequest {
    #[serde(with = "hex_vec")]
    pub witness: Vec<Vec<u8>>,
    pub script: ScriptBuf,
    #[serde(with = "address_serde")]
    pub script_address: Address,
    pub sequence: Sequence,
}

impl SpendRequest {
    pub fn needs_signature(&self) -> bool {
        self.witness.iter().any(|w| w == ADD_SIGNATURE_SEGWIT_V0)
    }
}

/// A tracking unit submitted through [`crate::batcher::BatcherWallet::send`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherRequest {
    pub id: String,
    pub spends: Vec<SpendRequest>,
    pub sends: Vec<SendRequest>,
    /// False while unbatched.
    pub status: bool,
}

impl BatcherRequest {
    /// Builds a pending request whose id is derived from its payload.
    pub fn new(spends: Vec<SpendRequest>, sends: Vec<SendRequest>) -> Result<Self, BatcherError> {
        let id = request_id(&spends, &sends)?;
        Ok(Self {
            id,
            spends,
            sends,
            status: false,
        })
    }
}

/// Hex SHA-256 of the JSON encoding of the payload.
pub fn request_id(spends: &[SpendRequest], sends: &[SendRequest]) -> Result<String, BatcherError> {
    let payload = serde_json::to_vec(&(spends, sends))
        .map_err(|e| BatcherError::InvalidRequest(e.to_string()))?;
    Ok(sha256::Hash::hash(&payload).to_string())
}

/// Confirmation status as reported by the indexer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<BlockHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<u64>,
}

impl TxStatus {
    pub fn unconfirmed() -> Self {
        Self::default()
    }
}

/// Output of a transaction, also used for prevouts of inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub scriptpubkey: ScriptBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scriptpubkey_address: Option<String>,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: Txid,
    pub vout: u32,
    #[serde(default)]
    pub prevout: Option<TxOutput>,
    pub sequence: u32,
}

impl TxInput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Indexer view of a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTx {
    pub txid: Txid,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee: Amount,
    pub weight: u64,
    pub size: u64,
    pub status: TxStatus,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
}

impl IndexedTx {
    /// Virtual size, rounded up.
    pub fn vsize(&self) -> u64 {
        self.weight.div_ceil(4)
    }

    /// Fee rate in sat/vB, rounded down.
    pub fn fee_rate(&self) -> u64 {
        match self.vsize() {
            0 => 0,
            vsize => self.fee.to_sat() / vsize,
        }
    }
}

/// Unspent output of an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    pub status: TxStatus,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// One broadcast transaction and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub tx: IndexedTx,
    pub request_ids: BTreeSet<String>,
    pub strategy: Strategy,
    pub is_stable: bool,
    pub is_confirmed: bool,
    /// Own change output, None when the change would have been dust.
    pub change_utxo: Option<Utxo>,
    /// Wallet UTXOs spent by the batch.
    pub funding_utxos: Vec<Utxo>,
    /// Unix seconds.
    pub created_at: u64,
}

impl Batch {
    pub fn txid(&self) -> Txid {
        self.tx.txid
    }

    /// Returns true if the batch owns `outpoint` as change or funding.
    pub fn claims(&self, outpoint: &OutPoint) -> bool {
        self.change_utxo
            .as_ref()
            .is_some_and(|c| &c.outpoint() == outpoint)
            || self.funding_utxos.iter().any(|u| &u.outpoint() == outpoint)
    }
}

/// Rates suggested by the fee oracle in sat/vB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSuggestion {
    #[serde(rename = "minimumFee")]
    pub minimum: u64,
    #[serde(rename = "economyFee")]
    pub economy: u64,
    #[serde(rename = "hourFee")]
    pub low: u64,
    #[serde(rename = "halfHourFee")]
    pub medium: u64,
    #[serde(rename = "fastestFee")]
    pub high: u64,
}

mod address_serde {
    use bitcoin::Address;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(address: &Address, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(address)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Address, D::Error> {
        let s = String::deserialize(d)?;
        Address::from_str(&s)
            .map(|a| a.assume_checked())
            .map_err(serde::de::Error::custom)
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(items.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_address, txid_from_byte};

    #[test]
    fn request_id_is_content_derived() {
        let sends = vec![SendRequest {
            amount: Amount::from_sat(100_000),
            to: test_address(7),
        }];
        let a = BatcherRequest::new(vec![], sends.clone()).unwrap();
        let b = BatcherRequest::new(vec![], sends).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);

        let c = BatcherRequest::new(
            vec![],
            vec![SendRequest {
                amount: Amount::from_sat(100_001),
                to: test_address(7),
            }],
        )
        .unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn decode_esplora_tx() {
        let txid = txid_from_byte(3);
        let json = serde_json::json!({
            "txid": txid.to_string(),
            "version": 2,
            "locktime": 0,
            "fee": 1410,
            "weight": 561,
            "size": 222,
            "status": {"confirmed": false},
            "vin": [{
                "txid": txid_from_byte(2).to_string(),
                "vout": 1,
                "is_coinbase": false,
                "sequence": 4294967293u32,
                "prevout": {
                    "scriptpubkey": "0014751e76e8199196d454941c45d1b3a323f1433bd6",
                    "scriptpubkey_type": "v0_p2wpkh",
                    "value": 50000
                }
            }],
            "vout": [{
                "scriptpubkey": "0014751e76e8199196d454941c45d1b3a323f1433bd6",
                "value": 48590
            }]
        });
        let tx: IndexedTx = serde_json::from_value(json).unwrap();
        assert_eq!(tx.vsize(), 141);
        assert_eq!(tx.fee_rate(), 10);
        assert_eq!(tx.vin[0].prevout.as_ref().unwrap().value, Amount::from_sat(50000));
        assert!(!tx.status.confirmed);
    }

    #[test]
    fn fee_suggestion_from_mempool_names() {
        let s: FeeSuggestion = serde_json::from_str(
            r#"{"fastestFee": 20, "halfHourFee": 15, "hourFee": 10, "economyFee": 5, "minimumFee": 1}"#,
        )
        .unwrap();
        assert_eq!(s.high, 20);
        assert_eq!(s.medium, 15);
        assert_eq!(s.low, 10);
        assert_eq!(s.economy, 5);
        assert_eq!(s.minimum, 1);
    }
}
