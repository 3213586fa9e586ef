//! # Testing Utilities
//!
//! Deterministic keys and fixtures plus in-process stand-ins for the indexer
//! and the fee oracle. [`MockIndexer`] keeps a toy mempool that enforces
//! enough relay policy (conflicts, replacement fees, missing inputs) for the
//! engines' race handling to be exercised.

use crate::builder::{P2wpkhSigner, TxBuilder};
use crate::cache::{BatcherCache, KvCache, MemoryStore};
use crate::engine::Engine;
use crate::fee::MIN_RELAY_FEE_RATE;
use crate::indexer::{FeeEstimator, IndexerClient};
use crate::types::{
    Batch, BatcherRequest, FeeSuggestion, IndexedTx, SendRequest, TxInput, TxOutput, TxStatus,
    Utxo,
};
use async_trait::async_trait;
use batcher_config::{BatcherOptions, Strategy};
use batcher_errors::{BatcherError, BroadcastError, FeeErr};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Address, Amount, BlockHash, CompressedPublicKey, Network, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub fn test_address(seed: u8) -> Address {
    let secret = SecretKey::from_slice(&[seed.max(1); 32]).unwrap();
    let public_key = secret.public_key(&crate::builder::SECP);
    Address::p2wpkh(&CompressedPublicKey(public_key), Network::Regtest)
}

pub fn txid_from_byte(byte: u8) -> Txid {
    Txid::from_byte_array([byte; 32])
}

/// Confirmed UTXO of the synthetic transaction `seed`.
pub fn utxo(seed: u8, vout: u32, value: u64) -> Utxo {
    Utxo {
        txid: txid_from_byte(seed),
        vout,
        value: Amount::from_sat(value),
        status: confirmed_at(1),
    }
}

/// Pending CPFP batch without requests whose transaction has the given
/// weight and fee.
pub fn batch_with_fee(seed: u8, weight: u64, fee: u64) -> Batch {
    Batch {
        tx: IndexedTx {
            txid: txid_from_byte(seed),
            fee: Amount::from_sat(fee),
            weight,
            size: weight / 4,
            status: TxStatus::unconfirmed(),
            vin: vec![],
            vout: vec![],
        },
        request_ids: BTreeSet::new(),
        strategy: Strategy::Cpfp,
        is_stable: true,
        is_confirmed: false,
        change_utxo: None,
        funding_utxos: vec![],
        created_at: 0,
    }
}

/// Request paying `amount` to a fixed foreign address.
pub fn send_request(amount: u64) -> BatcherRequest {
    BatcherRequest::new(
        vec![],
        vec![SendRequest {
            amount: Amount::from_sat(amount),
            to: test_address(200),
        }],
    )
    .unwrap()
}

pub fn test_signer() -> P2wpkhSigner {
    P2wpkhSigner::new(SecretKey::from_slice(&[1u8; 32]).unwrap(), Network::Regtest)
}

fn confirmed_at(height: u32) -> TxStatus {
    TxStatus {
        confirmed: true,
        block_height: Some(height),
        block_hash: Some(BlockHash::all_zeros()),
        block_time: Some(1_700_000_000 + height as u64 * 600),
    }
}

/// Oracle answering every level with the same rate.
#[derive(Debug)]
pub struct MockFeeEstimator {
    rate: AtomicU64,
}

impl MockFeeEstimator {
    pub fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
        }
    }

    pub fn set_rate(&self, rate: u64) {
        self.rate.store(rate, Ordering::SeqCst);
    }
}

#[async_trait]
impl FeeEstimator for MockFeeEstimator {
    async fn fee_suggestion(&self) -> Result<FeeSuggestion, FeeErr> {
        let rate = self.rate.load(Ordering::SeqCst);
        Ok(FeeSuggestion {
            minimum: 1,
            economy: rate,
            low: rate,
            medium: rate,
            high: rate,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockState {
    Mempool,
    Confirmed(u32),
    Evicted,
}

#[derive(Debug, Clone)]
struct MockTx {
    tx: Transaction,
    fee: Amount,
    state: MockState,
}

#[derive(Debug, Default)]
struct MockChain {
    txs: HashMap<Txid, MockTx>,
    height: u32,
    funded: u32,
    get_tx_calls: HashMap<Txid, usize>,
    fail_next_submit: Option<BroadcastError>,
    confirm_before_submit: bool,
    submitted: Vec<Txid>,
}

impl MockChain {
    fn live(&self, txid: &Txid) -> Option<&MockTx> {
        self.txs.get(txid).filter(|t| t.state != MockState::Evicted)
    }

    fn output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.live(&outpoint.txid)
            .and_then(|t| t.tx.output.get(outpoint.vout as usize).cloned())
    }

    fn spender(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.txs
            .iter()
            .filter(|(_, t)| t.state != MockState::Evicted)
            .find(|(_, t)| t.tx.input.iter().any(|i| &i.previous_output == outpoint))
            .map(|(txid, _)| *txid)
    }

    fn status(state: MockState) -> TxStatus {
        match state {
            MockState::Confirmed(height) => confirmed_at(height),
            _ => TxStatus::unconfirmed(),
        }
    }

    /// `roots` and every live transaction spending from them.
    fn with_descendants(&self, roots: Vec<Txid>) -> BTreeSet<Txid> {
        let mut found: BTreeSet<Txid> = BTreeSet::new();
        let mut stack = roots;
        while let Some(txid) = stack.pop() {
            if !found.insert(txid) {
                continue;
            }
            for (child, t) in &self.txs {
                if t.state != MockState::Evicted
                    && t.tx.input.iter().any(|i| i.previous_output.txid == txid)
                {
                    stack.push(*child);
                }
            }
        }
        found
    }

    fn evict(&mut self, txid: Txid) {
        for victim in self.with_descendants(vec![txid]) {
            if let Some(t) = self.txs.get_mut(&victim) {
                t.state = MockState::Evicted;
            }
        }
    }

    /// Confirms `txid` and its unconfirmed ancestors.
    fn confirm(&mut self, txid: Txid) {
        self.height += 1;
        let height = self.height;
        let mut stack = vec![txid];
        while let Some(txid) = stack.pop() {
            let Some(t) = self.txs.get_mut(&txid) else {
                continue;
            };
            if matches!(t.state, MockState::Confirmed(_)) {
                continue;
            }
            t.state = MockState::Confirmed(height);
            stack.extend(t.tx.input.iter().map(|i| i.previous_output.txid));
        }
    }

    fn confirm_all(&mut self) {
        self.height += 1;
        let height = self.height;
        for t in self.txs.values_mut() {
            if t.state == MockState::Mempool {
                t.state = MockState::Confirmed(height);
            }
        }
    }

    fn indexed(&self, txid: Txid) -> Option<IndexedTx> {
        let t = self.txs.get(&txid)?;
        let vin = t
            .tx
            .input
            .iter()
            .map(|i| TxInput {
                txid: i.previous_output.txid,
                vout: i.previous_output.vout,
                prevout: self.txs.get(&i.previous_output.txid).and_then(|p| {
                    p.tx.output
                        .get(i.previous_output.vout as usize)
                        .map(output_view)
                }),
                sequence: i.sequence.0,
            })
            .collect();

        Some(IndexedTx {
            txid,
            fee: t.fee,
            weight: t.tx.weight().to_wu(),
            size: t.tx.total_size() as u64,
            status: Self::status(t.state),
            vin,
            vout: t.tx.output.iter().map(output_view).collect(),
        })
    }

    fn submit(&mut self, tx: &Transaction) -> Result<(), BroadcastError> {
        let txid = tx.compute_txid();
        if let Some(known) = self.live(&txid) {
            return match known.state {
                MockState::Confirmed(_) => Err(BroadcastError::AlreadyInChain),
                _ => Ok(()),
            };
        }

        let mut input_total = Amount::ZERO;
        let mut conflicts = Vec::new();
        for input in &tx.input {
            let prevout = self
                .output(&input.previous_output)
                .ok_or(BroadcastError::InputsMissingOrSpent)?;
            input_total += prevout.value;

            if let Some(spender) = self.spender(&input.previous_output) {
                match self.txs.get(&spender).map(|t| t.state) {
                    Some(MockState::Mempool) => conflicts.push(spender),
                    _ => return Err(BroadcastError::InputsMissingOrSpent),
                }
            }
        }

        let output_total: Amount = tx.output.iter().map(|o| o.value).sum();
        let fee = input_total
            .checked_sub(output_total)
            .ok_or_else(|| BroadcastError::Rejected("bad-txns-in-belowout".to_string()))?;

        if !conflicts.is_empty() {
            let replaced = self.with_descendants(conflicts);
            let replaced_fee: Amount = replaced
                .iter()
                .filter_map(|txid| self.txs.get(txid))
                .map(|t| t.fee)
                .sum();
            let increment = Amount::from_sat(tx.vsize() as u64 * MIN_RELAY_FEE_RATE);
            if fee < replaced_fee + increment {
                return Err(BroadcastError::InsufficientReplacementFee);
            }
            for victim in replaced {
                if let Some(t) = self.txs.get_mut(&victim) {
                    t.state = MockState::Evicted;
                }
            }
        }

        self.txs.insert(
            txid,
            MockTx {
                tx: tx.clone(),
                fee,
                state: MockState::Mempool,
            },
        );
        self.submitted.push(txid);
        Ok(())
    }
}

fn output_view(output: &TxOut) -> TxOutput {
    TxOutput {
        scriptpubkey: output.script_pubkey.clone(),
        scriptpubkey_address: None,
        value: output.value,
    }
}

/// In-process indexer with a toy mempool.
#[derive(Debug, Default)]
pub struct MockIndexer {
    chain: Mutex<MockChain>,
}

impl MockIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pays `amount` to `address` in a new confirmed transaction.
    pub fn fund(&self, address: &Address, amount: Amount) -> Utxo {
        let mut chain = self.chain.lock().unwrap();
        chain.funded += 1;
        chain.height += 1;
        let height = chain.height;

        let tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::from_consensus(chain.funded),
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: amount,
                script_pubkey: address.script_pubkey(),
            }],
        };
        let txid = tx.compute_txid();
        chain.txs.insert(
            txid,
            MockTx {
                tx,
                fee: Amount::ZERO,
                state: MockState::Confirmed(height),
            },
        );

        Utxo {
            txid,
            vout: 0,
            value: amount,
            status: confirmed_at(height),
        }
    }

    pub fn confirm_all(&self) {
        self.chain.lock().unwrap().confirm_all();
    }

    pub fn confirm(&self, txid: Txid) {
        self.chain.lock().unwrap().confirm(txid);
    }

    /// Drops `txid` and its descendants from the mempool.
    pub fn evict(&self, txid: Txid) {
        self.chain.lock().unwrap().evict(txid);
    }

    /// Simulates a miner picking the replaced version `confirmed` instead of
    /// its replacement `evicted`.
    pub fn replace_and_confirm(&self, evicted: Txid, confirmed: Txid) {
        let mut chain = self.chain.lock().unwrap();
        chain.evict(evicted);
        if let Some(t) = chain.txs.get_mut(&confirmed) {
            t.state = MockState::Mempool;
        }
        chain.confirm(confirmed);
    }

    pub fn fail_next_submit(&self, error: BroadcastError) {
        self.chain.lock().unwrap().fail_next_submit = Some(error);
    }

    /// Mines everything in the mempool right before the next broadcast lands.
    pub fn confirm_all_before_next_submit(&self) {
        self.chain.lock().unwrap().confirm_before_submit = true;
    }

    pub fn in_mempool(&self, txid: Txid) -> bool {
        self.chain
            .lock()
            .unwrap()
            .txs
            .get(&txid)
            .is_some_and(|t| t.state == MockState::Mempool)
    }

    /// Indexer view of a live transaction, without counting as a lookup.
    pub fn tx(&self, txid: Txid) -> Option<IndexedTx> {
        let chain = self.chain.lock().unwrap();
        chain.live(&txid)?;
        chain.indexed(txid)
    }

    pub fn get_tx_calls(&self, txid: Txid) -> usize {
        self.chain
            .lock()
            .unwrap()
            .get_tx_calls
            .get(&txid)
            .copied()
            .unwrap_or_default()
    }

    pub fn submitted(&self) -> Vec<Txid> {
        self.chain.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl IndexerClient for MockIndexer {
    async fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>, BatcherError> {
        let chain = self.chain.lock().unwrap();
        let script_pubkey = address.script_pubkey();

        let mut utxos: Vec<Utxo> = chain
            .txs
            .iter()
            .filter(|(_, t)| t.state != MockState::Evicted)
            .flat_map(|(txid, t)| {
                t.tx.output
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| o.script_pubkey == script_pubkey)
                    .map(move |(vout, o)| Utxo {
                        txid: *txid,
                        vout: vout as u32,
                        value: o.value,
                        status: MockChain::status(t.state),
                    })
            })
            .filter(|u| chain.spender(&u.outpoint()).is_none())
            .collect();
        utxos.sort_by_key(|u| u.outpoint());
        Ok(utxos)
    }

    async fn get_tx(&self, txid: Txid) -> Result<IndexedTx, BatcherError> {
        let mut chain = self.chain.lock().unwrap();
        *chain.get_tx_calls.entry(txid).or_default() += 1;
        if chain.live(&txid).is_none() {
            return Err(BatcherError::TxNotFound(txid));
        }
        chain.indexed(txid).ok_or(BatcherError::TxNotFound(txid))
    }

    async fn submit_tx(&self, tx: &Transaction) -> Result<(), BatcherError> {
        let mut chain = self.chain.lock().unwrap();
        if std::mem::take(&mut chain.confirm_before_submit) {
            chain.confirm_all();
        }
        if let Some(error) = chain.fail_next_submit.take() {
            return Err(error.into());
        }
        chain.submit(tx).map_err(Into::into)
    }
}

pub type MockEngine = Engine<MockIndexer, MockFeeEstimator, P2wpkhSigner, KvCache<MemoryStore>>;

pub struct TestEngine {
    pub engine: MockEngine,
    pub indexer: Arc<MockIndexer>,
    pub fees: Arc<MockFeeEstimator>,
    pub store: Arc<MemoryStore>,
}

/// Engine over the mocks, oracle at 10 sat/vB.
pub fn test_engine(strategy: Strategy) -> TestEngine {
    let indexer = Arc::new(MockIndexer::new());
    let fees = Arc::new(MockFeeEstimator::new(10));
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(KvCache::new(store.clone(), strategy));
    let opts = BatcherOptions {
        strategy,
        ..Default::default()
    };

    TestEngine {
        engine: Engine::new(
            indexer.clone(),
            fees.clone(),
            Arc::new(test_signer()),
            cache,
            opts,
        ),
        indexer,
        fees,
        store,
    }
}

/// Stores a pending request paying `amount` and returns its id.
pub async fn queue_send<I, F, B, C>(engine: &Engine<I, F, B, C>, amount: u64) -> String
where
    I: IndexerClient,
    F: FeeEstimator,
    B: TxBuilder,
    C: BatcherCache,
{
    let request = send_request(amount);
    let id = request.id.clone();
    engine.cache().save_request(request).await.unwrap();
    id
}
