//! # Transaction Builder
//!
//! Assembles and signs batch transactions. [`TxBuilder`] is the signing seam
//! used by the engines; [`P2wpkhSigner`] is a single-key implementation that
//! also fills signature placeholders of P2WSH script spends.

use crate::fee::DUST_LIMIT;
use crate::types::{
    IndexedTx, SendRequest, SpendRequest, TxInput, TxOutput, TxStatus, Utxo, ADD_SIGNATURE_SEGWIT_V0,
};
use batcher_errors::BatcherError;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, ecdsa, Address, Amount, CompressedPublicKey, Network, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};
use eyre::Context;
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;

lazy_static::lazy_static! {
    pub static ref SECP: Secp256k1<All> = Secp256k1::new();
}

/// BIP125 opt-in sequence of wallet inputs.
pub const RBF_SEQUENCE: Sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;

/// Virtual size of a signed P2WPKH input.
pub const P2WPKH_INPUT_VSIZE: u64 = 68;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// Owned by the wallet key.
    Wallet,
    Script(SpendRequest),
}

/// Input of a transaction about to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedInput {
    pub utxo: Utxo,
    pub sequence: Sequence,
    pub kind: InputKind,
}

impl PlannedInput {
    pub fn wallet(utxo: Utxo) -> Self {
        Self {
            utxo,
            sequence: RBF_SEQUENCE,
            kind: InputKind::Wallet,
        }
    }

    pub fn script(utxo: Utxo, spend: SpendRequest) -> Self {
        Self {
            utxo,
            sequence: spend.sequence,
            kind: InputKind::Script(spend),
        }
    }

    pub fn is_wallet(&self) -> bool {
        matches!(self.kind, InputKind::Wallet)
    }
}

pub trait TxBuilder: Send + Sync + 'static {
    fn address(&self) -> &Address;

    fn network(&self) -> Network;

    /// Virtual size one signed wallet input adds to a transaction.
    fn input_vsize(&self) -> u64;

    /// Signs a transaction spending `inputs` into `outputs`, in order.
    fn sign(&self, inputs: &[PlannedInput], outputs: Vec<TxOut>) -> Result<Transaction, BatcherError>;
}

/// Single-key P2WPKH wallet.
#[derive(Debug, Clone)]
pub struct P2wpkhSigner {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
    network: Network,
}

impl P2wpkhSigner {
    pub fn new(secret_key: SecretKey, network: Network) -> Self {
        let public_key = secret_key.public_key(&SECP);
        let address = Address::p2wpkh(&CompressedPublicKey(public_key), network);

        Self {
            secret_key,
            public_key,
            address,
            network,
        }
    }

    /// Parses a hex encoded secret key.
    pub fn from_secret(secret: &SecretString, network: Network) -> Result<Self, BatcherError> {
        let secret_key = SecretKey::from_str(secret.expose_secret())
            .map_err(|e| BatcherError::ConfigError(format!("invalid secret key: {e}")))?;
        Ok(Self::new(secret_key, network))
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn sign_digest(&self, digest: [u8; 32]) -> ecdsa::Signature {
        let signature = SECP.sign_ecdsa_low_r(&Message::from_digest(digest), &self.secret_key);
        ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        }
    }
}

impl TxBuilder for P2wpkhSigner {
    fn address(&self) -> &Address {
        &self.address
    }

    fn network(&self) -> Network {
        self.network
    }

    fn input_vsize(&self) -> u64 {
        P2WPKH_INPUT_VSIZE
    }

    fn sign(&self, inputs: &[PlannedInput], outputs: Vec<TxOut>) -> Result<Transaction, BatcherError> {
        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: inputs
                .iter()
                .map(|i| TxIn {
                    previous_output: i.utxo.outpoint(),
                    script_sig: ScriptBuf::new(),
                    sequence: i.sequence,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        };

        let wallet_spk = self.address.script_pubkey();
        let mut witnesses = Vec::with_capacity(inputs.len());
        {
            let mut sighash_cache = SighashCache::new(&tx);
            for (index, input) in inputs.iter().enumerate() {
                let witness = match &input.kind {
                    InputKind::Wallet => {
                        let sighash = sighash_cache
                            .p2wpkh_signature_hash(
                                index,
                                &wallet_spk,
                                input.utxo.value,
                                EcdsaSighashType::All,
                            )
                            .wrap_err("Failed to compute p2wpkh sighash")?;
                        let signature = self.sign_digest(sighash.to_byte_array());
                        Witness::p2wpkh(&signature, &self.public_key)
                    }
                    InputKind::Script(spend) => {
                        let mut elements: Vec<Vec<u8>> = Vec::with_capacity(spend.witness.len() + 1);
                        if spend.needs_signature() {
                            let sighash = sighash_cache
                                .p2wsh_signature_hash(
                                    index,
                                    &spend.script,
                                    input.utxo.value,
                                    EcdsaSighashType::All,
                                )
                                .wrap_err("Failed to compute p2wsh sighash")?;
                            let signature = self.sign_digest(sighash.to_byte_array()).to_vec();
                            for element in &spend.witness {
                                if element == ADD_SIGNATURE_SEGWIT_V0 {
                                    elements.push(signature.clone());
                                } else {
                                    elements.push(element.clone());
                                }
                            }
                        } else {
                            elements.extend(spend.witness.iter().cloned());
                        }
                        elements.push(spend.script.to_bytes());
                        Witness::from_slice(&elements)
                    }
                };
                witnesses.push(witness);
            }
        }

        for (txin, witness) in tx.input.iter_mut().zip(witnesses) {
            txin.witness = witness;
        }
        Ok(tx)
    }
}

/// A signed transaction and what it spends.
#[derive(Debug, Clone)]
pub struct BuiltTx {
    pub tx: Transaction,
    /// Inputs value minus outputs value.
    pub fee: Amount,
    pub inputs: Vec<PlannedInput>,
    /// Wallet change, always the last output.
    pub change: Option<Utxo>,
}

impl BuiltTx {
    pub fn vsize(&self) -> u64 {
        self.tx.vsize() as u64
    }

    pub fn wallet_inputs(&self) -> Vec<Utxo> {
        self.inputs
            .iter()
            .filter(|i| i.is_wallet())
            .map(|i| i.utxo.clone())
            .collect()
    }

    /// Unconfirmed view of the transaction, used when the indexer has not
    /// picked it up yet.
    pub fn indexed(&self, wallet: &Address) -> IndexedTx {
        let txid = self.tx.compute_txid();
        let vin = self
            .inputs
            .iter()
            .zip(&self.tx.input)
            .map(|(planned, txin)| {
                let address = match &planned.kind {
                    InputKind::Wallet => wallet.clone(),
                    InputKind::Script(spend) => spend.script_address.clone(),
                };
                TxInput {
                    txid: planned.utxo.txid,
                    vout: planned.utxo.vout,
                    prevout: Some(TxOutput {
                        scriptpubkey: address.script_pubkey(),
                        scriptpubkey_address: Some(address.to_string()),
                        value: planned.utxo.value,
                    }),
                    sequence: txin.sequence.0,
                }
            })
            .collect();
        let vout = self
            .tx
            .output
            .iter()
            .map(|o| TxOutput {
                scriptpubkey: o.script_pubkey.clone(),
                scriptpubkey_address: None,
                value: o.value,
            })
            .collect();

        IndexedTx {
            txid,
            fee: self.fee,
            weight: self.tx.weight().to_wu(),
            size: self.tx.total_size() as u64,
            status: TxStatus::unconfirmed(),
            vin,
            vout,
        }
    }
}

/// Builds and signs a transaction paying `sends` from `inputs` with an
/// absolute fee of `fee` sats. The remainder goes back to the wallet unless
/// it is dust.
pub fn build_signed<B: TxBuilder + ?Sized>(
    builder: &B,
    inputs: Vec<PlannedInput>,
    sends: &[SendRequest],
    fee: u64,
) -> Result<BuiltTx, BatcherError> {
    let input_total: u64 = inputs.iter().map(|i| i.utxo.value.to_sat()).sum();
    let send_total: u64 = sends.iter().map(|s| s.amount.to_sat()).sum();

    let needed = send_total + fee;
    if input_total < needed {
        return Err(BatcherError::InsufficientFunds {
            needed,
            available: input_total,
        });
    }

    let mut outputs: Vec<TxOut> = sends
        .iter()
        .map(|s| TxOut {
            value: s.amount,
            script_pubkey: s.to.script_pubkey(),
        })
        .collect();

    let change_value = input_total - needed;
    let has_change = change_value >= DUST_LIMIT.to_sat();
    if has_change {
        outputs.push(TxOut {
            value: Amount::from_sat(change_value),
            script_pubkey: builder.address().script_pubkey(),
        });
    }
    if outputs.is_empty() {
        return Err(BatcherError::InsufficientFunds {
            needed: needed + DUST_LIMIT.to_sat(),
            available: input_total,
        });
    }

    let output_total: u64 = outputs.iter().map(|o| o.value.to_sat()).sum();
    let tx = builder.sign(&inputs, outputs)?;
    let txid = tx.compute_txid();

    let change = has_change.then(|| Utxo {
        txid,
        vout: (tx.output.len() - 1) as u32,
        value: Amount::from_sat(change_value),
        status: TxStatus::unconfirmed(),
    });

    Ok(BuiltTx {
        tx,
        fee: Amount::from_sat(input_total - output_total),
        inputs,
        change,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_address, test_signer, utxo};
    use bitcoin::opcodes::all::OP_CHECKSIG;
    use bitcoin::script::Builder;

    #[test]
    fn wallet_input_is_signed() {
        let signer = test_signer();
        let input = PlannedInput::wallet(utxo(1, 0, 100_000));
        let sends = vec![SendRequest {
            amount: Amount::from_sat(40_000),
            to: test_address(9),
        }];

        let built = build_signed(&signer, vec![input], &sends, 1_000).unwrap();
        assert_eq!(built.tx.output.len(), 2);
        assert_eq!(built.fee, Amount::from_sat(1_000));
        assert_eq!(built.tx.input[0].sequence, RBF_SEQUENCE);
        assert_eq!(built.tx.input[0].witness.len(), 2);

        let change = built.change.clone().unwrap();
        assert_eq!(change.value, Amount::from_sat(59_000));
        assert_eq!(change.vout, 1);
        assert_eq!(
            built.tx.output[1].script_pubkey,
            signer.address().script_pubkey()
        );

        let view = built.indexed(signer.address());
        assert_eq!(view.vsize(), built.vsize());
        assert_eq!(view.fee_rate(), 1_000 / built.vsize());
    }

    #[test]
    fn dust_change_is_dropped() {
        let signer = test_signer();
        let input = PlannedInput::wallet(utxo(1, 0, 41_500));
        let sends = vec![SendRequest {
            amount: Amount::from_sat(40_000),
            to: test_address(9),
        }];

        let built = build_signed(&signer, vec![input], &sends, 1_000).unwrap();
        assert_eq!(built.tx.output.len(), 1);
        assert!(built.change.is_none());
        assert_eq!(built.fee, Amount::from_sat(1_500));
    }

    #[test]
    fn insufficient_funds() {
        let signer = test_signer();
        let input = PlannedInput::wallet(utxo(1, 0, 10_000));
        let sends = vec![SendRequest {
            amount: Amount::from_sat(40_000),
            to: test_address(9),
        }];

        assert!(matches!(
            build_signed(&signer, vec![input], &sends, 1_000),
            Err(BatcherError::InsufficientFunds {
                needed: 41_000,
                available: 10_000
            })
        ));
    }

    #[test]
    fn script_spend_placeholder_is_signed() {
        let signer = test_signer();
        let script = Builder::new()
            .push_key(&bitcoin::PublicKey::new(signer.public_key()))
            .push_opcode(OP_CHECKSIG)
            .into_script();
        let spend = SpendRequest {
            witness: vec![ADD_SIGNATURE_SEGWIT_V0.to_vec()],
            script_address: Address::p2wsh(&script, Network::Regtest),
            script: script.clone(),
            sequence: Sequence::MAX,
        };
        let input = PlannedInput::script(utxo(2, 1, 50_000), spend);

        let built = build_signed(&signer, vec![input], &[], 500).unwrap();
        let witness = &built.tx.input[0].witness;
        assert_eq!(witness.len(), 2);
        assert_eq!(witness.nth(1), Some(script.as_bytes()));
        assert_eq!(built.tx.input[0].sequence, Sequence::MAX);

        // signature commits to the p2wsh sighash
        let sig = ecdsa::Signature::from_slice(witness.nth(0).unwrap()).unwrap();
        let sighash = SighashCache::new(&built.tx)
            .p2wsh_signature_hash(0, &script, Amount::from_sat(50_000), EcdsaSighashType::All)
            .unwrap();
        SECP.verify_ecdsa(
            &Message::from_digest(sighash.to_byte_array()),
            &sig.signature,
            &signer.public_key(),
        )
        .unwrap();

        // everything but the fee is swept back to the wallet
        assert_eq!(built.tx.output.len(), 1);
        assert_eq!(built.tx.output[0].value, Amount::from_sat(49_500));
    }
}
