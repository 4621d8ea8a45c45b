// Transactions follow the UTXO model: each one consumes earlier outputs and
// creates new ones locked to a public key hash.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_digest,
};
use crate::wallet::{address_to_pub_key_hash, hash_pub_key, Wallet};
use data_encoding::HEXLOWER;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Reward credited by every coinbase transaction.
pub const SUBSIDY: u64 = 10;

/// Output index carried by the single input of a coinbase transaction.
pub const COINBASE_VOUT: i64 = -1;

/// Reference to one output of an earlier transaction, plus the proof that
/// the spender owns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXInput {
    txid: Vec<u8>,
    vout: i64,
    signature: Vec<u8>,
    // Raw X || Y public key; reward memo bytes on a coinbase input.
    pub_key: Vec<u8>,
}

impl TXInput {
    /// An unsigned input spending output `vout` of transaction `txid`.
    pub fn new(txid: &[u8], vout: usize, pub_key: &[u8]) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout: vout as i64,
            signature: vec![],
            pub_key: pub_key.to_vec(),
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    /// The referenced output index, or `None` for the coinbase marker.
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(self.pub_key.as_slice()).eq(pub_key_hash)
    }

    #[cfg(test)]
    pub(crate) fn signature_mut(&mut self) -> &mut Vec<u8> {
        &mut self.signature
    }

    #[cfg(test)]
    pub(crate) fn pub_key_mut(&mut self) -> &mut Vec<u8> {
        &mut self.pub_key
    }
}

/// An amount locked to the hash of a public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Locks `value` to the key hash encoded in `address`.
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        let pub_key_hash = address_to_pub_key_hash(address)?;
        Ok(TXOutput::new_locked(value, &pub_key_hash))
    }

    pub fn new_locked(value: u64, pub_key_hash: &[u8]) -> TXOutput {
        TXOutput {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }

    #[cfg(test)]
    pub(crate) fn set_value(&mut self, value: u64) {
        self.value = value;
    }

    #[cfg(test)]
    pub(crate) fn pub_key_hash_mut(&mut self) -> &mut Vec<u8> {
        &mut self.pub_key_hash
    }
}

/// An output that no input on the chain references yet, together with its
/// position in the transaction that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UnspentOutput {
    index: usize,
    output: TXOutput,
}

impl UnspentOutput {
    pub fn new(index: usize, output: TXOutput) -> UnspentOutput {
        UnspentOutput { index, output }
    }

    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn get_output(&self) -> &TXOutput {
        &self.output
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Assembles an unsigned transaction and computes its id.
    pub fn new(vin: Vec<TXInput>, vout: Vec<TXOutput>) -> Result<Transaction> {
        let mut tx = Transaction {
            id: vec![],
            vin,
            vout,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Creates the reward transaction for a miner. An empty `data` gets a
    /// default memo naming the recipient, made unique per call.
    pub fn new_coinbase_tx(to: &str, data: &str) -> Result<Transaction> {
        let memo = if data.is_empty() {
            format!("Reward to '{to}' {}", Uuid::new_v4())
        } else {
            data.to_string()
        };

        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_VOUT,
            signature: vec![],
            pub_key: memo.into_bytes(),
        };
        let txout = TXOutput::new(SUBSIDY, to)?;

        Transaction::new(vec![tx_input], vec![txout])
    }

    /// Builds and signs a payment of `amount` from `wallet` to `to`, with a
    /// change output back to the sender when the selected outputs overshoot.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::InvalidTransaction(
                "Amount must be positive".to_string(),
            ));
        }
        let to_pub_key_hash = address_to_pub_key_hash(to)?;
        let from_pub_key_hash = wallet.get_pub_key_hash();

        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(from_pub_key_hash.as_slice(), amount)?;

        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut inputs = vec![];
        for (txid_hex, outs) in valid_outputs {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                inputs.push(TXInput::new(&txid, out, wallet.get_public_key()));
            }
        }

        let mut outputs = vec![TXOutput::new_locked(amount, &to_pub_key_hash)];
        if accumulated > amount {
            outputs.push(TXOutput::new_locked(
                accumulated - amount,
                &from_pub_key_hash,
            ));
        }

        let mut tx = Transaction::new(inputs, outputs)?;
        utxo_set
            .get_blockchain()
            .sign_transaction(&mut tx, wallet.get_pkcs8())?;
        Ok(tx)
    }

    /// Copy with every input's signature and public key cleared.
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .vin
            .iter()
            .map(|input| TXInput {
                txid: input.txid.clone(),
                vout: input.vout,
                signature: vec![],
                pub_key: vec![],
            })
            .collect();
        Transaction {
            id: self.id.clone(),
            vin: inputs,
            vout: self.vout.clone(),
        }
    }

    /// The message signed for input `input_index`: the hash of the trimmed
    /// copy with only that input's key slot holding the referenced output's
    /// locking hash.
    fn signing_payload(
        trimmed: &Transaction,
        input_index: usize,
        locking_hash: &[u8],
    ) -> Result<Vec<u8>> {
        let mut payload = trimmed.clone();
        payload.vin[input_index].pub_key = locking_hash.to_vec();
        payload.hash()
    }

    /// Finds the output spent by `input` among `prev_txs`.
    fn referenced_output<'a>(
        input: &TXInput,
        prev_txs: &'a HashMap<String, Transaction>,
    ) -> Result<Option<&'a TXOutput>> {
        let txid_hex = HEXLOWER.encode(input.get_txid());
        let prev_tx = prev_txs
            .get(&txid_hex)
            .ok_or(BlockchainError::PreviousTransactionNotFound(txid_hex))?;
        Ok(input
            .output_index()
            .and_then(|index| prev_tx.vout.get(index)))
    }

    /// Signs every input with `pkcs8`. `prev_txs` maps hex txid to each
    /// transaction referenced by an input.
    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let trimmed = self.trimmed_copy();
        let mut signatures = Vec::with_capacity(self.vin.len());
        for (idx, vin) in self.vin.iter().enumerate() {
            let prev_out = Self::referenced_output(vin, prev_txs)?.ok_or_else(|| {
                BlockchainError::InvalidTransaction(format!(
                    "Input {idx} references missing output {}",
                    vin.vout
                ))
            })?;
            if !prev_out.is_locked_with_key(&hash_pub_key(vin.get_pub_key())) {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "Input {idx} spends an output locked to another key"
                )));
            }
            let payload = Self::signing_payload(&trimmed, idx, prev_out.get_pub_key_hash())?;
            signatures.push(ecdsa_p256_sha256_sign_digest(pkcs8, &payload)?);
        }

        for (vin, signature) in self.vin.iter_mut().zip(signatures) {
            vin.signature = signature;
        }
        Ok(())
    }

    /// Checks every input's signature against the payload it must have been
    /// signed over. Coinbase transactions verify trivially.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let trimmed = self.trimmed_copy();
        for (idx, vin) in self.vin.iter().enumerate() {
            let prev_out = match Self::referenced_output(vin, prev_txs)? {
                Some(out) => out,
                None => {
                    debug!("Input {idx} references output {} that does not exist", vin.vout);
                    return Ok(false);
                }
            };
            if !prev_out.is_locked_with_key(&hash_pub_key(vin.get_pub_key())) {
                debug!("Input {idx} key does not unlock output {}", vin.vout);
                return Ok(false);
            }
            let payload = Self::signing_payload(&trimmed, idx, prev_out.get_pub_key_hash())?;
            if !ecdsa_p256_sha256_sign_verify(
                vin.pub_key.as_slice(),
                vin.signature.as_slice(),
                &payload,
            ) {
                debug!("Signature check failed for input {idx}");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    /// SHA-256 of the transaction with its id cleared.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_id_hex(&self) -> String {
        HEXLOWER.encode(self.id.as_slice())
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }

    #[cfg(test)]
    pub(crate) fn vin_mut(&mut self) -> &mut Vec<TXInput> {
        &mut self.vin
    }

    #[cfg(test)]
    pub(crate) fn vout_mut(&mut self) -> &mut Vec<TXOutput> {
        &mut self.vout
    }
}
