use crate::core::{Block, Blockchain, TXOutput, UnspentOutput};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::{debug, info};
use sled::transaction::{abort, ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Batch, Tree};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

const UTXO_TREE: &str = "chainstate";

/// Cache of the chain's unspent outputs in the `chainstate` tree, keyed by
/// raw transaction id. Each entry keeps the original output indexes, so
/// spending one output never renumbers its siblings.
///
/// The index is derived state: `reindex` rebuilds it from
/// [`Blockchain::find_utxo`], `update` folds in one new block.
pub struct UTXOSet {
    blockchain: Blockchain,
    // Serializes reindex and update against each other.
    write_lock: Mutex<()>,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet {
            blockchain,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    fn utxo_tree(&self) -> Result<Tree> {
        Ok(self.blockchain.get_db().open_tree(UTXO_TREE)?)
    }

    fn decode_entry(bytes: &[u8]) -> Result<Vec<UnspentOutput>> {
        deserialize(bytes).map_err(|e| {
            BlockchainError::Serialization(format!("Failed to deserialize unspent outputs: {e}"))
        })
    }

    /// First-fit selection of outputs locked to `pub_key_hash` until `amount`
    /// is covered. Returns the accumulated value and, per hex txid, the
    /// output indexes to spend. The total may fall short of `amount`.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<usize>>)> {
        let mut unspent_outputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accumulated = 0;

        'entries: for item in self.utxo_tree()?.iter() {
            let (k, v) = item?;
            let txid_hex = HEXLOWER.encode(k.as_ref());
            for unspent in Self::decode_entry(v.as_ref())? {
                if accumulated >= amount {
                    break 'entries;
                }
                if unspent.get_output().is_locked_with_key(pub_key_hash) {
                    accumulated += unspent.get_output().get_value();
                    unspent_outputs
                        .entry(txid_hex.clone())
                        .or_default()
                        .push(unspent.get_index());
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for item in self.utxo_tree()?.iter() {
            let (_, v) = item?;
            utxos.extend(
                Self::decode_entry(v.as_ref())?
                    .into_iter()
                    .map(|unspent| unspent.get_output().clone())
                    .filter(|out| out.is_locked_with_key(pub_key_hash)),
            );
        }
        Ok(utxos)
    }

    pub fn get_balance(&self, pub_key_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_utxo(pub_key_hash)?
            .iter()
            .map(TXOutput::get_value)
            .sum())
    }

    /// Number of transactions that still have unspent outputs.
    pub fn count_transactions(&self) -> Result<usize> {
        let mut counter = 0;
        for item in self.utxo_tree()?.iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// The stored entries, keyed by hex txid.
    pub fn get_entries(&self) -> Result<HashMap<String, Vec<UnspentOutput>>> {
        let mut entries = HashMap::new();
        for item in self.utxo_tree()?.iter() {
            let (k, v) = item?;
            entries.insert(HEXLOWER.encode(k.as_ref()), Self::decode_entry(v.as_ref())?);
        }
        Ok(entries)
    }

    /// Replaces the whole index with a fresh scan of the chain in one
    /// atomic batch.
    pub fn reindex(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let utxo_tree = self.utxo_tree()?;
        let utxo_map = self.blockchain.find_utxo()?;

        let mut batch = Batch::default();
        for key in utxo_tree.iter().keys() {
            batch.remove(key?);
        }
        for (txid_hex, outs) in &utxo_map {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Failed to decode transaction ID: {e}"))
            })?;
            batch.insert(txid, serialize(outs)?);
        }
        utxo_tree.apply_batch(batch)?;

        info!("Reindexed UTXO set: {} transactions", utxo_map.len());
        Ok(())
    }

    /// Folds `block` into the index: removes the outputs its inputs spend and
    /// adds its own outputs. Runs as one sled transaction.
    pub fn update(&self, block: &Block) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let utxo_tree = self.utxo_tree()?;

        let mut new_entries = Vec::with_capacity(block.get_transactions().len());
        for tx in block.get_transactions() {
            let outs: Vec<UnspentOutput> = tx
                .get_vout()
                .iter()
                .enumerate()
                .map(|(idx, out)| UnspentOutput::new(idx, out.clone()))
                .collect();
            new_entries.push((tx.get_id().to_vec(), serialize(&outs)?));
        }

        utxo_tree.transaction(|tx_db| -> ConflictableTransactionResult<(), BlockchainError> {
            for tx in block.get_transactions().iter().filter(|tx| !tx.is_coinbase()) {
                for vin in tx.get_vin() {
                    let Some(index) = vin.output_index() else {
                        continue;
                    };
                    let Some(outs_bytes) = tx_db.get(vin.get_txid())? else {
                        return abort(BlockchainError::Database(format!(
                            "Output {}:{} missing from UTXO index",
                            HEXLOWER.encode(vin.get_txid()),
                            index
                        )));
                    };
                    let mut outs = Self::decode_entry(outs_bytes.as_ref())
                        .map_err(ConflictableTransactionError::Abort)?;
                    outs.retain(|unspent| unspent.get_index() != index);

                    if outs.is_empty() {
                        tx_db.remove(vin.get_txid())?;
                    } else {
                        let outs_bytes =
                            serialize(&outs).map_err(ConflictableTransactionError::Abort)?;
                        tx_db.insert(vin.get_txid(), outs_bytes)?;
                    }
                }
            }

            for (txid, outs_bytes) in &new_entries {
                tx_db.insert(txid.as_slice(), outs_bytes.as_slice())?;
            }
            Ok(())
        })?;

        debug!("Applied block {} to UTXO set", block.get_hash_hex());
        Ok(())
    }
}
