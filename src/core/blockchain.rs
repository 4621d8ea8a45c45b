// The ledger: an append-only block store in sled with a single tip pointer.
// Forks are resolved by height alone; a block replaces the tip only when it
// sits strictly higher than the current one.

use crate::core::block::GENESIS_COINBASE_DATA;
use crate::core::{Block, ProofOfWork, Transaction, UnspentOutput};
use crate::error::{BlockchainError, Result};
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use sled::transaction::{abort, ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

const TIP_BLOCK_HASH_KEY: &str = "l";
const BLOCKS_TREE: &str = "blocks";
const ORPHANS_TREE: &str = "orphans";

#[derive(Clone)]
pub struct Blockchain {
    // None until a genesis block is created or received from a peer.
    tip_hash: Arc<RwLock<Option<Vec<u8>>>>,
    db: Db,
    target_bits: u32,
}

impl Blockchain {
    /// Opens the store at `path`. The ledger may be uninitialized; it becomes
    /// active through `create_genesis` or by receiving blocks via `add_block`.
    pub fn open(path: &Path, target_bits: u32) -> Result<Blockchain> {
        let db = sled::open(path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks_tree = db.open_tree(BLOCKS_TREE)?;
        let tip_hash = blocks_tree.get(TIP_BLOCK_HASH_KEY)?.map(|tip| tip.to_vec());

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash)),
            db,
            target_bits,
        })
    }

    /// Opens the store and mines a genesis block paying `genesis_address`.
    pub fn create(path: &Path, genesis_address: &str, target_bits: u32) -> Result<Blockchain> {
        let blockchain = Blockchain::open(path, target_bits)?;
        blockchain.create_genesis(genesis_address)?;
        Ok(blockchain)
    }

    pub fn create_genesis(&self, genesis_address: &str) -> Result<Block> {
        if self.is_initialized() {
            return Err(BlockchainError::ChainAlreadyExists);
        }
        info!("Creating genesis block for address: {genesis_address}");
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_address, GENESIS_COINBASE_DATA)?;
        let genesis = Block::generate_genesis_block(&coinbase_tx, self.target_bits)?;
        if !self.store_block(&genesis)? {
            // Another block became the tip while the genesis was being mined.
            return Err(BlockchainError::ChainAlreadyExists);
        }
        Ok(genesis)
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_target_bits(&self) -> u32 {
        self.target_bits
    }

    pub fn get_tip_hash(&self) -> Option<Vec<u8>> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.get_tip_hash().is_some()
    }

    fn require_tip(&self) -> Result<Vec<u8>> {
        self.get_tip_hash().ok_or(BlockchainError::ChainNotInitialized)
    }

    fn blocks_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree(BLOCKS_TREE)?)
    }

    /// Writes the block and, when it is higher than the stored tip (or there
    /// is no tip), moves the tip to it. Both happen in one sled transaction.
    /// Returns whether the tip moved.
    fn store_block(&self, block: &Block) -> Result<bool> {
        let blocks_tree = self.blocks_tree()?;
        let block_data = block.serialize()?;

        // Held across the transaction so the cached tip follows commit order.
        let mut tip_hash = self.tip_hash.write().unwrap_or_else(PoisonError::into_inner);

        let adopted = blocks_tree.transaction(
            |tx_db| -> ConflictableTransactionResult<Option<bool>, BlockchainError> {
                if tx_db.get(block.get_hash())?.is_some() {
                    return Ok(None);
                }

                let adopt = match tx_db.get(TIP_BLOCK_HASH_KEY)? {
                    None => true,
                    Some(current_tip) => {
                        let Some(tip_bytes) = tx_db.get(&current_tip)? else {
                            return abort(BlockchainError::Database(format!(
                                "Tip block {} missing from store",
                                HEXLOWER.encode(&current_tip)
                            )));
                        };
                        let tip_block = Block::deserialize(tip_bytes.as_ref())
                            .map_err(ConflictableTransactionError::Abort)?;
                        block.get_height() > tip_block.get_height()
                    }
                };

                tx_db.insert(block.get_hash(), block_data.as_slice())?;
                if adopt {
                    tx_db.insert(TIP_BLOCK_HASH_KEY, block.get_hash())?;
                }
                Ok(Some(adopt))
            },
        )?;

        match adopted {
            None => {
                debug!("Block {} already stored", block.get_hash_hex());
                Ok(false)
            }
            Some(adopt) => {
                if adopt {
                    *tip_hash = Some(block.get_hash().to_vec());
                }
                Ok(adopt)
            }
        }
    }

    /// Mines `transactions` into a block on top of the current tip.
    ///
    /// Every non-coinbase transaction must pass `verify_transaction`, and no
    /// two transactions may spend the same output.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        for transaction in transactions {
            if !self.verify_transaction(transaction)? {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "Transaction {} failed verification",
                    transaction.get_id_hex()
                )));
            }
        }
        Self::check_for_double_spending(transactions)?;

        let tip_hash = self.require_tip()?;
        let next_height = self.get_best_height()? + 1;
        info!(
            "Mining block at height {} with {} transactions",
            next_height,
            transactions.len()
        );

        let block = Block::new_block(tip_hash, transactions, next_height, self.target_bits)?;
        if self.store_block(&block)? {
            info!("Successfully mined block: {}", block.get_hash_hex());
        } else {
            warn!(
                "Mined block {} at height {} but a higher block already holds the tip",
                block.get_hash_hex(),
                next_height
            );
        }
        Ok(block)
    }

    /// Stores a block received from a peer. Re-adding a known block is a
    /// no-op. Returns whether the tip moved.
    ///
    /// A block whose parent is not stored yet waits in the orphan tree and
    /// joins the chain once the parent arrives, so during tip-first sync the
    /// tip moves only when the downloaded branch reaches a known block.
    /// Transactions are not re-verified here; only the proof-of-work, the
    /// difficulty and the height against the parent are checked.
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        if self.has_block(block.get_hash())? || self.is_orphan(block)? {
            return Ok(false);
        }
        if block.get_target_bits() < self.target_bits {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {} has {} target bits, node requires {}",
                block.get_hash_hex(),
                block.get_target_bits(),
                self.target_bits
            )));
        }
        if !ProofOfWork::validate(block) {
            return Err(BlockchainError::InvalidBlock(format!(
                "Proof-of-work check failed for block {}",
                block.get_hash_hex()
            )));
        }
        if block.is_genesis() && block.get_height() != 0 {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {} has no parent but claims height {}",
                block.get_hash_hex(),
                block.get_height()
            )));
        }

        if !block.is_genesis() {
            match self.find_block(block.get_pre_block_hash())? {
                Some(parent) => Self::check_height(&parent, block)?,
                None => {
                    self.orphans_tree()?
                        .insert(Self::orphan_key(block), block.serialize()?)?;
                    debug!(
                        "Block {} waits for its parent {}",
                        block.get_hash_hex(),
                        HEXLOWER.encode(block.get_pre_block_hash())
                    );
                    return Ok(false);
                }
            }
        }

        let mut adopted = self.store_block(block)?;
        if adopted {
            info!(
                "Adopted block {} at height {} as new tip",
                block.get_hash_hex(),
                block.get_height()
            );
        }
        if self.connect_orphans(block)? {
            adopted = true;
        }
        Ok(adopted)
    }

    fn check_height(parent: &Block, block: &Block) -> Result<()> {
        if block.get_height() != parent.get_height() + 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {} claims height {} on a parent at height {}",
                block.get_hash_hex(),
                block.get_height(),
                parent.get_height()
            )));
        }
        Ok(())
    }

    fn orphans_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree(ORPHANS_TREE)?)
    }

    // Keyed by parent hash first so children of a block share a prefix.
    fn orphan_key(block: &Block) -> Vec<u8> {
        let mut key = block.get_pre_block_hash().to_vec();
        key.extend_from_slice(block.get_hash());
        key
    }

    fn is_orphan(&self, block: &Block) -> Result<bool> {
        Ok(self.orphans_tree()?.contains_key(Self::orphan_key(block))?)
    }

    /// Moves every orphan descending from `parent` into the chain, dropping
    /// those with a wrong height. Returns whether the tip moved.
    fn connect_orphans(&self, parent: &Block) -> Result<bool> {
        let orphans = self.orphans_tree()?;
        let mut adopted = false;
        let mut parents = vec![parent.clone()];

        while let Some(parent) = parents.pop() {
            let children = orphans
                .scan_prefix(parent.get_hash())
                .collect::<std::result::Result<Vec<_>, sled::Error>>()?;
            for (key, bytes) in children {
                orphans.remove(&key)?;
                let child = Block::deserialize(bytes.as_ref())?;
                if child.get_pre_block_hash() != parent.get_hash() {
                    continue;
                }
                if let Err(e) = Self::check_height(&parent, &child) {
                    warn!("Dropping orphan block {}: {e}", child.get_hash_hex());
                    continue;
                }
                if self.store_block(&child)? {
                    info!(
                        "Adopted block {} at height {} as new tip",
                        child.get_hash_hex(),
                        child.get_height()
                    );
                    adopted = true;
                }
                parents.push(child);
            }
        }
        Ok(adopted)
    }

    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator::new(self.get_tip_hash(), self.db.clone())
    }

    /// Every unspent output on the chain, keyed by hex transaction id.
    pub fn find_utxo(&self) -> Result<HashMap<String, Vec<UnspentOutput>>> {
        let mut utxo: HashMap<String, Vec<UnspentOutput>> = HashMap::new();
        let mut spent_txos: HashMap<String, HashSet<usize>> = HashMap::new();

        for block in self.iterator() {
            let block = block?;
            // Inputs first, so outputs spent within the same block are excluded.
            for tx in block.get_transactions().iter().filter(|tx| !tx.is_coinbase()) {
                for txin in tx.get_vin() {
                    if let Some(index) = txin.output_index() {
                        spent_txos
                            .entry(HEXLOWER.encode(txin.get_txid()))
                            .or_default()
                            .insert(index);
                    }
                }
            }

            for tx in block.get_transactions() {
                let txid_hex = tx.get_id_hex();
                let spent = spent_txos.get(&txid_hex);
                let unspent: Vec<UnspentOutput> = tx
                    .get_vout()
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| !spent.is_some_and(|outs| outs.contains(idx)))
                    .map(|(idx, out)| UnspentOutput::new(idx, out.clone()))
                    .collect();
                if !unspent.is_empty() {
                    utxo.entry(txid_hex).or_default().extend(unspent);
                }
            }
        }
        Ok(utxo)
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Transaction> {
        for block in self.iterator() {
            let block = block?;
            if let Some(transaction) = block
                .get_transactions()
                .iter()
                .find(|transaction| transaction.get_id() == txid)
            {
                return Ok(transaction.clone());
            }
        }
        Err(BlockchainError::TransactionNotFound(HEXLOWER.encode(txid)))
    }

    /// Collects every transaction referenced by `transaction`'s inputs in a
    /// single pass over the chain.
    fn find_previous_transactions(
        &self,
        transaction: &Transaction,
    ) -> Result<HashMap<String, Transaction>> {
        let mut wanted: HashSet<Vec<u8>> = transaction
            .get_vin()
            .iter()
            .map(|vin| vin.get_txid().to_vec())
            .collect();
        let mut prev_txs = HashMap::new();

        for block in self.iterator() {
            if wanted.is_empty() {
                break;
            }
            for tx in block?.get_transactions() {
                if wanted.remove(tx.get_id()) {
                    prev_txs.insert(tx.get_id_hex(), tx.clone());
                }
            }
        }

        match wanted.into_iter().next() {
            Some(missing) => Err(BlockchainError::PreviousTransactionNotFound(
                HEXLOWER.encode(&missing),
            )),
            None => Ok(prev_txs),
        }
    }

    pub fn sign_transaction(&self, transaction: &mut Transaction, pkcs8: &[u8]) -> Result<()> {
        if transaction.is_coinbase() {
            return Ok(());
        }
        let prev_txs = self.find_previous_transactions(transaction)?;
        transaction.sign(pkcs8, &prev_txs)
    }

    /// Checks signatures and that every input spends a distinct, existing
    /// output no block on the current chain has spent yet.
    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<bool> {
        if transaction.is_coinbase() {
            return Ok(true);
        }

        let mut seen = HashSet::new();
        for input in transaction.get_vin() {
            if !seen.insert((input.get_txid(), input.get_vout())) {
                debug!(
                    "Transaction {} spends {}:{} twice",
                    transaction.get_id_hex(),
                    HEXLOWER.encode(input.get_txid()),
                    input.get_vout()
                );
                return Ok(false);
            }
        }

        let prev_txs = self.find_previous_transactions(transaction)?;
        for input in transaction.get_vin() {
            if self.is_output_spent(input.get_txid(), input.get_vout())? {
                debug!(
                    "Transaction {} spends {}:{} which is already spent",
                    transaction.get_id_hex(),
                    HEXLOWER.encode(input.get_txid()),
                    input.get_vout()
                );
                return Ok(false);
            }
        }

        transaction.verify(&prev_txs)
    }

    /// Whether any transaction on the current chain already spends `txid:vout`.
    pub fn is_output_spent(&self, txid: &[u8], vout: i64) -> Result<bool> {
        for block in self.iterator() {
            for transaction in block?.get_transactions() {
                if transaction.is_coinbase() {
                    continue;
                }
                if transaction
                    .get_vin()
                    .iter()
                    .any(|input| input.get_txid() == txid && input.get_vout() == vout)
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // Two transactions in one block must not spend the same output.
    fn check_for_double_spending(transactions: &[Transaction]) -> Result<()> {
        let mut spent_outputs: HashSet<(&[u8], i64)> = HashSet::new();

        for transaction in transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in transaction.get_vin() {
                if !spent_outputs.insert((input.get_txid(), input.get_vout())) {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "Double-spending detected in transaction {}: output {}:{} already spent in this block",
                        transaction.get_id_hex(),
                        HEXLOWER.encode(input.get_txid()),
                        input.get_vout()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get_best_height(&self) -> Result<usize> {
        let tip_hash = self.require_tip()?;
        Ok(self.get_block(&tip_hash)?.get_height())
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Block> {
        let block_bytes = self
            .blocks_tree()?
            .get(block_hash)?
            .ok_or_else(|| BlockchainError::BlockNotFound(HEXLOWER.encode(block_hash)))?;
        Block::deserialize(block_bytes.as_ref())
    }

    fn find_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        self.blocks_tree()?
            .get(block_hash)?
            .map(|bytes| Block::deserialize(bytes.as_ref()))
            .transpose()
    }

    pub fn has_block(&self, block_hash: &[u8]) -> Result<bool> {
        Ok(self.blocks_tree()?.contains_key(block_hash)?)
    }

    /// Hashes of the current chain, tip first.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        self.iterator()
            .map(|block| block.map(|block| block.get_hash().to_vec()))
            .collect()
    }
}

/// Walks from a tip back through parent links to the genesis block.
pub struct BlockchainIterator {
    db: Db,
    current_hash: Option<Vec<u8>>,
}

impl BlockchainIterator {
    fn new(tip_hash: Option<Vec<u8>>, db: Db) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: tip_hash,
            db,
        }
    }

    fn load(&self, block_hash: &[u8]) -> Result<Block> {
        let block_bytes = self
            .db
            .open_tree(BLOCKS_TREE)?
            .get(block_hash)?
            .ok_or_else(|| BlockchainError::BlockNotFound(HEXLOWER.encode(block_hash)))?;
        Block::deserialize(block_bytes.as_ref())
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let current_hash = self.current_hash.take()?;
        let block = match self.load(&current_hash) {
            Ok(block) => block,
            Err(e) => return Some(Err(e)),
        };
        if !block.is_genesis() {
            self.current_hash = Some(block.get_pre_block_hash().to_vec());
        }
        Some(Ok(block))
    }
}
