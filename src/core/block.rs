use crate::core::{MerkleProof, MerkleTree, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};

/// Fixed memo carried by the genesis coinbase.
pub const GENESIS_COINBASE_DATA: &str = "Blockchain Research Group";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    pre_block_hash: Vec<u8>, // empty for genesis
    hash: Vec<u8>,
    transactions: Vec<Transaction>,
    nonce: i64,
    height: usize,
    target_bits: u32,
}

impl Block {
    /// Assembles a block on top of `pre_block_hash` and mines it.
    pub fn new_block(
        pre_block_hash: Vec<u8>,
        transactions: &[Transaction],
        height: usize,
        target_bits: u32,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        let mut block = Block {
            timestamp: current_timestamp()?,
            pre_block_hash,
            hash: vec![],
            transactions: transactions.to_vec(),
            nonce: 0,
            height,
            target_bits,
        };

        info!("Starting proof-of-work for block at height {height} with {target_bits} target bits");
        let pow = ProofOfWork::new_proof_of_work(&block)?;
        let (nonce, hash) = pow.run()?;
        block.nonce = nonce;
        block.hash = hash;
        info!("Proof-of-work completed for block {}", block.get_hash_hex());

        Ok(block)
    }

    pub fn generate_genesis_block(transaction: &Transaction, target_bits: u32) -> Result<Block> {
        Block::new_block(vec![], std::slice::from_ref(transaction), 0, target_bits)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_pre_block_hash(&self) -> &[u8] {
        self.pre_block_hash.as_slice()
    }

    pub fn is_genesis(&self) -> bool {
        self.pre_block_hash.is_empty()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_hash_hex(&self) -> String {
        HEXLOWER.encode(self.hash.as_slice())
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_height(&self) -> usize {
        self.height
    }

    pub fn get_target_bits(&self) -> u32 {
        self.target_bits
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    /// Merkle root over the serialized transactions, in block order.
    pub fn hash_transactions(&self) -> Result<Vec<u8>> {
        Ok(self.merkle_tree()?.root_hash())
    }

    fn merkle_tree(&self) -> Result<MerkleTree> {
        let serialized = self
            .transactions
            .iter()
            .map(Transaction::serialize)
            .collect::<Result<Vec<_>>>()?;
        MerkleTree::new(&serialized)
    }

    /// Inclusion proof for the transaction at `transaction_index`.
    pub fn merkle_proof(&self, transaction_index: usize) -> Result<MerkleProof> {
        self.merkle_tree()?.proof(transaction_index)
    }

    pub fn verify_merkle_proof(&self, proof: &MerkleProof) -> Result<bool> {
        Ok(proof.merkle_root == self.hash_transactions()? && MerkleTree::verify_proof(proof))
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_target_bits(&self, target_bits: u32) -> Block {
        Block {
            target_bits,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_transactions(&self, transactions: Vec<Transaction>) -> Block {
        Block {
            transactions,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn reward(address: &str) -> Transaction {
        Transaction::new_coinbase_tx(address, "").unwrap()
    }

    #[test]
    fn test_empty_block_rejected() {
        assert!(matches!(
            Block::new_block(vec![], &[], 0, 4),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_genesis_block_shape() {
        let address = Wallet::new().unwrap().get_address();
        let coinbase = Transaction::new_coinbase_tx(&address, GENESIS_COINBASE_DATA).unwrap();
        let genesis = Block::generate_genesis_block(&coinbase, 8).unwrap();
        assert!(genesis.is_genesis());
        assert_eq!(genesis.get_height(), 0);
        assert_eq!(genesis.get_hash().len(), 32);
        assert!(ProofOfWork::validate(&genesis));
    }

    #[test]
    fn test_changing_a_transaction_changes_commitment() {
        let address = Wallet::new().unwrap().get_address();
        let block = Block::new_block(vec![1; 32], &[reward(&address), reward(&address)], 1, 8)
            .unwrap();
        let root = block.hash_transactions().unwrap();

        let tampered = block.with_transactions(vec![
            block.get_transactions()[0].clone(),
            reward(&address),
        ]);
        assert_ne!(tampered.hash_transactions().unwrap(), root);
        assert!(!ProofOfWork::validate(&tampered));
    }

    #[test]
    fn test_reordering_transactions_changes_commitment() {
        let address = Wallet::new().unwrap().get_address();
        let block = Block::new_block(vec![1; 32], &[reward(&address), reward(&address)], 1, 8)
            .unwrap();
        let mut reversed = block.get_transactions().to_vec();
        reversed.reverse();
        assert_ne!(
            block.with_transactions(reversed).hash_transactions().unwrap(),
            block.hash_transactions().unwrap()
        );
    }

    #[test]
    fn test_serialization_round_trip() {
        let address = Wallet::new().unwrap().get_address();
        let block = Block::new_block(vec![9; 32], &[reward(&address)], 3, 4).unwrap();
        let decoded = Block::deserialize(&block.serialize().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert!(ProofOfWork::validate(&decoded));
    }

    #[test]
    fn test_merkle_proof_for_block_transaction() {
        let address = Wallet::new().unwrap().get_address();
        let txs: Vec<Transaction> = (0..3).map(|_| reward(&address)).collect();
        let block = Block::new_block(vec![2; 32], &txs, 1, 4).unwrap();
        let proof = block.merkle_proof(2).unwrap();
        assert!(block.verify_merkle_proof(&proof).unwrap());
        assert!(block.merkle_proof(3).is_err());
    }
}
