use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, error, info};
use num_bigint::{BigInt, Sign};
use std::ops::ShlAssign;

/// Default difficulty: leading zero bits required in a block hash.
pub const TARGET_BITS: u32 = 24;

/// Largest difficulty a block may claim; the target must stay above zero.
pub const MAX_TARGET_BITS: u32 = 255;

const MAX_NONCE: i64 = i64::MAX;

/// Nonce search over `SHA256(prev_hash || merkle_root || timestamp || target_bits || nonce)`.
pub struct ProofOfWork {
    header_prefix: Vec<u8>,
    target: BigInt,
}

impl ProofOfWork {
    pub fn new_proof_of_work(block: &Block) -> Result<ProofOfWork> {
        let target_bits = block.get_target_bits();
        if target_bits > MAX_TARGET_BITS {
            return Err(BlockchainError::InvalidBlock(format!(
                "Target bits {target_bits} out of range"
            )));
        }
        let mut target = BigInt::from(1);
        target.shl_assign(256 - target_bits);

        let merkle_root = block.hash_transactions()?;
        let mut header_prefix = vec![];
        header_prefix.extend(block.get_pre_block_hash());
        header_prefix.extend(merkle_root);
        header_prefix.extend(block.get_timestamp().to_be_bytes());
        header_prefix.extend(target_bits.to_be_bytes());

        Ok(ProofOfWork {
            header_prefix,
            target,
        })
    }

    /// Recomputes the hash with the block's stored nonce and checks it
    /// against both the target and the stored hash.
    pub fn validate(block: &Block) -> bool {
        let pow = match ProofOfWork::new_proof_of_work(block) {
            Ok(pow) => pow,
            Err(e) => {
                error!("Cannot validate block {}: {e}", HEXLOWER.encode(block.get_hash()));
                return false;
            }
        };
        let hash = sha256_digest(pow.prepare_data(block.get_nonce()).as_slice());
        pow.meets_target(&hash) && hash.as_slice() == block.get_hash()
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        BigInt::from_bytes_be(Sign::Plus, hash) < self.target
    }

    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data_bytes = Vec::with_capacity(self.header_prefix.len() + 8);
        data_bytes.extend_from_slice(&self.header_prefix);
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    /// Searches nonces from zero upwards; returns the first `(nonce, hash)`
    /// whose hash is below the target.
    pub fn run(&self) -> Result<(i64, Vec<u8>)> {
        debug!("Mining the block");
        let mut nonce = 0;
        while nonce < MAX_NONCE {
            let hash = sha256_digest(self.prepare_data(nonce).as_slice());
            if self.meets_target(&hash) {
                info!("Found nonce {nonce}: {}", HEXLOWER.encode(hash.as_slice()));
                return Ok((nonce, hash));
            }
            nonce += 1;
        }
        Err(BlockchainError::InvalidBlock(
            "Nonce space exhausted without meeting the target".to_string(),
        ))
    }
}
