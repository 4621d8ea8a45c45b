use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use serde::{Deserialize, Serialize};

/// Binary hash tree over serialized transactions.
///
/// Leaves are `SHA256(item)`, inner nodes are `SHA256(left || right)`. A level
/// with an odd number of nodes pairs its last node with itself, a lone leaf
/// included, so the root is never a bare leaf hash. All levels are kept so
/// inclusion proofs can be produced without rehashing.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Vec<u8>>>,
}

/// Merkle proof for transaction inclusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Leaf hash being proven
    pub leaf_hash: Vec<u8>,
    /// Merkle root hash
    pub merkle_root: Vec<u8>,
    /// Sibling hashes from the leaf level upwards
    pub proof_path: Vec<ProofElement>,
    /// Index of the transaction in the block
    pub leaf_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofElement {
    pub hash: Vec<u8>,
    /// true if the sibling sits to the right of the running hash
    pub is_right: bool,
}

impl MerkleTree {
    /// Builds the tree from the raw item bytes, in order.
    pub fn new(items: &[Vec<u8>]) -> Result<Self> {
        if items.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Cannot create Merkle tree from empty transaction list".to_string(),
            ));
        }

        let leaves: Vec<Vec<u8>> = items.iter().map(|item| sha256_digest(item)).collect();
        let mut levels = vec![leaves];

        while levels.len() == 1 || levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next: Vec<Vec<u8>> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => Self::hash_pair(left, right),
                    [single] => Self::hash_pair(single, single),
                    _ => unreachable!("chunks(2) yields one or two elements"),
                })
                .collect();
            levels.push(next);
        }

        Ok(MerkleTree { levels })
    }

    pub fn root_hash(&self) -> Vec<u8> {
        self.levels[self.levels.len() - 1][0].clone()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Produces the sibling path proving that leaf `leaf_index` is under the root.
    pub fn proof(&self, leaf_index: usize) -> Result<MerkleProof> {
        if leaf_index >= self.leaf_count() {
            return Err(BlockchainError::InvalidBlock(format!(
                "Transaction index {} out of bounds (leaves: {})",
                leaf_index,
                self.leaf_count()
            )));
        }

        let mut proof_path = Vec::new();
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            // Last node of an odd level is its own sibling.
            let sibling = level.get(sibling_index).unwrap_or(&level[index]);
            proof_path.push(ProofElement {
                hash: sibling.clone(),
                is_right: index % 2 == 0,
            });
            index /= 2;
        }

        Ok(MerkleProof {
            leaf_hash: self.levels[0][leaf_index].clone(),
            merkle_root: self.root_hash(),
            proof_path,
            leaf_index,
        })
    }

    pub fn verify_proof(proof: &MerkleProof) -> bool {
        let mut current_hash = proof.leaf_hash.clone();

        for element in &proof.proof_path {
            current_hash = if element.is_right {
                Self::hash_pair(&current_hash, &element.hash)
            } else {
                Self::hash_pair(&element.hash, &current_hash)
            };
        }

        current_hash == proof.merkle_root
    }

    fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
        let mut combined = Vec::with_capacity(left.len() + right.len());
        combined.extend_from_slice(left);
        combined.extend_from_slice(right);
        sha256_digest(&combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i, i.wrapping_mul(3), 42]).collect()
    }

    #[test]
    fn test_single_item_is_paired_with_itself() {
        let data = items(1);
        let tree = MerkleTree::new(&data).unwrap();
        let leaf = sha256_digest(&data[0]);
        assert_eq!(tree.root_hash(), MerkleTree::hash_pair(&leaf, &leaf));
        assert_ne!(tree.root_hash(), leaf);

        let proof = tree.proof(0).unwrap();
        assert_eq!(proof.proof_path.len(), 1);
        assert!(MerkleTree::verify_proof(&proof));
    }

    #[test]
    fn test_two_items_root() {
        let data = items(2);
        let tree = MerkleTree::new(&data).unwrap();
        let expected = MerkleTree::hash_pair(&sha256_digest(&data[0]), &sha256_digest(&data[1]));
        assert_eq!(tree.root_hash(), expected);
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let data = items(3);
        let tree = MerkleTree::new(&data).unwrap();
        let leaves: Vec<Vec<u8>> = data.iter().map(|d| sha256_digest(d)).collect();
        let left = MerkleTree::hash_pair(&leaves[0], &leaves[1]);
        let right = MerkleTree::hash_pair(&leaves[2], &leaves[2]);
        assert_eq!(tree.root_hash(), MerkleTree::hash_pair(&left, &right));
    }

    #[test]
    fn test_root_is_order_sensitive() {
        let data = items(4);
        let mut swapped = data.clone();
        swapped.swap(0, 3);
        assert_ne!(
            MerkleTree::new(&data).unwrap().root_hash(),
            MerkleTree::new(&swapped).unwrap().root_hash()
        );
    }

    #[test]
    fn test_empty_transaction_list() {
        assert!(MerkleTree::new(&[]).is_err());
    }

    #[test]
    fn test_proofs_verify_for_every_leaf() {
        for n in 1..=7 {
            let tree = MerkleTree::new(&items(n)).unwrap();
            for i in 0..n as usize {
                let proof = tree.proof(i).unwrap();
                assert!(MerkleTree::verify_proof(&proof), "leaf {i} of {n}");
            }
        }
    }

    #[test]
    fn test_tampered_proof_fails() {
        let tree = MerkleTree::new(&items(5)).unwrap();
        let mut proof = tree.proof(2).unwrap();
        proof.leaf_hash = sha256_digest(b"not in the tree");
        assert!(!MerkleTree::verify_proof(&proof));
        assert!(tree.proof(5).is_err());
    }
}
