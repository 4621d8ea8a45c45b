//! Core ledger functionality
//!
//! Blocks, transactions, the Merkle commitment, proof-of-work and the
//! sled-backed chain itself.

pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod proof_of_work;
pub mod transaction;

pub use block::{Block, GENESIS_COINBASE_DATA};
pub use blockchain::{Blockchain, BlockchainIterator};
pub use merkle::{MerkleProof, MerkleTree, ProofElement};
pub use proof_of_work::{ProofOfWork, MAX_TARGET_BITS, TARGET_BITS};
pub use transaction::{TXInput, TXOutput, Transaction, UnspentOutput, COINBASE_VOUT, SUBSIDY};
