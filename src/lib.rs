//! # pow-ledger
//!
//! A minimal proof-of-work ledger over unspent transaction outputs.
//!
//! - `core/`: blocks, the proof-of-work search, Merkle commitments,
//!   transactions and the `Blockchain` state machine.
//! - `storage/`: the persistent UTXO index, the memory pool and the queue of
//!   blocks being downloaded.
//! - `network/`: the wire codec, known peers and the node server that keeps
//!   ledgers in sync.
//! - `wallet/`: key pairs, addresses and the on-disk wallet store.
//! - `config/`: node settings from defaults, a TOML file and the environment.
//! - `utils/`: hashing, signing, Base58 and bincode helpers.
//! - `cli/`: argument parsing for the binary.
//!
//! Every fallible operation returns [`Result`] with a [`BlockchainError`].

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

pub use cli::{Command, Opt};
pub use config::Config;
pub use core::{
    Block, Blockchain, MerkleProof, MerkleTree, ProofOfWork, TXInput, TXOutput, Transaction,
    UnspentOutput,
};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, Node, Nodes, OpType, Package, Server};
pub use storage::{BlockInTransit, MemoryPool, UTXOSet};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
