//! Derived and transient node state
//!
//! The UTXO index lives in the same sled database as the blocks; the memory
//! pool and the in-transit queue are in-memory only.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::{BlockInTransit, MemoryPool};
pub use utxo_set::UTXOSet;
