// bincode 2 helpers used for blocks, transactions, UTXO entries and wire payloads
use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on bytes a single decode may claim, so a hostile length
/// prefix cannot trigger a huge allocation.
const MAX_DECODE_BYTES: usize = 64 * 1024 * 1024;

pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::encode_to_vec(data, config)
        .map_err(|e| BlockchainError::Serialization(format!("Serialization failed: {e}")))
}

/// Decodes exactly one value; trailing bytes are treated as corruption.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let config = bincode::config::standard().with_limit::<MAX_DECODE_BYTES>();
    let (data, consumed) = bincode::decode_from_slice(bytes, config)
        .map_err(|e| BlockchainError::Serialization(format!("Deserialization failed: {e}")))?;
    if consumed != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "Deserialization left {} trailing bytes",
            bytes.len() - consumed
        )));
    }
    Ok(data)
}
