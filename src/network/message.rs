//! Wire format
//!
//! Every message travels on its own connection: a 12-byte ASCII command,
//! null padded, followed by the bincode-encoded payload for that command.

use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const COMMAND_LENGTH: usize = 12;
pub const NODE_VERSION: i32 = 1;

const VERSION_COMMAND: &str = "version";
const ADDR_COMMAND: &str = "addr";
const BLOCK_COMMAND: &str = "block";
const TX_COMMAND: &str = "tx";
const GET_BLOCKS_COMMAND: &str = "getBlocks";
const GET_DATA_COMMAND: &str = "getData";
const INV_COMMAND: &str = "inv";

/// What an `inv` or `getData` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum OpType {
    Tx,
    Block,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpType::Tx => write!(f, "tx"),
            OpType::Block => write!(f, "block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Version {
    pub version: i32,
    /// -1 when the sender has no chain yet.
    pub best_height: i64,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Addr {
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockData {
    pub addr_from: String,
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TxData {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetBlocks {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetData {
    pub addr_from: String,
    pub op_type: OpType,
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Inv {
    pub addr_from: String,
    pub op_type: OpType,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Package {
    Version(Version),
    Addr(Addr),
    Block(BlockData),
    Tx(TxData),
    GetBlocks(GetBlocks),
    GetData(GetData),
    Inv(Inv),
}

impl Package {
    pub fn command(&self) -> &'static str {
        match self {
            Package::Version(_) => VERSION_COMMAND,
            Package::Addr(_) => ADDR_COMMAND,
            Package::Block(_) => BLOCK_COMMAND,
            Package::Tx(_) => TX_COMMAND,
            Package::GetBlocks(_) => GET_BLOCKS_COMMAND,
            Package::GetData(_) => GET_DATA_COMMAND,
            Package::Inv(_) => INV_COMMAND,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Package::Version(payload) => serialize(payload)?,
            Package::Addr(payload) => serialize(payload)?,
            Package::Block(payload) => serialize(payload)?,
            Package::Tx(payload) => serialize(payload)?,
            Package::GetBlocks(payload) => serialize(payload)?,
            Package::GetData(payload) => serialize(payload)?,
            Package::Inv(payload) => serialize(payload)?,
        };
        let mut request = command_to_bytes(self.command()).to_vec();
        request.extend(payload);
        Ok(request)
    }

    pub fn from_bytes(request: &[u8]) -> Result<Package> {
        if request.len() < COMMAND_LENGTH {
            return Err(BlockchainError::Serialization(format!(
                "Message of {} bytes is shorter than its command",
                request.len()
            )));
        }
        let (command, payload) = request.split_at(COMMAND_LENGTH);
        let package = match bytes_to_command(command)?.as_str() {
            VERSION_COMMAND => Package::Version(deserialize(payload)?),
            ADDR_COMMAND => Package::Addr(deserialize(payload)?),
            BLOCK_COMMAND => Package::Block(deserialize(payload)?),
            TX_COMMAND => Package::Tx(deserialize(payload)?),
            GET_BLOCKS_COMMAND => Package::GetBlocks(deserialize(payload)?),
            GET_DATA_COMMAND => Package::GetData(deserialize(payload)?),
            INV_COMMAND => Package::Inv(deserialize(payload)?),
            unknown => {
                return Err(BlockchainError::Serialization(format!(
                    "Unknown command: {unknown}"
                )))
            }
        };
        Ok(package)
    }
}

pub fn command_to_bytes(command: &str) -> [u8; COMMAND_LENGTH] {
    let mut bytes = [0u8; COMMAND_LENGTH];
    for (slot, byte) in bytes.iter_mut().zip(command.bytes()) {
        *slot = byte;
    }
    bytes
}

pub fn bytes_to_command(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let command = &bytes[..end];
    if !command.is_ascii() || bytes[end..].iter().any(|b| *b != 0) {
        return Err(BlockchainError::Serialization(
            "Malformed command bytes".to_string(),
        ));
    }
    String::from_utf8(command.to_vec())
        .map_err(|e| BlockchainError::Serialization(format!("Malformed command: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_padding() {
        let bytes = command_to_bytes("inv");
        assert_eq!(&bytes[..3], b"inv");
        assert!(bytes[3..].iter().all(|b| *b == 0));
        assert_eq!(bytes_to_command(&bytes).unwrap(), "inv");
        assert_eq!(
            bytes_to_command(&command_to_bytes("getBlocks")).unwrap(),
            "getBlocks"
        );
    }

    #[test]
    fn test_frame_layout() {
        let package = Package::GetBlocks(GetBlocks {
            addr_from: "127.0.0.1:3001".to_string(),
        });
        let bytes = package.to_bytes().unwrap();
        assert_eq!(&bytes[..COMMAND_LENGTH], &command_to_bytes("getBlocks"));
        assert_eq!(Package::from_bytes(&bytes).unwrap(), package);
    }

    #[test]
    fn test_inv_keeps_item_order() {
        let package = Package::Inv(Inv {
            addr_from: "127.0.0.1:3000".to_string(),
            op_type: OpType::Block,
            items: vec![vec![3; 32], vec![2; 32], vec![1; 32]],
        });
        let decoded = Package::from_bytes(&package.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, package);
    }

    #[test]
    fn test_negative_height_survives() {
        let package = Package::Version(Version {
            version: NODE_VERSION,
            best_height: -1,
            addr_from: "127.0.0.1:3002".to_string(),
        });
        match Package::from_bytes(&package.to_bytes().unwrap()).unwrap() {
            Package::Version(version) => assert_eq!(version.best_height, -1),
            other => panic!("unexpected package {other:?}"),
        }
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(Package::from_bytes(b"inv").is_err());

        let mut unknown = command_to_bytes("mystery").to_vec();
        unknown.extend([0u8; 4]);
        assert!(Package::from_bytes(&unknown).is_err());

        // Valid command, truncated payload.
        let package = Package::Tx(TxData {
            addr_from: "127.0.0.1:3000".to_string(),
            transaction: vec![1, 2, 3, 4],
        });
        let bytes = package.to_bytes().unwrap();
        assert!(Package::from_bytes(&bytes[..bytes.len() - 2]).is_err());

        let mut garbage = command_to_bytes("in").to_vec();
        garbage[5] = b'x';
        assert!(bytes_to_command(&garbage).is_err());
    }
}
