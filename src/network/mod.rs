//! Peer-to-peer networking
//!
//! The message codec, the known-peer set and the node server that keeps
//! ledgers in sync and relays transactions to miners.

pub mod message;
pub mod node;
pub mod server;

pub use message::{OpType, Package};
pub use node::{Node, Nodes};
pub use server::{send_tx, Server};
