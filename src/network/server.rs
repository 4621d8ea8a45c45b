use crate::config::Config;
use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{
    Addr, BlockData, GetBlocks, GetData, Inv, OpType, Package, TxData, Version, COMMAND_LENGTH,
    NODE_VERSION,
};
use crate::network::Nodes;
use crate::storage::{BlockInTransit, MemoryPool, UTXOSet};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

const TCP_READ_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_MESSAGE_BYTES: u64 = 64 * 1024 * 1024 + COMMAND_LENGTH as u64;

/// A peer-to-peer node. Cloning is cheap; all clones share one state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: Config,
    blockchain: Blockchain,
    utxo_set: UTXOSet,
    mempool: MemoryPool,
    nodes: Nodes,
    blocks_in_transit: BlockInTransit,
    // Set once the miner worker runs; without it mining happens inline.
    miner: Mutex<Option<Sender<()>>>,
}

impl Server {
    pub fn new(config: Config, blockchain: Blockchain) -> Server {
        let nodes = Nodes::new();
        if !config.is_relay_root() {
            nodes.add_node(config.get_bootstrap_addr());
        }

        Server {
            inner: Arc::new(ServerInner {
                utxo_set: UTXOSet::new(blockchain.clone()),
                blockchain,
                config,
                mempool: MemoryPool::new(),
                nodes,
                blocks_in_transit: BlockInTransit::new(),
                miner: Mutex::new(None),
            }),
        }
    }

    pub fn get_config(&self) -> &Config {
        &self.inner.config
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.inner.blockchain
    }

    pub fn get_utxo_set(&self) -> &UTXOSet {
        &self.inner.utxo_set
    }

    pub fn get_mempool(&self) -> &MemoryPool {
        &self.inner.mempool
    }

    pub fn get_nodes(&self) -> &Nodes {
        &self.inner.nodes
    }

    pub fn get_blocks_in_transit(&self) -> &BlockInTransit {
        &self.inner.blocks_in_transit
    }

    fn node_addr(&self) -> &str {
        self.inner.config.get_node_addr()
    }

    /// Binds the configured address and serves forever.
    pub fn run(&self) -> Result<()> {
        let addr = self.node_addr();
        let listener = TcpListener::bind(addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        info!("Server listening on {addr}");
        self.serve(listener)
    }

    /// Starts the miner worker when a mining address is configured, greets
    /// the bootstrap node, then handles each accepted connection on its own
    /// thread.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.inner.config.is_miner() {
            self.start_miner()?;
        }

        if !self.inner.config.is_relay_root() {
            let bootstrap = self.inner.config.get_bootstrap_addr();
            if let Err(e) = self.send_version(bootstrap) {
                warn!("Failed to reach bootstrap node {bootstrap}: {e}");
            }
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            error!("Error handling connection: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    fn start_miner(&self) -> Result<()> {
        let (sender, receiver) = mpsc::channel::<()>();
        let server = self.clone();
        thread::Builder::new()
            .name("miner".to_string())
            .spawn(move || {
                while receiver.recv().is_ok() {
                    // Signals queued during the last round are covered by the next one.
                    while receiver.try_recv().is_ok() {}
                    if let Err(e) = server.mine_pending() {
                        error!("Mining round failed: {e}");
                    }
                }
            })?;
        *self.inner.miner.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        info!("Miner worker started");
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let peer_addr = stream.peer_addr()?;
        stream.set_read_timeout(Some(TCP_READ_TIMEOUT))?;

        let mut request = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES)
            .read_to_end(&mut request)?;
        let _ = stream.shutdown(Shutdown::Both);

        let package = Package::from_bytes(&request)?;
        info!("Received {} command from {peer_addr}", package.command());
        self.handle_package(package)
    }

    pub fn handle_package(&self, package: Package) -> Result<()> {
        match package {
            Package::Version(payload) => self.handle_version(payload),
            Package::Addr(payload) => self.handle_addr(payload),
            Package::Block(payload) => self.handle_block(payload),
            Package::Tx(payload) => self.handle_tx(payload),
            Package::GetBlocks(payload) => self.handle_get_blocks(payload),
            Package::GetData(payload) => self.handle_get_data(payload),
            Package::Inv(payload) => self.handle_inv(payload),
        }
    }

    fn handle_version(&self, payload: Version) -> Result<()> {
        let addr_from = payload.addr_from.as_str();
        let is_new_peer = addr_from != self.node_addr() && self.inner.nodes.add_node(addr_from);

        let local_best_height = self.local_best_height()?;
        debug!(
            "Version {} from {addr_from}: peer height {}, local height {local_best_height}",
            payload.version, payload.best_height
        );
        if local_best_height < payload.best_height {
            self.send_get_blocks(addr_from)?;
        } else if local_best_height > payload.best_height {
            self.send_version(addr_from)?;
        }

        if is_new_peer {
            let others = self
                .inner
                .nodes
                .addresses_except(&[addr_from, self.node_addr()]);
            if !others.is_empty() {
                self.send_addr(addr_from, others)?;
            }
        }
        Ok(())
    }

    fn handle_addr(&self, payload: Addr) -> Result<()> {
        for addr in &payload.addr_list {
            if addr != self.node_addr() {
                self.inner.nodes.add_node(addr);
            }
        }
        info!("There are {} known nodes now", self.inner.nodes.len());
        self.request_blocks();
        Ok(())
    }

    fn request_blocks(&self) {
        for addr in self.inner.nodes.addresses_except(&[self.node_addr()]) {
            if let Err(e) = self.send_get_blocks(&addr) {
                warn!("Failed to request blocks from {addr}: {e}");
            }
        }
    }

    fn handle_block(&self, payload: BlockData) -> Result<()> {
        let blockchain = &self.inner.blockchain;
        let received = Block::deserialize(&payload.block).and_then(|block| {
            info!(
                "Received block {} (height {}) from {}",
                block.get_hash_hex(),
                block.get_height(),
                payload.addr_from
            );
            blockchain.add_block(&block).map(|_| block)
        });
        // A bad block is dropped; the rest of the download continues.
        let block = match received {
            Ok(block) => Some(block),
            Err(e @ (BlockchainError::InvalidBlock(_) | BlockchainError::Serialization(_))) => {
                warn!("Dropping block from {}: {e}", payload.addr_from);
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(next) = self.inner.blocks_in_transit.pop_front() {
            return self.send_get_data(&payload.addr_from, OpType::Block, &next);
        }
        if let Some(block) = &block {
            if !block.is_genesis() && !blockchain.has_block(block.get_pre_block_hash())? {
                info!("Parent of block {} unknown, resyncing", block.get_hash_hex());
                return self.send_get_blocks(&payload.addr_from);
            }
        }
        self.inner.utxo_set.reindex()
    }

    fn handle_tx(&self, payload: TxData) -> Result<()> {
        let tx = Transaction::deserialize(&payload.transaction)?;
        if tx.is_coinbase() {
            return Err(BlockchainError::InvalidTransaction(format!(
                "Coinbase transaction {} relayed by {}",
                tx.get_id_hex(),
                payload.addr_from
            )));
        }
        let txid = tx.get_id().to_vec();
        let txid_hex = tx.get_id_hex();
        if !self.inner.mempool.add(tx) {
            debug!("Transaction {txid_hex} already pending");
            return Ok(());
        }
        info!(
            "Added transaction {txid_hex} to memory pool ({} pending)",
            self.inner.mempool.len()
        );

        let config = &self.inner.config;
        if config.is_relay_root() {
            for addr in self
                .inner
                .nodes
                .addresses_except(&[self.node_addr(), payload.addr_from.as_str()])
            {
                if let Err(e) = self.send_inv(&addr, OpType::Tx, vec![txid.clone()]) {
                    warn!("Failed to relay transaction {txid_hex} to {addr}: {e}");
                }
            }
        } else if config.is_miner() && self.inner.mempool.len() >= config.get_mining_threshold() {
            self.request_mining()?;
        }
        Ok(())
    }

    fn handle_get_blocks(&self, payload: GetBlocks) -> Result<()> {
        let blocks = self.inner.blockchain.get_block_hashes()?;
        self.send_inv(&payload.addr_from, OpType::Block, blocks)
    }

    fn handle_get_data(&self, payload: GetData) -> Result<()> {
        match payload.op_type {
            OpType::Block => match self.inner.blockchain.get_block(&payload.id) {
                Ok(block) => self.send_block(&payload.addr_from, &block),
                Err(BlockchainError::BlockNotFound(hash)) => {
                    debug!("Requested block {hash} not found");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            OpType::Tx => {
                let txid_hex = HEXLOWER.encode(&payload.id);
                match self.inner.mempool.get(&txid_hex) {
                    Some(tx) => self.send_tx(&payload.addr_from, &tx),
                    None => {
                        debug!("Requested transaction {txid_hex} not pending");
                        Ok(())
                    }
                }
            }
        }
    }

    fn handle_inv(&self, payload: Inv) -> Result<()> {
        info!(
            "Received inventory with {} {}",
            payload.items.len(),
            payload.op_type
        );
        match payload.op_type {
            OpType::Block => {
                let mut missing = Vec::with_capacity(payload.items.len());
                for hash in payload.items {
                    if !self.inner.blockchain.has_block(&hash)? {
                        missing.push(hash);
                    }
                }
                self.inner.blocks_in_transit.replace(&missing);
                if let Some(block_hash) = self.inner.blocks_in_transit.pop_front() {
                    self.send_get_data(&payload.addr_from, OpType::Block, &block_hash)?;
                }
            }
            OpType::Tx => {
                for txid in &payload.items {
                    if !self.inner.mempool.contains(&HEXLOWER.encode(txid)) {
                        self.send_get_data(&payload.addr_from, OpType::Tx, txid)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn request_mining(&self) -> Result<()> {
        let miner = self
            .inner
            .miner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match miner {
            Some(sender) => {
                if sender.send(()).is_err() {
                    warn!("Miner worker is gone, mining inline");
                    return self.mine_pending();
                }
                Ok(())
            }
            None => self.mine_pending(),
        }
    }

    /// Mines the memory pool until it is empty: each round verifies every
    /// pending transaction, drops the invalid ones, mines a conflict-free
    /// selection plus a coinbase reward, updates the UTXO index and announces
    /// the block to all known peers.
    pub fn mine_pending(&self) -> Result<()> {
        let mining_address = self
            .inner
            .config
            .get_mining_addr()
            .ok_or_else(|| BlockchainError::Config("Mining address not configured".to_string()))?;
        let blockchain = &self.inner.blockchain;
        let mempool = &self.inner.mempool;

        while !mempool.is_empty() {
            let mut selected: Vec<Transaction> = vec![];
            let mut spent: HashSet<(Vec<u8>, i64)> = HashSet::new();

            for tx in mempool.get_all() {
                let valid = !tx.is_coinbase()
                    && match blockchain.verify_transaction(&tx) {
                        Ok(valid) => valid,
                        Err(e) => {
                            warn!("Cannot verify transaction {}: {e}", tx.get_id_hex());
                            false
                        }
                    };
                if !valid {
                    warn!("Discarding invalid transaction {}", tx.get_id_hex());
                    mempool.remove(&tx.get_id_hex());
                    continue;
                }

                let outpoints: Vec<(Vec<u8>, i64)> = tx
                    .get_vin()
                    .iter()
                    .map(|vin| (vin.get_txid().to_vec(), vin.get_vout()))
                    .collect();
                // Conflicting transactions wait for the next round, where
                // they fail verification against the mined block.
                if outpoints.iter().any(|outpoint| spent.contains(outpoint)) {
                    continue;
                }
                spent.extend(outpoints);
                selected.push(tx);
            }

            if selected.is_empty() {
                info!("All transactions are invalid! Waiting for new ones...");
                return Ok(());
            }

            let mut txs = selected.clone();
            txs.push(Transaction::new_coinbase_tx(mining_address, "")?);
            let new_block = blockchain.mine_block(&txs)?;

            if blockchain.get_tip_hash().as_deref() == Some(new_block.get_hash()) {
                self.inner.utxo_set.update(&new_block)?;
            } else {
                self.inner.utxo_set.reindex()?;
            }
            info!("New block {} is mined!", new_block.get_hash_hex());

            for tx in &selected {
                mempool.remove(&tx.get_id_hex());
            }

            for addr in self.inner.nodes.addresses_except(&[self.node_addr()]) {
                if let Err(e) =
                    self.send_inv(&addr, OpType::Block, vec![new_block.get_hash().to_vec()])
                {
                    warn!("Failed to announce block to {addr}: {e}");
                }
            }
        }
        Ok(())
    }

    fn local_best_height(&self) -> Result<i64> {
        if !self.inner.blockchain.is_initialized() {
            return Ok(-1);
        }
        Ok(self.inner.blockchain.get_best_height()? as i64)
    }

    fn send_version(&self, addr: &str) -> Result<()> {
        let package = Package::Version(Version {
            version: NODE_VERSION,
            best_height: self.local_best_height()?,
            addr_from: self.node_addr().to_string(),
        });
        self.send_package(addr, &package)
    }

    fn send_addr(&self, addr: &str, addr_list: Vec<String>) -> Result<()> {
        self.send_package(addr, &Package::Addr(Addr { addr_list }))
    }

    fn send_get_blocks(&self, addr: &str) -> Result<()> {
        let package = Package::GetBlocks(GetBlocks {
            addr_from: self.node_addr().to_string(),
        });
        self.send_package(addr, &package)
    }

    fn send_get_data(&self, addr: &str, op_type: OpType, id: &[u8]) -> Result<()> {
        let package = Package::GetData(GetData {
            addr_from: self.node_addr().to_string(),
            op_type,
            id: id.to_vec(),
        });
        self.send_package(addr, &package)
    }

    fn send_inv(&self, addr: &str, op_type: OpType, items: Vec<Vec<u8>>) -> Result<()> {
        let package = Package::Inv(Inv {
            addr_from: self.node_addr().to_string(),
            op_type,
            items,
        });
        self.send_package(addr, &package)
    }

    fn send_block(&self, addr: &str, block: &Block) -> Result<()> {
        let package = Package::Block(BlockData {
            addr_from: self.node_addr().to_string(),
            block: block.serialize()?,
        });
        self.send_package(addr, &package)
    }

    fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<()> {
        let package = Package::Tx(TxData {
            addr_from: self.node_addr().to_string(),
            transaction: tx.serialize()?,
        });
        self.send_package(addr, &package)
    }

    /// Sends one package; an unreachable peer is dropped from the known set.
    fn send_package(&self, addr: &str, package: &Package) -> Result<()> {
        let request = package.to_bytes()?;
        debug!("Sending {} to {addr}", package.command());
        if let Err(e) = send_data(addr, &request, self.inner.config.send_timeout()) {
            warn!("{addr} is not available: {e}");
            self.inner.nodes.evict_node(addr);
            return Err(BlockchainError::PeerUnreachable(addr.to_string()));
        }
        Ok(())
    }
}

/// Submits `tx` to the configured bootstrap node.
pub fn send_tx(config: &Config, tx: &Transaction) -> Result<()> {
    let package = Package::Tx(TxData {
        addr_from: config.get_node_addr().to_string(),
        transaction: tx.serialize()?,
    });
    let addr = config.get_bootstrap_addr();
    send_data(addr, &package.to_bytes()?, config.send_timeout())
        .map_err(|e| BlockchainError::PeerUnreachable(format!("{addr}: {e}")))
}

fn send_data(addr: &str, data: &[u8], timeout: Duration) -> Result<()> {
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| BlockchainError::Network(format!("Address {addr} did not resolve")))?;

    let mut stream = TcpStream::connect_timeout(&socket_addr, timeout)
        .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;
    stream
        .write_all(data)
        .and_then(|_| stream.flush())
        .map_err(|e| BlockchainError::Network(format!("Failed to send data: {e}")))?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;
    use tempfile::TempDir;

    const TEST_BITS: u32 = 8;
    const NODE_ADDR: &str = "127.0.0.1:39901";

    fn fake_peer() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn receive(listener: &TcpListener) -> Package {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        stream.read_to_end(&mut request).unwrap();
        Package::from_bytes(&request).unwrap()
    }

    fn config(bootstrap: &str, mining_address: Option<String>) -> Config {
        let mut config = Config::default();
        config.set_node_addr(NODE_ADDR.to_string());
        config.set_bootstrap_addr(bootstrap.to_string());
        config.set_mining_addr(mining_address);
        config.set_target_bits(TEST_BITS);
        config
    }

    fn chain_for(owner: &Wallet) -> (TempDir, Blockchain) {
        let dir = tempfile::tempdir().unwrap();
        let chain = Blockchain::create(dir.path(), &owner.get_address(), TEST_BITS).unwrap();
        (dir, chain)
    }

    fn empty_chain() -> (TempDir, Blockchain) {
        let dir = tempfile::tempdir().unwrap();
        let chain = Blockchain::open(dir.path(), TEST_BITS).unwrap();
        (dir, chain)
    }

    fn reward_block(chain: &Blockchain, to: &Wallet) -> Block {
        let reward = Transaction::new_coinbase_tx(&to.get_address(), "").unwrap();
        chain.mine_block(&[reward]).unwrap()
    }

    fn tx_package(tx: &Transaction) -> Package {
        Package::Tx(TxData {
            addr_from: "127.0.0.1:39950".to_string(),
            transaction: tx.serialize().unwrap(),
        })
    }

    #[test]
    fn test_new_server_knows_bootstrap() {
        let (_dir, chain) = empty_chain();
        let server = Server::new(config("127.0.0.1:3000", None), chain);
        assert!(server.get_nodes().node_is_known("127.0.0.1:3000"));

        let (_dir, chain) = empty_chain();
        let root = Server::new(config(NODE_ADDR, None), chain);
        assert!(root.get_nodes().is_empty());
    }

    #[test]
    fn test_get_blocks_replies_with_inventory() {
        let owner = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        reward_block(&chain, &owner);
        let expected = chain.get_block_hashes().unwrap();

        let (peer, peer_addr) = fake_peer();
        let server = Server::new(config(NODE_ADDR, None), chain);
        server
            .handle_package(Package::GetBlocks(GetBlocks {
                addr_from: peer_addr,
            }))
            .unwrap();

        match receive(&peer) {
            Package::Inv(inv) => {
                assert_eq!(inv.op_type, OpType::Block);
                assert_eq!(inv.items, expected);
                assert_eq!(inv.addr_from, NODE_ADDR);
            }
            other => panic!("unexpected package {other:?}"),
        }
    }

    #[test]
    fn test_version_from_shorter_peer() {
        let owner = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        let (peer, peer_addr) = fake_peer();
        let server = Server::new(config(NODE_ADDR, None), chain);

        server
            .handle_package(Package::Version(Version {
                version: NODE_VERSION,
                best_height: -1,
                addr_from: peer_addr.clone(),
            }))
            .unwrap();

        match receive(&peer) {
            Package::Version(version) => assert_eq!(version.best_height, 0),
            other => panic!("unexpected package {other:?}"),
        }
        assert!(server.get_nodes().node_is_known(&peer_addr));
    }

    #[test]
    fn test_version_from_longer_peer() {
        let (_dir, chain) = empty_chain();
        let (peer, peer_addr) = fake_peer();
        let server = Server::new(config(NODE_ADDR, None), chain);

        server
            .handle_package(Package::Version(Version {
                version: NODE_VERSION,
                best_height: 5,
                addr_from: peer_addr,
            }))
            .unwrap();
        assert!(matches!(receive(&peer), Package::GetBlocks(_)));
    }

    #[test]
    fn test_new_peer_learns_other_peers() {
        let owner = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        let (_other, other_addr) = fake_peer();
        let (peer, peer_addr) = fake_peer();
        let server = Server::new(config(NODE_ADDR, None), chain);
        server.get_nodes().add_node(&other_addr);

        // Same height: the only reply is the address list.
        server
            .handle_package(Package::Version(Version {
                version: NODE_VERSION,
                best_height: 0,
                addr_from: peer_addr,
            }))
            .unwrap();
        match receive(&peer) {
            Package::Addr(addr) => assert_eq!(addr.addr_list, vec![other_addr]),
            other => panic!("unexpected package {other:?}"),
        }
    }

    #[test]
    fn test_addr_merges_and_requests_blocks() {
        let (_dir, chain) = empty_chain();
        let (peer, peer_addr) = fake_peer();
        let server = Server::new(config(NODE_ADDR, None), chain);

        server
            .handle_package(Package::Addr(Addr {
                addr_list: vec![peer_addr.clone(), NODE_ADDR.to_string()],
            }))
            .unwrap();

        assert!(server.get_nodes().node_is_known(&peer_addr));
        assert!(!server.get_nodes().node_is_known(NODE_ADDR));
        assert!(matches!(receive(&peer), Package::GetBlocks(_)));
    }

    #[test]
    fn test_tip_first_sync_then_reindex() {
        let owner = Wallet::new().unwrap();
        let (_source_dir, source) = chain_for(&owner);
        reward_block(&source, &owner);
        reward_block(&source, &owner);
        let hashes = source.get_block_hashes().unwrap();

        let (_dir, chain) = empty_chain();
        let (peer, peer_addr) = fake_peer();
        let server = Server::new(config(NODE_ADDR, None), chain);

        server
            .handle_package(Package::Inv(Inv {
                addr_from: peer_addr.clone(),
                op_type: OpType::Block,
                items: hashes.clone(),
            }))
            .unwrap();

        for (idx, hash) in hashes.iter().enumerate() {
            match receive(&peer) {
                Package::GetData(get_data) => {
                    assert_eq!(get_data.op_type, OpType::Block);
                    assert_eq!(&get_data.id, hash);
                }
                other => panic!("unexpected package {other:?}"),
            }
            assert_eq!(server.get_blocks_in_transit().len(), hashes.len() - idx - 1);
            let block = source.get_block(hash).unwrap();
            server
                .handle_package(Package::Block(BlockData {
                    addr_from: peer_addr.clone(),
                    block: block.serialize().unwrap(),
                }))
                .unwrap();
        }

        let synced = server.get_blockchain();
        assert_eq!(synced.get_best_height().unwrap(), 2);
        assert_eq!(synced.get_tip_hash(), source.get_tip_hash());
        assert_eq!(
            server.get_utxo_set().get_entries().unwrap(),
            source.find_utxo().unwrap()
        );
        assert_eq!(
            server
                .get_utxo_set()
                .get_balance(&owner.get_pub_key_hash())
                .unwrap(),
            30
        );
    }

    #[test]
    fn test_inv_skips_known_blocks() {
        let owner = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        let known = chain.get_block_hashes().unwrap();
        let server = Server::new(config(NODE_ADDR, None), chain);

        // Nothing is requested, so no peer needs to listen.
        server
            .handle_package(Package::Inv(Inv {
                addr_from: "127.0.0.1:39951".to_string(),
                op_type: OpType::Block,
                items: known,
            }))
            .unwrap();
        assert!(server.get_blocks_in_transit().is_empty());
    }

    #[test]
    fn test_get_data_for_unknown_block_is_ignored() {
        let owner = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        let server = Server::new(config(NODE_ADDR, None), chain);
        server
            .handle_package(Package::GetData(GetData {
                addr_from: "127.0.0.1:39952".to_string(),
                op_type: OpType::Block,
                id: vec![0; 32],
            }))
            .unwrap();
    }

    #[test]
    fn test_get_data_sends_pending_transaction() {
        let owner = Wallet::new().unwrap();
        let recipient = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        let server = Server::new(config(NODE_ADDR, None), chain);
        server.get_utxo_set().reindex().unwrap();
        let tx = Transaction::new_utxo_transaction(
            &owner,
            &recipient.get_address(),
            3,
            server.get_utxo_set(),
        )
        .unwrap();
        server.get_mempool().add(tx.clone());

        let (peer, peer_addr) = fake_peer();
        server
            .handle_package(Package::GetData(GetData {
                addr_from: peer_addr,
                op_type: OpType::Tx,
                id: tx.get_id().to_vec(),
            }))
            .unwrap();
        match receive(&peer) {
            Package::Tx(data) => {
                assert_eq!(Transaction::deserialize(&data.transaction).unwrap(), tx)
            }
            other => panic!("unexpected package {other:?}"),
        }
    }

    #[test]
    fn test_relay_root_forwards_transactions() {
        let owner = Wallet::new().unwrap();
        let recipient = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        let server = Server::new(config(NODE_ADDR, None), chain);
        server.get_utxo_set().reindex().unwrap();
        let (peer, peer_addr) = fake_peer();
        server.get_nodes().add_node(&peer_addr);

        let tx = Transaction::new_utxo_transaction(
            &owner,
            &recipient.get_address(),
            3,
            server.get_utxo_set(),
        )
        .unwrap();
        server.handle_package(tx_package(&tx)).unwrap();

        assert!(server.get_mempool().contains(&tx.get_id_hex()));
        match receive(&peer) {
            Package::Inv(inv) => {
                assert_eq!(inv.op_type, OpType::Tx);
                assert_eq!(inv.items, vec![tx.get_id().to_vec()]);
            }
            other => panic!("unexpected package {other:?}"),
        }
        // The root never mines.
        assert_eq!(server.get_blockchain().get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_relayed_coinbase_rejected() {
        let owner = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        let server = Server::new(config(NODE_ADDR, None), chain);
        let coinbase = Transaction::new_coinbase_tx(&owner.get_address(), "").unwrap();
        assert!(matches!(
            server.handle_package(tx_package(&coinbase)),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert!(server.get_mempool().is_empty());
    }

    #[test]
    fn test_miner_mines_at_threshold() {
        let owner = Wallet::new().unwrap();
        let second = Wallet::new().unwrap();
        let recipient = Wallet::new().unwrap();
        let miner = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);
        reward_block(&chain, &second);

        let (bootstrap, bootstrap_addr) = fake_peer();
        let server = Server::new(
            config(&bootstrap_addr, Some(miner.get_address())),
            chain,
        );
        let utxo_set = server.get_utxo_set();
        utxo_set.reindex().unwrap();

        let first_tx =
            Transaction::new_utxo_transaction(&owner, &recipient.get_address(), 3, utxo_set)
                .unwrap();
        let second_tx =
            Transaction::new_utxo_transaction(&second, &recipient.get_address(), 4, utxo_set)
                .unwrap();

        server.handle_package(tx_package(&first_tx)).unwrap();
        assert_eq!(server.get_mempool().len(), 1);
        assert_eq!(server.get_blockchain().get_best_height().unwrap(), 1);

        server.handle_package(tx_package(&second_tx)).unwrap();
        assert!(server.get_mempool().is_empty());
        assert_eq!(server.get_blockchain().get_best_height().unwrap(), 2);
        assert_eq!(utxo_set.get_balance(&recipient.get_pub_key_hash()).unwrap(), 7);
        assert_eq!(utxo_set.get_balance(&miner.get_pub_key_hash()).unwrap(), 10);
        assert_eq!(utxo_set.get_entries().unwrap(), server.get_blockchain().find_utxo().unwrap());

        match receive(&bootstrap) {
            Package::Inv(inv) => {
                assert_eq!(inv.op_type, OpType::Block);
                assert_eq!(
                    Some(inv.items[0].clone()),
                    server.get_blockchain().get_tip_hash()
                );
            }
            other => panic!("unexpected package {other:?}"),
        }
    }

    #[test]
    fn test_miner_discards_invalid_transactions() {
        let owner = Wallet::new().unwrap();
        let recipient = Wallet::new().unwrap();
        let miner = Wallet::new().unwrap();
        let (_dir, chain) = chain_for(&owner);

        let mut config = config("127.0.0.1:39953", Some(miner.get_address()));
        config.set_mining_threshold(1);
        let server = Server::new(config, chain);
        let utxo_set = server.get_utxo_set();
        utxo_set.reindex().unwrap();

        let mined =
            Transaction::new_utxo_transaction(&owner, &recipient.get_address(), 3, utxo_set)
                .unwrap();
        server.get_blockchain().mine_block(&[mined]).unwrap();
        // The index is stale, so this spends the genesis output a second time.
        let tx = Transaction::new_utxo_transaction(&owner, &recipient.get_address(), 3, utxo_set)
            .unwrap();

        server.handle_package(tx_package(&tx)).unwrap();
        assert!(server.get_mempool().is_empty());
        assert_eq!(server.get_blockchain().get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_unreachable_peer_is_evicted() {
        let (_dir, chain) = empty_chain();
        let server = Server::new(config(NODE_ADDR, None), chain);
        let dead_addr = {
            let (listener, addr) = fake_peer();
            drop(listener);
            addr
        };
        server.get_nodes().add_node(&dead_addr);

        assert!(matches!(
            server.send_get_blocks(&dead_addr),
            Err(BlockchainError::PeerUnreachable(_))
        ));
        assert!(!server.get_nodes().node_is_known(&dead_addr));
    }

    #[test]
    fn test_malformed_block_is_dropped() {
        let (_dir, chain) = empty_chain();
        let server = Server::new(config(NODE_ADDR, None), chain);
        server
            .handle_package(Package::Block(BlockData {
                addr_from: "127.0.0.1:39954".to_string(),
                block: vec![1, 2, 3],
            }))
            .unwrap();
        assert!(!server.get_blockchain().is_initialized());
    }

    #[test]
    fn test_sync_continues_past_invalid_block() {
        let owner = Wallet::new().unwrap();
        let (_source_dir, source) = chain_for(&owner);
        reward_block(&source, &owner);
        reward_block(&source, &owner);
        let hashes = source.get_block_hashes().unwrap();

        let (_dir, chain) = empty_chain();
        let (peer, peer_addr) = fake_peer();
        let server = Server::new(config(NODE_ADDR, None), chain);
        server
            .handle_package(Package::Inv(Inv {
                addr_from: peer_addr.clone(),
                op_type: OpType::Block,
                items: hashes.clone(),
            }))
            .unwrap();

        for (idx, hash) in hashes.iter().enumerate() {
            match receive(&peer) {
                Package::GetData(get_data) => assert_eq!(&get_data.id, hash),
                other => panic!("unexpected package {other:?}"),
            }
            let mut block = source.get_block(hash).unwrap();
            if idx == 1 {
                block = block.with_nonce(block.get_nonce() + 1);
            }
            server
                .handle_package(Package::Block(BlockData {
                    addr_from: peer_addr.clone(),
                    block: block.serialize().unwrap(),
                }))
                .unwrap();
        }

        // Only the genesis block connects; the tip still waits for its parent.
        let synced = server.get_blockchain();
        assert!(server.get_blocks_in_transit().is_empty());
        assert_eq!(synced.get_best_height().unwrap(), 0);
        assert_eq!(synced.get_tip_hash().as_ref(), hashes.last());
        assert_eq!(
            server
                .get_utxo_set()
                .get_balance(&owner.get_pub_key_hash())
                .unwrap(),
            10
        );
    }
}
