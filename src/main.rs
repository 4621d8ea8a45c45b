use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info, LevelFilter};
use pow_ledger::{
    address_to_pub_key_hash, convert_address, hash_pub_key, send_tx, validate_address,
    Blockchain, BlockchainError, Command, Config, Opt, ProofOfWork, Result, Server, Transaction,
    UTXOSet, Wallets,
};
use std::path::PathBuf;
use std::process;

const LEDGER_DIR: &str = "ledger";

fn main() {
    // Info by default; RUST_LOG still wins.
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    let result =
        Config::load(opt.config.as_deref()).and_then(|config| run_command(config, opt.command));
    if let Err(e) = result {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn ledger_path(config: &Config) -> PathBuf {
    config.node_data_dir().join(LEDGER_DIR)
}

/// Opens this node's ledger, failing when it has no genesis block yet.
fn open_blockchain(config: &Config) -> Result<Blockchain> {
    let blockchain = Blockchain::open(&ledger_path(config), config.get_target_bits())?;
    if !blockchain.is_initialized() {
        return Err(BlockchainError::ChainNotInitialized);
    }
    Ok(blockchain)
}

fn check_address(address: &str) -> Result<()> {
    if !validate_address(address) {
        return Err(BlockchainError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

fn run_command(mut config: Config, command: Command) -> Result<()> {
    match command {
        Command::Createblockchain { address } => {
            check_address(&address)?;
            let blockchain =
                Blockchain::create(&ledger_path(&config), &address, config.get_target_bits())?;
            let utxo_set = UTXOSet::new(blockchain);
            utxo_set.reindex()?;
            println!("Done!");
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(&config.node_data_dir())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            check_address(&address)?;
            let pub_key_hash = address_to_pub_key_hash(&address)?;
            let utxo_set = UTXOSet::new(open_blockchain(&config)?);
            let balance = utxo_set.get_balance(&pub_key_hash)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(&config.node_data_dir())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            check_address(&from)?;
            check_address(&to)?;

            let wallets = Wallets::load(&config.node_data_dir())?;
            let wallet = wallets.get_wallet(&from).ok_or_else(|| {
                BlockchainError::Wallet(format!("No wallet for address {from} on this node"))
            })?;
            let blockchain = open_blockchain(&config)?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            let transaction = Transaction::new_utxo_transaction(wallet, &to, amount, &utxo_set)?;

            if mine {
                let coinbase_tx = Transaction::new_coinbase_tx(&from, "")?;
                let block = blockchain.mine_block(&[coinbase_tx, transaction])?;
                utxo_set.update(&block)?;
                info!("Mined block {}", block.get_hash_hex());
            } else {
                send_tx(&config, &transaction)?;
            }
            println!("Success!")
        }
        Command::Printchain => {
            for block in open_blockchain(&config)?.iterator() {
                let block = block?;
                println!("Pre block hash: {}", HEXLOWER.encode(block.get_pre_block_hash()));
                println!("Cur block hash: {}", block.get_hash_hex());
                println!("Height: {}", block.get_height());
                println!("Timestamp: {}", block.get_timestamp());
                println!("PoW: {}", ProofOfWork::validate(&block));

                for tx in block.get_transactions() {
                    println!("- Transaction txid_hex: {}", tx.get_id_hex());
                    if !tx.is_coinbase() {
                        for input in tx.get_vin() {
                            let address = convert_address(&hash_pub_key(input.get_pub_key()));
                            println!(
                                "-- Input txid = {}, vout = {}, from = {}",
                                HEXLOWER.encode(input.get_txid()),
                                input.get_vout(),
                                address,
                            )
                        }
                    }
                    for output in tx.get_vout() {
                        let address = convert_address(output.get_pub_key_hash());
                        println!("-- Output value = {}, to = {}", output.get_value(), address)
                    }
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let utxo_set = UTXOSet::new(open_blockchain(&config)?);
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner } => {
            if let Some(addr) = miner {
                check_address(&addr)?;
                println!("Mining is on. Address to receive rewards: {addr}");
                config.set_mining_addr(Some(addr));
            }

            let blockchain = Blockchain::open(&ledger_path(&config), config.get_target_bits())?;
            if !blockchain.is_initialized() {
                info!("No local blockchain yet, waiting to sync from peers");
            }
            let server = Server::new(config, blockchain);
            server.get_utxo_set().reindex()?;
            server.run()?
        }
    }
    Ok(())
}
