use crate::core::{MAX_TARGET_BITS, TARGET_BITS};
use crate::error::{BlockchainError, Result};
use crate::wallet::validate_address;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_NODE_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_MINING_THRESHOLD: usize = 2;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const BOOTSTRAP_NODE_KEY: &str = "BOOTSTRAP_NODE";
const MINING_ADDRESS_KEY: &str = "MINING_ADDRESS";
const DATA_DIR_KEY: &str = "DATA_DIR";
const TARGET_BITS_KEY: &str = "TARGET_BITS";
const MINING_THRESHOLD_KEY: &str = "MINING_THRESHOLD";
const SEND_TIMEOUT_MS_KEY: &str = "SEND_TIMEOUT_MS";

/// Node settings. Built from defaults, then an optional TOML file, then
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    node_address: String,
    bootstrap_node: String,
    mining_address: Option<String>,
    data_dir: PathBuf,
    target_bits: u32,
    mining_threshold: usize,
    send_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_address: String::from(DEFAULT_NODE_ADDR),
            bootstrap_node: String::from(DEFAULT_NODE_ADDR),
            mining_address: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            target_bits: TARGET_BITS,
            mining_threshold: DEFAULT_MINING_THRESHOLD,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Loads the configuration for this process: `config_file` if given,
    /// then the process environment on top.
    pub fn load(config_file: Option<&Path>) -> Result<Config> {
        let mut config = match config_file {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(|e| {
                    BlockchainError::Config(format!("Cannot read {}: {e}", path.display()))
                })?;
                Config::from_toml_str(&contents)?
            }
            None => Config::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Config> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies `NODE_ADDRESS`-style overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(NODE_ADDRESS_KEY) {
            self.node_address = addr;
        }
        if let Some(addr) = lookup(BOOTSTRAP_NODE_KEY) {
            self.bootstrap_node = addr;
        }
        if let Some(addr) = lookup(MINING_ADDRESS_KEY) {
            self.mining_address = Some(addr).filter(|addr| !addr.is_empty());
        }
        if let Some(dir) = lookup(DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(bits) = lookup(TARGET_BITS_KEY) {
            self.target_bits = parse_value(TARGET_BITS_KEY, &bits)?;
        }
        if let Some(threshold) = lookup(MINING_THRESHOLD_KEY) {
            self.mining_threshold = parse_value(MINING_THRESHOLD_KEY, &threshold)?;
        }
        if let Some(timeout) = lookup(SEND_TIMEOUT_MS_KEY) {
            self.send_timeout_ms = parse_value(SEND_TIMEOUT_MS_KEY, &timeout)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_bits == 0 || self.target_bits > MAX_TARGET_BITS {
            return Err(BlockchainError::Config(format!(
                "target_bits must be between 1 and {MAX_TARGET_BITS}, got {}",
                self.target_bits
            )));
        }
        if self.mining_threshold == 0 {
            return Err(BlockchainError::Config(
                "mining_threshold must be at least 1".to_string(),
            ));
        }
        if let Some(addr) = &self.mining_address {
            if !validate_address(addr) {
                return Err(BlockchainError::InvalidAddress(addr.clone()));
            }
        }
        Ok(())
    }

    pub fn get_node_addr(&self) -> &str {
        self.node_address.as_str()
    }

    pub fn set_node_addr(&mut self, addr: String) {
        self.node_address = addr;
    }

    pub fn get_bootstrap_addr(&self) -> &str {
        self.bootstrap_node.as_str()
    }

    pub fn set_bootstrap_addr(&mut self, addr: String) {
        self.bootstrap_node = addr;
    }

    pub fn get_mining_addr(&self) -> Option<&str> {
        self.mining_address.as_deref()
    }

    pub fn set_mining_addr(&mut self, addr: Option<String>) {
        self.mining_address = addr;
    }

    pub fn is_miner(&self) -> bool {
        self.mining_address.is_some()
    }

    /// The bootstrap node relays transactions instead of mining them.
    pub fn is_relay_root(&self) -> bool {
        self.node_address == self.bootstrap_node
    }

    pub fn get_data_dir(&self) -> &Path {
        self.data_dir.as_path()
    }

    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    /// Per-node directory, e.g. `data/3001` for `127.0.0.1:3001`.
    pub fn node_data_dir(&self) -> PathBuf {
        let node_id = self
            .node_address
            .rsplit(':')
            .next()
            .filter(|port| !port.is_empty())
            .unwrap_or("default");
        self.data_dir.join(node_id)
    }

    pub fn get_target_bits(&self) -> u32 {
        self.target_bits
    }

    pub fn set_target_bits(&mut self, target_bits: u32) {
        self.target_bits = target_bits;
    }

    pub fn get_mining_threshold(&self) -> usize {
        self.mining_threshold
    }

    pub fn set_mining_threshold(&mut self, threshold: usize) {
        self.mining_threshold = threshold;
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BlockchainError::Config(format!("Invalid {key} '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.get_node_addr(), "127.0.0.1:3000");
        assert_eq!(config.get_bootstrap_addr(), "127.0.0.1:3000");
        assert!(config.is_relay_root());
        assert!(!config.is_miner());
        assert_eq!(config.get_target_bits(), TARGET_BITS);
        assert_eq!(config.get_mining_threshold(), 2);
        assert_eq!(config.send_timeout(), Duration::from_millis(5000));
        assert_eq!(config.node_data_dir(), PathBuf::from("data").join("3000"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let miner = Wallet::new().unwrap().get_address();
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("NODE_ADDRESS", "127.0.0.1:3001"),
                ("MINING_ADDRESS", miner.as_str()),
                ("TARGET_BITS", "16"),
                ("MINING_THRESHOLD", "3"),
            ]))
            .unwrap();

        assert_eq!(config.get_node_addr(), "127.0.0.1:3001");
        assert!(!config.is_relay_root());
        assert_eq!(config.get_mining_addr(), Some(miner.as_str()));
        assert_eq!(config.get_target_bits(), 16);
        assert_eq!(config.get_mining_threshold(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = Config::default();
        let result = config.apply_overrides(lookup(&[("TARGET_BITS", "lots")]));
        assert!(matches!(result, Err(BlockchainError::Config(_))));
    }

    #[test]
    fn test_toml_file_then_env() {
        let config_toml = r#"
            node_address = "127.0.0.1:4000"
            bootstrap_node = "127.0.0.1:3000"
            data_dir = "/tmp/ledger"
            target_bits = 12
        "#;
        let mut config = Config::from_toml_str(config_toml).unwrap();
        assert_eq!(config.get_node_addr(), "127.0.0.1:4000");
        assert_eq!(config.get_target_bits(), 12);
        // Unset keys keep their defaults.
        assert_eq!(config.get_mining_threshold(), 2);

        config
            .apply_overrides(lookup(&[("NODE_ADDRESS", "127.0.0.1:4001")]))
            .unwrap();
        assert_eq!(config.get_node_addr(), "127.0.0.1:4001");
        assert_eq!(config.node_data_dir(), PathBuf::from("/tmp/ledger/4001"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "target_bits = 20\nmining_threshold = 5\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.get_target_bits(), 20);
        assert_eq!(config.get_mining_threshold(), 5);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::from_toml_str("mining_treshold = 3").is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.set_target_bits(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.set_mining_threshold(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.set_mining_addr(Some("not-an-address".to_string()));
        assert!(matches!(
            config.validate(),
            Err(BlockchainError::InvalidAddress(_))
        ));
    }
}
