use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::blockchain::crypto::Address;
use crate::blockchain::pow::MAX_NONCE;

/// Runtime settings for the ledger
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of the sled database holding chain, UTXO snapshot and wallets
    pub data_dir: PathBuf,

    /// Leading zero bits required of the genesis block hash
    pub genesis_difficulty: u32,

    /// Leading zero bits required of every later block hash
    pub difficulty: u32,

    /// Value of each coinbase output
    pub block_reward: u64,

    /// Nonce ceiling after which mining fails
    pub max_nonce: u64,

    /// Receives the genesis reward when the store is empty
    pub genesis_address: Option<Address>,

    /// Raised (e.g. by the interrupt handler) to abort mining
    pub cancel: Arc<AtomicBool>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("data/ledger"),
            genesis_difficulty: 3,
            difficulty: 4,
            block_reward: 20,
            max_nonce: MAX_NONCE,
            genesis_address: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Config {
    /// Low difficulties so tests mine instantly
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            genesis_difficulty: 2,
            difficulty: 2,
            ..Config::default()
        }
    }
}
