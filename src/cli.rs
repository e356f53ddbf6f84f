use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use log::debug;

use crate::blockchain::crypto::Address;
use crate::blockchain::storage::BlockchainStorage;
use crate::blockchain::wallet::Wallets;
use crate::blockchain::Ledger;
use crate::config::Config;

/// Single-node UTXO ledger
#[derive(Parser, Debug)]
#[command(name = "utxo-ledger")]
#[command(about = "A single-node UTXO ledger with proof-of-work", long_about = None)]
pub struct Cli {
    /// Directory of the ledger database
    #[arg(long, global = true, env = "LEDGER_DATA_DIR", default_value = "data/ledger")]
    data_dir: PathBuf,

    /// Leading zero bits required of newly mined blocks
    #[arg(long, global = true, env = "LEDGER_DIFFICULTY")]
    difficulty: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "lower")]
enum Command {
    /// Generate a new keypair and print its address
    CreateWallet,

    /// List the addresses of every stored wallet
    ListAddresses,

    /// Create the chain, paying the genesis reward to ADDRESS
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Print every block from the tip back to genesis
    PrintChain,

    /// Send AMOUNT from one address to another in a new block
    Send {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        amount: u64,

        /// Address that receives the block reward
        #[arg(long)]
        miner: Option<String>,
    },

    /// Print the balance of ADDRESS
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Print every unspent output grouped by owner
    PrintUtxoSet,

    /// Rebuild the UTXO index from the chain
    ReindexUtxo,

    /// Check every block's hash, proof of work and link to its predecessor
    ValidateChain,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config {
            data_dir: self.data_dir.clone(),
            ..Config::default()
        };
        if let Some(difficulty) = self.difficulty {
            config.difficulty = difficulty;
        }
        config
    }
}

fn parse_address(s: &str) -> Result<Address> {
    s.parse().with_context(|| format!("invalid address '{}'", s))
}

fn open_wallets(config: &Config) -> Result<Wallets> {
    let storage = BlockchainStorage::new(&config.data_dir)
        .with_context(|| format!("failed to open store at {}", config.data_dir.display()))?;
    Ok(Wallets::open(Arc::new(storage))?)
}

fn open_ledger(config: &Config) -> Result<Ledger> {
    Ledger::open(config)
        .with_context(|| format!("failed to open ledger at {}", config.data_dir.display()))
}

/// Executes one command against the store selected by `cli`
///
/// Raising `cancel` aborts any mining the command performs.
pub fn run(cli: Cli, cancel: Arc<AtomicBool>) -> Result<()> {
    let mut config = Config {
        cancel,
        ..cli.config()
    };
    debug!("Running {:?} with {:?}", cli.command, config);

    match cli.command {
        Command::CreateWallet => {
            let mut wallets = open_wallets(&config)?;
            let address = wallets.create()?;
            println!("Your new address: {}", address);
        }
        Command::ListAddresses => {
            let wallets = open_wallets(&config)?;
            for address in wallets.addresses() {
                println!("{}", address);
            }
        }
        Command::CreateBlockchain { address } => {
            config.genesis_address = Some(parse_address(&address)?);
            let ledger = open_ledger(&config)?;
            println!("Done! Tip is {}", hex::encode(ledger.chain().tip()));
        }
        Command::PrintChain => {
            let ledger = open_ledger(&config)?;
            for block in ledger.chain().iter() {
                let block = block.context("failed to read block")?;
                let timestamp = DateTime::from_timestamp(block.timestamp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| block.timestamp.to_string());

                println!("============ Block {} ============", hex::encode(block.hash));
                match block.previous_hash {
                    Some(previous) => println!("Prev. block: {}", hex::encode(previous)),
                    None => println!("Prev. block: none"),
                }
                println!("Timestamp: {}", timestamp);
                println!("Difficulty: {}", block.difficulty);
                println!("Nonce: {}", block.nonce);
                println!("PoW: {}", block.validate());
                if block.is_genesis() {
                    println!("(genesis)");
                }
                for tx in &block.transactions {
                    println!("{}", tx);
                }
                println!();
            }
        }
        Command::Send {
            from,
            to,
            amount,
            miner,
        } => {
            let from = parse_address(&from)?;
            let to = parse_address(&to)?;
            let miner = miner.as_deref().map(parse_address).transpose()?;

            let mut ledger = open_ledger(&config)?;
            let block = ledger
                .send(&from, &to, amount, miner.as_ref())
                .context("send failed")?;
            println!("Success! Block {}", hex::encode(block.hash));
        }
        Command::GetBalance { address } => {
            let address = parse_address(&address)?;
            let ledger = open_ledger(&config)?;
            println!("Balance of '{}': {}", address, ledger.balance(&address)?);
        }
        Command::PrintUtxoSet => {
            let ledger = open_ledger(&config)?;
            let utxo = ledger.utxo();
            if utxo.is_empty() {
                println!("UTXO set is empty");
            }
            for owner in utxo.owners() {
                println!("==== {}", Address::from_pub_key_hash(owner));
                for entry in utxo.utxos(owner) {
                    println!(
                        "  {}:{} value {}",
                        hex::encode(entry.tx_id),
                        entry.index,
                        entry.output.value
                    );
                }
            }
            println!("{} unspent outputs", utxo.len());
        }
        Command::ReindexUtxo => {
            let mut ledger = open_ledger(&config)?;
            ledger.reindex()?;
            println!(
                "Done! There are {} unspent outputs in the UTXO set.",
                ledger.utxo().len()
            );
        }
        Command::ValidateChain => {
            let ledger = open_ledger(&config)?;
            if !ledger.chain().validate_chain()? {
                bail!("chain validation failed");
            }
            println!("Chain is valid");
        }
    }

    Ok(())
}
