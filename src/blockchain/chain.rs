use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use super::block::Block;
use super::crypto::{CryptoError, Hash};
use super::pow::PowError;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Transaction, TransactionError};
use crate::config::Config;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Proof of work error: {0}")]
    PowError(#[from] PowError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("No chain exists yet and no genesis address was given")]
    MissingGenesisAddress,
}

/// The append-only chain of blocks, addressed through its tip
#[derive(Debug)]
pub struct Blockchain {
    /// Storage for blockchain data
    storage: Arc<BlockchainStorage>,

    /// Hash of the most recently appended block
    tip: Hash,

    /// Difficulty for newly mined blocks (leading zero bits)
    difficulty: u32,

    /// Nonce ceiling for mining
    max_nonce: u64,

    /// Raised to abort an in-progress mining run
    cancel: Arc<AtomicBool>,
}

impl Blockchain {
    /// Opens the chain held in `storage`
    ///
    /// If the store has no tip yet, a genesis block paying the block reward
    /// to `config.genesis_address` is mined and persisted first.
    ///
    /// Mining polls `config.cancel`, so raising it aborts the genesis run
    /// as well as any later `mine_block`.
    pub fn open(storage: Arc<BlockchainStorage>, config: &Config) -> Result<Self, BlockchainError> {
        let cancel = config.cancel.clone();

        let tip = match storage.get_tip()? {
            Some(tip) => {
                info!("Loaded chain with tip {}", hex::encode(tip));
                tip
            }
            None => {
                let address = config
                    .genesis_address
                    .as_ref()
                    .ok_or(BlockchainError::MissingGenesisAddress)?;
                let coinbase =
                    Transaction::new_coinbase(address.pub_key_hash()?, config.block_reward);

                info!("No existing chain found in storage, mining genesis block");
                let genesis = Block::mine(
                    vec![coinbase],
                    None,
                    config.genesis_difficulty,
                    config.max_nonce,
                    &cancel,
                )?;
                storage.append_block(&genesis)?;
                info!("Created genesis block {}", hex::encode(genesis.hash));
                genesis.hash
            }
        };

        Ok(Blockchain {
            storage,
            tip,
            difficulty: config.difficulty,
            max_nonce: config.max_nonce,
            cancel,
        })
    }

    pub fn tip(&self) -> Hash {
        self.tip
    }

    pub fn storage(&self) -> &Arc<BlockchainStorage> {
        &self.storage
    }

    /// Verifies the transactions, mines a block on top of the tip and appends it
    ///
    /// The tip only moves once the block, its transactions and the new tip
    /// marker have been written together. Any failure leaves the chain as
    /// it was.
    ///
    /// # Returns
    ///
    /// The appended block, so the caller can feed it to the UTXO index
    pub fn mine_block(&mut self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        for tx in &transactions {
            if !tx.verify(self)? {
                warn!("Rejecting block: transaction {} failed verification", hex::encode(tx.id));
                return Err(TransactionError::InvalidSignature.into());
            }
        }

        let block = match Block::mine(
            transactions,
            Some(self.tip),
            self.difficulty,
            self.max_nonce,
            &self.cancel,
        ) {
            Ok(block) => block,
            Err(PowError::Cancelled) => {
                // Consume the request so the next run starts clean
                self.cancel.store(false, Ordering::Relaxed);
                return Err(PowError::Cancelled.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.storage.append_block(&block)?;
        self.tip = block.hash;
        info!(
            "Appended block {} with {} transactions",
            hex::encode(block.hash),
            block.transactions.len()
        );

        Ok(block)
    }

    /// Iterates from the tip back to genesis
    pub fn iter(&self) -> BlockchainIterator<'_> {
        BlockchainIterator {
            storage: &self.storage,
            current: Some(self.tip),
        }
    }

    /// Finds a transaction by id
    ///
    /// The transaction index written alongside each block is consulted
    /// first; a full scan of the chain is the fallback.
    pub fn find_transaction(&self, id: &Hash) -> Result<Option<Transaction>, StorageError> {
        if let Some(tx) = self.storage.get_transaction(id)? {
            return Ok(Some(tx));
        }

        for block in self.iter() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| &tx.id == id) {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    /// Validates the blockchain
    ///
    /// # Returns
    ///
    /// true if every block satisfies its proof of work and links to its
    /// predecessor, false otherwise
    pub fn validate_chain(&self) -> Result<bool, BlockchainError> {
        let mut expected = Some(self.tip);

        for block in self.iter() {
            let block = block?;

            if Some(block.hash) != expected {
                warn!("Block {} is stored under a different hash", hex::encode(block.hash));
                return Ok(false);
            }
            if !block.validate() {
                warn!("Block {} fails proof of work", hex::encode(block.hash));
                return Ok(false);
            }
            expected = block.previous_hash;
        }

        Ok(true)
    }
}

/// Walks the chain from a starting hash back to genesis
///
/// Each call to [`Blockchain::iter`] starts a fresh walk from the current tip.
pub struct BlockchainIterator<'a> {
    storage: &'a BlockchainStorage,
    current: Option<Hash>,
}

impl<'a> Iterator for BlockchainIterator<'a> {
    type Item = Result<Block, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current.take()?;
        match self.storage.get_block(&hash) {
            Ok(block) => {
                // Genesis has no predecessor, which ends the walk
                self.current = block.previous_hash;
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
