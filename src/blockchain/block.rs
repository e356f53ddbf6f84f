use std::sync::atomic::AtomicBool;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::crypto::{sha256, Hash};
use super::pow::{PowError, ProofOfWork};
use super::storage::StorageError;
use super::transaction::Transaction;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Seconds since the Unix epoch when the block was assembled
    pub timestamp: i64,

    /// Transactions in the block; order is part of the hashed pre-image
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block, `None` for genesis
    pub previous_hash: Option<Hash>,

    /// Hash of this block (found by mining)
    pub hash: Hash,

    /// Required number of leading zero bits in `hash`
    pub difficulty: u32,

    /// Nonce found by mining
    pub nonce: u64,
}

impl Block {
    /// Assembles a block and mines it
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include in the block
    /// * `previous_hash` - The hash of the previous block, `None` for genesis
    /// * `difficulty` - Leading zero bits required of the block hash
    /// * `max_nonce` - Nonce ceiling after which mining fails
    /// * `cancel` - Flag polled between attempts to abort mining
    ///
    /// # Returns
    ///
    /// The mined block, or the reason mining stopped
    pub fn mine(
        transactions: Vec<Transaction>,
        previous_hash: Option<Hash>,
        difficulty: u32,
        max_nonce: u64,
        cancel: &AtomicBool,
    ) -> Result<Self, PowError> {
        let mut block = Block {
            timestamp: Utc::now().timestamp(),
            transactions,
            previous_hash,
            hash: [0u8; 32],
            difficulty,
            nonce: 0,
        };

        let pow = ProofOfWork::new(&block)?;
        let (nonce, hash) = pow.run(max_nonce, cancel)?;
        block.nonce = nonce;
        block.hash = hash;

        Ok(block)
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_none()
    }

    /// Merkle root over the transaction ids, in block order
    pub fn hash_transactions(&self) -> Hash {
        let mut level: Vec<Hash> = self.transactions.iter().map(|tx| tx.id).collect();
        if level.is_empty() {
            return sha256(&[]);
        }

        while level.len() > 1 {
            if level.len() % 2 == 1 {
                if let Some(last) = level.last().copied() {
                    level.push(last);
                }
            }
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut joined = [0u8; 64];
                    joined[..32].copy_from_slice(&pair[0]);
                    joined[32..].copy_from_slice(&pair[1]);
                    sha256(&joined)
                })
                .collect();
        }

        level[0]
    }

    /// Checks the stored hash against the block contents and the difficulty target
    pub fn validate(&self) -> bool {
        match ProofOfWork::new(self) {
            Ok(pow) => pow.validate(self),
            Err(_) => false,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(self).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
        bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
    }
}
