use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info};
use thiserror::Error;

use super::block::Block;
use super::crypto::{sha256, Hash};

/// Upper bound on the nonce search for a single block
pub const MAX_NONCE: u64 = 9_999_999;

/// Errors that can occur while mining or checking proof of work
#[derive(Debug, Error)]
pub enum PowError {
    #[error("Mining exhausted: no valid nonce below {max_nonce}")]
    MiningExhausted { max_nonce: u64 },

    #[error("Mining cancelled")]
    Cancelled,

    #[error("Invalid difficulty {0}: must be between 1 and 255 bits")]
    InvalidDifficulty(u32),
}

/// Computes `2^(256 - difficulty)` as a big-endian 256-bit integer
pub fn target(difficulty: u32) -> Result<Hash, PowError> {
    if !(1..=255).contains(&difficulty) {
        return Err(PowError::InvalidDifficulty(difficulty));
    }

    let bit = 256 - difficulty as usize;
    let mut target = [0u8; 32];
    target[31 - bit / 8] = 1 << (bit % 8);
    Ok(target)
}

/// Proof-of-work puzzle bound to one block's contents
///
/// The transaction digest is computed once up front; each nonce attempt
/// only re-serializes the fixed-width header fields.
pub struct ProofOfWork {
    previous_hash: Option<Hash>,
    tx_digest: Hash,
    timestamp: i64,
    difficulty: u32,
    target: Hash,
}

impl ProofOfWork {
    pub fn new(block: &Block) -> Result<Self, PowError> {
        Ok(ProofOfWork {
            previous_hash: block.previous_hash,
            tx_digest: block.hash_transactions(),
            timestamp: block.timestamp,
            difficulty: block.difficulty,
            target: target(block.difficulty)?,
        })
    }

    /// Canonical pre-image: prev_hash ‖ tx_digest ‖ timestamp ‖ difficulty ‖ nonce
    pub fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 32 + 8 + 4 + 8);
        if let Some(previous) = &self.previous_hash {
            data.extend_from_slice(previous);
        }
        data.extend_from_slice(&self.tx_digest);
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(&self.difficulty.to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    /// Hash for `nonce`, and whether it falls strictly below the target
    fn attempt(&self, nonce: u64) -> (Hash, bool) {
        let hash = sha256(&self.prepare_data(nonce));
        // Lexicographic order on fixed-width big-endian arrays is numeric order
        let below = hash < self.target;
        (hash, below)
    }

    /// Searches nonces from 1 upward until one satisfies the target
    pub fn run(&self, max_nonce: u64, cancel: &AtomicBool) -> Result<(u64, Hash), PowError> {
        let started = Instant::now();
        debug!("Mining with difficulty {} bits", self.difficulty);

        for nonce in 1..=max_nonce {
            if cancel.load(Ordering::Relaxed) {
                info!("Mining cancelled after {} attempts", nonce - 1);
                return Err(PowError::Cancelled);
            }

            let (hash, below) = self.attempt(nonce);
            if below {
                info!(
                    "Mined nonce {} hash {} in {:?}",
                    nonce,
                    hex::encode(hash),
                    started.elapsed()
                );
                return Ok((nonce, hash));
            }
        }

        Err(PowError::MiningExhausted { max_nonce })
    }

    /// Recomputes the digest for the block's stored nonce and checks both
    /// that it equals the stored hash and that it beats the target
    pub fn validate(&self, block: &Block) -> bool {
        let (hash, below) = self.attempt(block.nonce);
        below && hash == block.hash
    }
}
