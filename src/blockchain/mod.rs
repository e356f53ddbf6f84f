// Blockchain module
//
// This module contains the ledger core:
// - Cryptography utilities and wallet keys
// - Proof of work
// - Block and transaction structures
// - The chain store and its UTXO index

pub mod block;
pub mod chain;
pub mod crypto;
pub mod ledger;
pub mod pow;
pub mod storage;
pub mod transaction;
pub mod utxo;
pub mod wallet;

// Re-export the entry point for easier access
pub use ledger::Ledger;
