use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::chain::Blockchain;
use super::crypto::{
    hash_pub_key, sha256, verify_signature, Address, CryptoError, Hash, PubKeyHash, Wallet,
};
use super::storage::StorageError;
use super::utxo::UtxoSet;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Unresolved input: output {index} of transaction {tx_id}")]
    UnresolvedInput { tx_id: String, index: u32 },

    #[error("Double spend: output {index} of transaction {tx_id} is not spendable")]
    DoubleSpend { tx_id: String, index: u32 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("No wallet for address {0}")]
    UnknownWallet(Address),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// A claim on one specific output of an earlier transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub referenced_tx_id: Hash,
    pub referenced_output_index: u32,
    /// Empty until the transaction is signed
    pub signature: Vec<u8>,
    /// Raw public key of the spender
    pub public_key: Vec<u8>,
}

/// Value locked to the owner of a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: PubKeyHash,
}

impl TxOutput {
    pub fn is_locked_with(&self, pub_key_hash: &PubKeyHash) -> bool {
        &self.pub_key_hash == pub_key_hash
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hash of the inputs (without signatures) and outputs
    pub id: Hash,

    pub inputs: Vec<TxInput>,

    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates an unsigned transaction and derives its id from its contents
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Transaction {
            id: [0u8; 32],
            inputs,
            outputs,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Creates a new coinbase transaction (block reward)
    ///
    /// The id also covers a random tag so that two rewards of the same
    /// value to the same owner never share an id.
    pub fn new_coinbase(to: PubKeyHash, reward: u64) -> Self {
        let mut tx = Transaction {
            id: [0u8; 32],
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                value: reward,
                pub_key_hash: to,
            }],
        };

        let tag: [u8; 32] = rand::random();
        let mut content = tx.content_bytes();
        content.extend_from_slice(&tag);
        tx.id = sha256(&content);
        tx
    }

    /// Builds an unsigned transfer from the sender's unspent outputs
    ///
    /// Outputs are taken first-fit in index order until their sum covers
    /// `amount`. A change output back to the sender is added only when the
    /// selected sum exceeds `amount`.
    pub fn new_transfer(
        from: &Wallet,
        to: &PubKeyHash,
        amount: u64,
        utxo_set: &UtxoSet,
    ) -> Result<Self, TransactionError> {
        if amount == 0 {
            return Err(TransactionError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        let sender = from.pub_key_hash();
        let (accumulated, selected) = utxo_set.find_spendable_outputs(&sender, amount);
        if accumulated < amount {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let public_key = from.public_key();
        let inputs = selected
            .into_iter()
            .map(|utxo| TxInput {
                referenced_tx_id: utxo.tx_id,
                referenced_output_index: utxo.index,
                signature: Vec::new(),
                public_key: public_key.clone(),
            })
            .collect();

        let mut outputs = vec![TxOutput {
            value: amount,
            pub_key_hash: *to,
        }];
        if accumulated > amount {
            outputs.push(TxOutput {
                value: accumulated - amount,
                pub_key_hash: sender,
            });
        }

        Ok(Transaction::new(inputs, outputs))
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sum of all output values
    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|out| out.value).sum()
    }

    /// Deterministic encoding of inputs (signatures excluded) and outputs
    fn content_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            data.extend_from_slice(&input.referenced_tx_id);
            data.extend_from_slice(&input.referenced_output_index.to_be_bytes());
            data.extend_from_slice(&(input.public_key.len() as u32).to_be_bytes());
            data.extend_from_slice(&input.public_key);
        }
        data.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_be_bytes());
            data.extend_from_slice(&output.pub_key_hash);
        }
        data
    }

    /// Content hash identifying a non-coinbase transaction
    pub fn compute_id(&self) -> Hash {
        sha256(&self.content_bytes())
    }

    /// Digest signed for one input: the spent outpoint, its owner, and
    /// every output this transaction produces
    fn signed_digest(&self, input: &TxInput, spent: &TxOutput) -> Hash {
        let mut content = Vec::new();
        content.extend_from_slice(&input.referenced_tx_id);
        content.extend_from_slice(&input.referenced_output_index.to_be_bytes());
        content.extend_from_slice(&spent.pub_key_hash);
        for output in &self.outputs {
            content.extend_from_slice(&output.pub_key_hash);
            content.extend_from_slice(&output.value.to_be_bytes());
        }
        sha256(&content)
    }

    /// Locates the output an input spends by looking up its transaction in the ledger
    fn resolve_input(
        &self,
        input: &TxInput,
        chain: &Blockchain,
    ) -> Result<TxOutput, TransactionError> {
        let unresolved = || TransactionError::UnresolvedInput {
            tx_id: hex::encode(input.referenced_tx_id),
            index: input.referenced_output_index,
        };

        let previous = chain
            .find_transaction(&input.referenced_tx_id)?
            .ok_or_else(unresolved)?;

        previous
            .outputs
            .get(input.referenced_output_index as usize)
            .cloned()
            .ok_or_else(unresolved)
    }

    /// Signs every input with the wallet's private key
    ///
    /// Coinbase transactions are left untouched.
    pub fn sign(&mut self, wallet: &Wallet, chain: &Blockchain) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut signatures = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let spent = self.resolve_input(input, chain)?;
            let digest = self.signed_digest(input, &spent);
            signatures.push(wallet.sign(&digest));
        }

        for (input, signature) in self.inputs.iter_mut().zip(signatures) {
            input.signature = signature;
        }

        Ok(())
    }

    /// Verifies every input's signature against the outputs it spends
    ///
    /// # Returns
    ///
    /// `Ok(true)` if every input is authorized, `Ok(false)` if any input
    /// fails, and `UnresolvedInput` if a spent output cannot be found
    pub fn verify(&self, chain: &Blockchain) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        if self.id != self.compute_id() {
            warn!("Transaction {} does not match its contents", hex::encode(self.id));
            return Ok(false);
        }

        for input in &self.inputs {
            let spent = self.resolve_input(input, chain)?;

            if !spent.is_locked_with(&hash_pub_key(&input.public_key)) {
                warn!(
                    "Input {}:{} of {} is not owned by its public key",
                    hex::encode(input.referenced_tx_id),
                    input.referenced_output_index,
                    hex::encode(self.id)
                );
                return Ok(false);
            }

            let digest = self.signed_digest(input, &spent);
            match verify_signature(&digest, &input.signature, &input.public_key) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(
                        "Bad signature on input {}:{} of {}",
                        hex::encode(input.referenced_tx_id),
                        input.referenced_output_index,
                        hex::encode(self.id)
                    );
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "--- Transaction {} (total out {}):",
            hex::encode(self.id),
            self.output_value()
        )?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TXID:      {}", hex::encode(input.referenced_tx_id))?;
            writeln!(f, "       Out:       {}", input.referenced_output_index)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.public_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:  {}", output.value)?;
            write!(f, "       Script: {}", Address::from_pub_key_hash(&output.pub_key_hash))?;
            if i + 1 < self.outputs.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::storage::BlockchainStorage;
    use crate::blockchain::utxo::UtxoSet;
    use crate::config::Config;
    use std::sync::Arc;

    fn funded_chain(owner: &Wallet) -> Blockchain {
        let storage = Arc::new(BlockchainStorage::temporary().unwrap());
        let config = Config {
            genesis_address: Some(owner.address().clone()),
            ..Config::for_tests()
        };
        Blockchain::open(storage, &config).unwrap()
    }

    fn signed_transfer(chain: &Blockchain, from: &Wallet, to: &Wallet, amount: u64) -> Transaction {
        let utxo = UtxoSet::rebuild(chain).unwrap();
        let mut tx = Transaction::new_transfer(from, &to.pub_key_hash(), amount, &utxo).unwrap();
        tx.sign(from, chain).unwrap();
        tx
    }

    /// A block holding one transaction that pays `owner` each of `values`
    fn index_with(owner: &Wallet, values: &[u64]) -> UtxoSet {
        let outputs = values
            .iter()
            .map(|value| TxOutput {
                value: *value,
                pub_key_hash: owner.pub_key_hash(),
            })
            .collect();
        let funding = Transaction::new(Vec::new(), outputs);
        let block = crate::blockchain::block::Block {
            timestamp: 0,
            transactions: vec![funding],
            previous_hash: None,
            hash: [0u8; 32],
            difficulty: 1,
            nonce: 0,
        };

        let mut utxo = UtxoSet::new();
        utxo.apply_block(&block);
        utxo
    }

    #[test]
    fn test_coinbase_transaction() {
        let miner = Wallet::new();
        let tx = Transaction::new_coinbase(miner.pub_key_hash(), 20);

        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert!(tx.outputs[0].is_locked_with(&miner.pub_key_hash()));
        assert_eq!(tx.output_value(), 20);

        let again = Transaction::new_coinbase(miner.pub_key_hash(), 20);
        assert_ne!(tx.id, again.id);
    }

    #[test]
    fn test_coinbase_always_verifies() {
        let owner = Wallet::new();
        let chain = funded_chain(&owner);

        let tx = Transaction::new_coinbase(owner.pub_key_hash(), 20);
        assert!(tx.verify(&chain).unwrap());
    }

    #[test]
    fn test_content_derived_id() {
        let a = Transaction::new(
            Vec::new(),
            vec![TxOutput {
                value: 1,
                pub_key_hash: [1u8; 20],
            }],
        );
        let b = Transaction::new(a.inputs.clone(), a.outputs.clone());
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, a.compute_id());
    }

    #[test]
    fn test_first_fit_selection_with_change() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let utxo = index_with(&alice, &[20, 15]);

        let tx = Transaction::new_transfer(&alice, &bob.pub_key_hash(), 30, &utxo).unwrap();

        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.inputs[0].referenced_output_index, 0);
        assert_eq!(tx.inputs[1].referenced_output_index, 1);
        assert_eq!(
            tx.outputs,
            vec![
                TxOutput {
                    value: 30,
                    pub_key_hash: bob.pub_key_hash()
                },
                TxOutput {
                    value: 5,
                    pub_key_hash: alice.pub_key_hash()
                },
            ]
        );
    }

    #[test]
    fn test_first_fit_stops_early_and_exact_change() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let utxo = index_with(&alice, &[20, 15]);

        let tx = Transaction::new_transfer(&alice, &bob.pub_key_hash(), 20, &utxo).unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, 20);
    }

    #[test]
    fn test_insufficient_funds() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let utxo = index_with(&alice, &[20, 5]);

        let result = Transaction::new_transfer(&alice, &bob.pub_key_hash(), 30, &utxo);
        assert!(matches!(
            result,
            Err(TransactionError::InsufficientFunds {
                required: 30,
                available: 25
            })
        ));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let alice = Wallet::new();
        let utxo = index_with(&alice, &[20]);
        let result = Transaction::new_transfer(&alice, &[0u8; 20], 0, &utxo);
        assert!(matches!(result, Err(TransactionError::InvalidAmount(_))));
    }

    #[test]
    fn test_sign_then_verify() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let chain = funded_chain(&alice);

        let tx = signed_transfer(&chain, &alice, &bob, 5);
        assert!(tx.inputs.iter().all(|input| !input.signature.is_empty()));
        assert!(tx.verify(&chain).unwrap());
    }

    #[test]
    fn test_mutated_output_value_fails_verification() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let chain = funded_chain(&alice);

        let mut tx = signed_transfer(&chain, &alice, &bob, 5);
        tx.outputs[0].value = 15;
        assert!(!tx.verify(&chain).unwrap());

        // Re-deriving the id does not help: the signature still covers the old amounts
        tx.id = tx.compute_id();
        assert!(!tx.verify(&chain).unwrap());
    }

    #[test]
    fn test_mutated_input_index_fails_verification() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let chain = funded_chain(&alice);

        let mut tx = signed_transfer(&chain, &alice, &bob, 5);
        tx.inputs[0].referenced_output_index = 1;
        assert!(!matches!(tx.verify(&chain), Ok(true)));

        tx.id = tx.compute_id();
        assert!(matches!(
            tx.verify(&chain),
            Err(TransactionError::UnresolvedInput { index: 1, .. })
        ));
    }

    #[test]
    fn test_swapped_to_sibling_output_fails_signature() {
        let alice = Wallet::new();
        let mut chain = funded_chain(&alice);

        // Paying herself leaves alice two outputs of one transaction
        let split = signed_transfer(&chain, &alice, &alice, 5);
        assert_eq!(split.outputs.len(), 2);
        chain.mine_block(vec![split.clone()]).unwrap();

        let mut tx = signed_transfer(&chain, &alice, &alice, 3);
        assert_eq!(tx.inputs.len(), 1);
        assert!(tx.verify(&chain).unwrap());

        let input = &mut tx.inputs[0];
        assert_eq!(input.referenced_tx_id, split.id);
        input.referenced_output_index = 1 - input.referenced_output_index;
        tx.id = tx.compute_id();

        // The sibling resolves and is owned by the same key, but the
        // signature covers the original index
        assert!(matches!(tx.verify(&chain), Ok(false)));
    }

    #[test]
    fn test_foreign_key_cannot_spend() {
        let alice = Wallet::new();
        let mallory = Wallet::new();
        let chain = funded_chain(&alice);

        let utxo = UtxoSet::rebuild(&chain).unwrap();
        let mut tx =
            Transaction::new_transfer(&alice, &mallory.pub_key_hash(), 5, &utxo).unwrap();
        // Swap in mallory's key and signature
        for input in &mut tx.inputs {
            input.public_key = mallory.public_key();
        }
        tx.id = tx.compute_id();
        tx.sign(&mallory, &chain).unwrap();

        assert!(!tx.verify(&chain).unwrap());
    }

    #[test]
    fn test_unknown_reference_is_unresolved() {
        let alice = Wallet::new();
        let chain = funded_chain(&alice);

        let mut tx = Transaction::new(
            vec![TxInput {
                referenced_tx_id: [0xEE; 32],
                referenced_output_index: 0,
                signature: Vec::new(),
                public_key: alice.public_key(),
            }],
            vec![TxOutput {
                value: 1,
                pub_key_hash: alice.pub_key_hash(),
            }],
        );

        assert!(matches!(
            tx.sign(&alice, &chain),
            Err(TransactionError::UnresolvedInput { .. })
        ));
        assert!(matches!(
            tx.verify(&chain),
            Err(TransactionError::UnresolvedInput { .. })
        ));
    }
}
