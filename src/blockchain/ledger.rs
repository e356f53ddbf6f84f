use std::sync::Arc;

use log::{info, warn};

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::crypto::Address;
use super::storage::BlockchainStorage;
use super::transaction::{Transaction, TransactionError};
use super::utxo::UtxoSet;
use super::wallet::Wallets;
use crate::config::Config;

/// The chain, its UTXO index and the key store, kept consistent together
#[derive(Debug)]
pub struct Ledger {
    chain: Blockchain,
    utxo: UtxoSet,
    wallets: Wallets,
    block_reward: u64,
}

impl Ledger {
    /// Opens the store under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::new(&config.data_dir)?;
        Self::with_storage(Arc::new(storage), config)
    }

    /// Opens the chain in `storage`, creating genesis if needed, and brings
    /// the UTXO index in line with the chain tip
    pub fn with_storage(
        storage: Arc<BlockchainStorage>,
        config: &Config,
    ) -> Result<Self, BlockchainError> {
        let chain = Blockchain::open(storage.clone(), config)?;
        let utxo = UtxoSet::open(&chain)?;
        let wallets = Wallets::open(storage)?;

        Ok(Ledger {
            chain,
            utxo,
            wallets,
            block_reward: config.block_reward,
        })
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn utxo(&self) -> &UtxoSet {
        &self.utxo
    }

    /// Transfers `amount` from a local wallet to `to` in a newly mined block
    ///
    /// Addresses are decoded and the transfer built, signed and checked
    /// against the index before anything is written. If `miner` is given,
    /// the block also carries a coinbase reward for it.
    ///
    /// Once the block is appended the transfer has happened. A failure to
    /// persist the index snapshot after that point is logged rather than
    /// returned, since the next open rebuilds a stale snapshot.
    ///
    /// # Returns
    ///
    /// The appended block
    pub fn send(
        &mut self,
        from: &Address,
        to: &Address,
        amount: u64,
        miner: Option<&Address>,
    ) -> Result<Block, BlockchainError> {
        let recipient = to.pub_key_hash()?;
        let reward_to = miner.map(Address::pub_key_hash).transpose()?;
        let wallet = self
            .wallets
            .get(from)
            .ok_or_else(|| TransactionError::UnknownWallet(from.clone()))?;

        let mut tx = Transaction::new_transfer(wallet, &recipient, amount, &self.utxo)?;
        tx.sign(wallet, &self.chain)?;
        self.utxo.check_inputs(&tx)?;

        let mut transactions = vec![tx];
        if let Some(reward_to) = reward_to {
            transactions.push(Transaction::new_coinbase(reward_to, self.block_reward));
        }

        let block = self.chain.mine_block(transactions)?;
        self.utxo.apply_block(&block);
        if let Err(e) = self.utxo.persist(self.chain.storage(), &block.hash) {
            warn!(
                "Block {} appended but UTXO snapshot not saved: {}",
                hex::encode(block.hash),
                e
            );
        }

        info!("Sent {} from {} to {}", amount, from, to);
        Ok(block)
    }

    /// Balance of an address according to the UTXO index
    pub fn balance(&self, address: &Address) -> Result<u64, BlockchainError> {
        Ok(self.utxo.balance(&address.pub_key_hash()?))
    }

    /// Discards the index and rebuilds it from the chain
    pub fn reindex(&mut self) -> Result<(), BlockchainError> {
        self.utxo = UtxoSet::reindex(&self.chain)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::CryptoError;

    fn ledger_with_wallets() -> (Ledger, Address, Address) {
        let storage = Arc::new(BlockchainStorage::temporary().unwrap());

        // Wallets exist before the chain so genesis can pay one of them
        let mut wallets = Wallets::open(storage.clone()).unwrap();
        let alice = wallets.create().unwrap();
        let bob = wallets.create().unwrap();

        let config = Config {
            genesis_address: Some(alice.clone()),
            ..Config::for_tests()
        };
        let ledger = Ledger::with_storage(storage, &config).unwrap();
        (ledger, alice, bob)
    }

    #[test]
    fn test_send_updates_balances() {
        let (mut ledger, alice, bob) = ledger_with_wallets();
        assert_eq!(ledger.balance(&alice).unwrap(), 20);

        let block = ledger.send(&alice, &bob, 8, None).unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(ledger.balance(&alice).unwrap(), 12);
        assert_eq!(ledger.balance(&bob).unwrap(), 8);
        assert_eq!(ledger.chain().tip(), block.hash);
    }

    #[test]
    fn test_send_with_miner_reward() {
        let (mut ledger, alice, bob) = ledger_with_wallets();

        let block = ledger.send(&alice, &bob, 5, Some(&bob)).unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[1].is_coinbase());
        assert_eq!(ledger.balance(&bob).unwrap(), 25);
    }

    #[test]
    fn test_insufficient_funds_leaves_state_untouched() {
        let (mut ledger, alice, bob) = ledger_with_wallets();
        let tip = ledger.chain().tip();

        let result = ledger.send(&alice, &bob, 21, None);
        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(
                TransactionError::InsufficientFunds {
                    required: 21,
                    available: 20
                }
            ))
        ));
        assert_eq!(ledger.chain().tip(), tip);
        assert_eq!(ledger.balance(&alice).unwrap(), 20);
    }

    #[test]
    fn test_malformed_address_rejected_before_any_change() {
        let (mut ledger, alice, _) = ledger_with_wallets();
        let tip = ledger.chain().tip();

        let bad = Address("1111111111".to_string());
        let result = ledger.send(&alice, &bad, 1, None);
        assert!(matches!(
            result,
            Err(BlockchainError::CryptoError(CryptoError::MalformedAddress(_)))
        ));
        assert_eq!(ledger.chain().tip(), tip);
        assert!(ledger.balance(&bad).is_err());
    }

    #[test]
    fn test_unknown_sender_wallet() {
        let (mut ledger, alice, _) = ledger_with_wallets();
        let stranger = crate::blockchain::crypto::Wallet::new();

        let result = ledger.send(stranger.address(), &alice, 1, None);
        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(TransactionError::UnknownWallet(_)))
        ));
    }

    #[test]
    fn test_reopen_restores_index_and_wallets() {
        let storage = Arc::new(BlockchainStorage::temporary().unwrap());
        let mut wallets = Wallets::open(storage.clone()).unwrap();
        let alice = wallets.create().unwrap();
        let bob = wallets.create().unwrap();
        drop(wallets);

        let config = Config {
            genesis_address: Some(alice.clone()),
            ..Config::for_tests()
        };
        let mut ledger = Ledger::with_storage(storage.clone(), &config).unwrap();
        ledger.send(&alice, &bob, 3, None).unwrap();
        ledger.send(&bob, &alice, 1, None).unwrap();
        let expected = ledger.utxo().clone();
        drop(ledger);

        let mut reopened = Ledger::with_storage(storage.clone(), &config).unwrap();
        assert_eq!(reopened.utxo(), &expected);
        assert_eq!(reopened.balance(&alice).unwrap(), 18);
        assert_eq!(reopened.balance(&bob).unwrap(), 2);
        assert_eq!(Wallets::open(storage).unwrap().addresses().len(), 2);

        reopened.reindex().unwrap();
        assert_eq!(reopened.utxo(), &expected);
        assert!(reopened.chain().validate_chain().unwrap());
    }

    #[test]
    fn test_block_appended_without_snapshot_is_recovered_on_open() {
        let storage = Arc::new(BlockchainStorage::temporary().unwrap());
        let mut wallets = Wallets::open(storage.clone()).unwrap();
        let alice = wallets.create().unwrap();
        let bob = wallets.create().unwrap();
        drop(wallets);

        let config = Config {
            genesis_address: Some(alice.clone()),
            ..Config::for_tests()
        };
        let mut ledger = Ledger::with_storage(storage.clone(), &config).unwrap();

        // Append and apply a block but stop before the snapshot is saved
        let sender = ledger.wallets.get(&alice).unwrap().clone();
        let mut tx = Transaction::new_transfer(
            &sender,
            &bob.pub_key_hash().unwrap(),
            4,
            &ledger.utxo,
        )
        .unwrap();
        tx.sign(&sender, &ledger.chain).unwrap();
        let block = ledger.chain.mine_block(vec![tx]).unwrap();
        ledger.utxo.apply_block(&block);
        let expected = ledger.utxo().clone();
        drop(ledger);

        let reopened = Ledger::with_storage(storage, &config).unwrap();
        assert_eq!(reopened.chain().tip(), block.hash);
        assert_eq!(reopened.utxo(), &expected);
        assert_eq!(reopened.balance(&alice).unwrap(), 16);
        assert_eq!(reopened.balance(&bob).unwrap(), 4);
    }
}
