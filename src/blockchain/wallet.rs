use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::crypto::{Address, CryptoError, Wallet};
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::TransactionError;

/// Persisted form of a keypair
#[derive(Debug, Serialize, Deserialize)]
struct StoredWallet {
    /// PKCS#8 DER private key
    private_key: Vec<u8>,

    /// Raw public key bytes
    public_key: Vec<u8>,
}

/// Keypairs indexed by address, backed by the `wallets` tree
///
/// Passed explicitly to whoever needs to sign; there is no global registry.
#[derive(Debug)]
pub struct Wallets {
    storage: Arc<BlockchainStorage>,
    wallets: BTreeMap<Address, Wallet>,
}

impl Wallets {
    /// Loads every stored keypair
    ///
    /// Records that fail to decode, or whose public key does not match the
    /// private key, are skipped with a warning.
    pub fn open(storage: Arc<BlockchainStorage>) -> Result<Self, StorageError> {
        let mut wallets = BTreeMap::new();

        for (address, record) in storage.get_all_wallets()? {
            match Self::decode(&record) {
                Ok(wallet) if wallet.address().0 == address => {
                    wallets.insert(wallet.address().clone(), wallet);
                }
                Ok(_) => warn!("Wallet stored under {} holds a different key", address),
                Err(e) => warn!("Failed to load wallet {}: {}", address, e),
            }
        }

        info!("Loaded {} wallets", wallets.len());
        Ok(Wallets { storage, wallets })
    }

    fn decode(record: &[u8]) -> Result<Wallet, CryptoError> {
        let stored: StoredWallet = bincode::deserialize(record)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        let wallet = Wallet::from_pkcs8_der(&stored.private_key)?;

        if wallet.public_key() != stored.public_key {
            return Err(CryptoError::InvalidPublicKey(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(wallet)
    }

    /// Generates a keypair, persists it and returns its address
    pub fn create(&mut self) -> Result<Address, TransactionError> {
        let wallet = Wallet::new();
        let stored = StoredWallet {
            private_key: wallet.export_pkcs8_der()?,
            public_key: wallet.public_key(),
        };
        let record = bincode::serialize(&stored)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let address = wallet.address().clone();
        self.storage.save_wallet(&address.0, &record)?;
        self.wallets.insert(address.clone(), wallet);

        info!("Created wallet {}", address);
        Ok(address)
    }

    pub fn get(&self, address: &Address) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.wallets.keys().cloned().collect()
    }
}
