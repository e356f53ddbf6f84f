use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, warn};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::block::Block;
use super::crypto::Hash;
use super::transaction::{Transaction, TxOutput};

/// Reserved metadata key holding the chain tip hash
const TIP_KEY: &[u8] = b"l";

/// Reserved metadata key holding the tip the UTXO snapshot was taken at
const UTXO_TIP_KEY: &[u8] = b"utxo_tip";

/// Unspent outputs of one transaction, as persisted in the snapshot
pub type UtxoBucket = Vec<(u32, TxOutput)>;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Corrupted store: {0}")]
    Corrupted(String),
}

impl From<TransactionError<()>> for StorageError {
    fn from(err: TransactionError<()>) -> Self {
        match err {
            TransactionError::Storage(e) => StorageError::DatabaseError(e),
            TransactionError::Abort(()) => StorageError::Corrupted("write aborted".to_string()),
        }
    }
}

fn to_hash(bytes: &[u8]) -> Result<Hash, StorageError> {
    bytes
        .try_into()
        .map_err(|_| StorageError::Corrupted(format!("expected 32-byte key, got {}", bytes.len())))
}

/// Storage for ledger data
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Block hash -> serialized block
    blocks: Tree,

    /// Transaction id -> serialized transaction (lookup cache for verification)
    transactions: Tree,

    /// Tip pointers
    metadata: Tree,

    /// Transaction id -> serialized unspent outputs of that transaction
    utxos: Tree,

    /// Address -> serialized keypair
    wallets: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the store at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a store that is removed when dropped
    #[cfg(test)]
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let transactions = db.open_tree("transactions")?;
        let metadata = db.open_tree("metadata")?;
        let utxos = db.open_tree("utxos")?;
        let wallets = db.open_tree("wallets")?;

        Ok(Self {
            db,
            blocks,
            transactions,
            metadata,
            utxos,
            wallets,
        })
    }

    /// Gets the current tip hash, `None` for an empty store
    pub fn get_tip(&self) -> Result<Option<Hash>, StorageError> {
        match self.metadata.get(TIP_KEY)? {
            Some(value) => Ok(Some(to_hash(&value)?)),
            None => Ok(None),
        }
    }

    /// Writes a block, its transactions and the new tip as one atomic unit
    ///
    /// Either everything lands or nothing does; the previous tip stays
    /// intact on any failure. Once the transaction commits the block is
    /// part of the chain, so a failed flush afterwards is only logged.
    pub fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let encoded = block.serialize()?;
        let tx_entries = block
            .transactions
            .iter()
            .map(|tx| {
                bincode::serialize(tx)
                    .map(|bytes| (tx.id, bytes))
                    .map_err(|e| StorageError::SerializationError(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        (&self.blocks, &self.transactions, &self.metadata).transaction(|(blocks, txs, meta)| {
            blocks.insert(&block.hash[..], encoded.as_slice())?;
            for (id, bytes) in &tx_entries {
                txs.insert(&id[..], bytes.as_slice())?;
            }
            meta.insert(TIP_KEY, &block.hash[..])?;
            Ok::<(), ConflictableTransactionError<()>>(())
        })?;

        if let Err(e) = self.db.flush() {
            warn!("Block {} committed but flush failed: {}", hex::encode(block.hash), e);
        }
        debug!("Persisted block {}", hex::encode(block.hash));
        Ok(())
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &Hash) -> Result<Block, StorageError> {
        match self.blocks.get(hash)? {
            Some(value) => Block::deserialize(&value),
            None => Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hex::encode(hash)
            ))),
        }
    }

    /// Gets a transaction from the lookup cache
    pub fn get_transaction(&self, id: &Hash) -> Result<Option<Transaction>, StorageError> {
        match self.transactions.get(id)? {
            Some(value) => bincode::deserialize(&value)
                .map(Some)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    /// Replaces the whole UTXO snapshot and its tip marker in one atomic write
    pub fn save_utxo_snapshot(
        &self,
        buckets: &BTreeMap<Hash, UtxoBucket>,
        tip: &Hash,
    ) -> Result<(), StorageError> {
        let encoded = buckets
            .iter()
            .map(|(id, bucket)| {
                bincode::serialize(bucket)
                    .map(|bytes| (*id, bytes))
                    .map_err(|e| StorageError::SerializationError(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Keys from the previous snapshot that the new one does not overwrite
        let stale = self
            .utxos
            .iter()
            .keys()
            .filter_map(|key| match key {
                Ok(key) if to_hash(&key).map_or(true, |id| !buckets.contains_key(&id)) => {
                    Some(Ok(key))
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        (&self.utxos, &self.metadata).transaction(|(utxos, meta)| {
            for key in &stale {
                utxos.remove(key.clone())?;
            }
            for (id, bytes) in &encoded {
                utxos.insert(&id[..], bytes.as_slice())?;
            }
            meta.insert(UTXO_TIP_KEY, &tip[..])?;
            Ok::<(), ConflictableTransactionError<()>>(())
        })?;

        self.db.flush()?;
        Ok(())
    }

    /// Loads the UTXO snapshot and the tip it was taken at
    ///
    /// # Returns
    ///
    /// `None` if no snapshot has ever been written
    pub fn load_utxo_snapshot(
        &self,
    ) -> Result<Option<(Hash, Vec<(Hash, UtxoBucket)>)>, StorageError> {
        let tip = match self.metadata.get(UTXO_TIP_KEY)? {
            Some(value) => to_hash(&value)?,
            None => return Ok(None),
        };

        let mut buckets = Vec::new();
        for entry in self.utxos.iter() {
            let (key, value) = entry?;
            let bucket: UtxoBucket = bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
            buckets.push((to_hash(&key)?, bucket));
        }

        Ok(Some((tip, buckets)))
    }

    /// Saves a serialized keypair under its address
    pub fn save_wallet(&self, address: &str, record: &[u8]) -> Result<(), StorageError> {
        self.wallets.insert(address.as_bytes(), record)?;
        self.db.flush()?;
        Ok(())
    }

    /// Gets all stored keypairs, skipping entries whose key is not valid UTF-8
    pub fn get_all_wallets(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut records = Vec::new();
        for entry in self.wallets.iter() {
            let (key, value) = entry?;
            match String::from_utf8(key.to_vec()) {
                Ok(address) => records.push((address, value.to_vec())),
                Err(e) => warn!("Skipping wallet with invalid address key: {}", e),
            }
        }
        Ok(records)
    }
}
