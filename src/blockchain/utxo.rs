use std::collections::{BTreeMap, HashMap, HashSet};

use log::{info, warn};

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::crypto::{hash_pub_key, Hash, PubKeyHash};
use super::storage::{BlockchainStorage, StorageError, UtxoBucket};
use super::transaction::{Transaction, TransactionError, TxOutput};

/// Identifies one output of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub tx_id: Hash,
    pub index: u32,
}

/// One currently-unspent output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub tx_id: Hash,
    pub index: u32,
    pub output: TxOutput,
}

/// Owner -> unspent outputs, derived from the chain
///
/// Ordered maps make iteration order (and thus coin selection) a function
/// of the set's contents alone, so a rebuilt index and an incrementally
/// maintained one compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    index: BTreeMap<PubKeyHash, BTreeMap<OutPoint, TxOutput>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index by walking the whole chain from tip to genesis
    pub fn rebuild(chain: &Blockchain) -> Result<Self, StorageError> {
        let mut set = UtxoSet::new();
        // Spent markers for the whole walk, keyed by the spent transaction's id
        let mut spent: HashMap<Hash, HashSet<u32>> = HashMap::new();
        let mut blocks = 0usize;

        for block in chain.iter() {
            let block = block?;
            blocks += 1;

            // Newest first within the block too, so a spend is seen before its source
            for tx in block.transactions.iter().rev() {
                for input in &tx.inputs {
                    spent
                        .entry(input.referenced_tx_id)
                        .or_default()
                        .insert(input.referenced_output_index);
                }

                let spent_here = spent.get(&tx.id);
                for (index, output) in tx.outputs.iter().enumerate() {
                    let index = index as u32;
                    if spent_here.map_or(false, |s| s.contains(&index)) {
                        continue;
                    }
                    set.insert(tx.id, index, output.clone());
                }
            }
        }

        info!("Rebuilt UTXO set from {} blocks: {} unspent outputs", blocks, set.len());
        Ok(set)
    }

    fn insert(&mut self, tx_id: Hash, index: u32, output: TxOutput) {
        self.index
            .entry(output.pub_key_hash)
            .or_default()
            .insert(OutPoint { tx_id, index }, output);
    }

    /// Removes an outpoint, looking under `owner_hint` first
    fn remove(&mut self, outpoint: &OutPoint, owner_hint: &PubKeyHash) -> bool {
        let owner = if self
            .index
            .get(owner_hint)
            .map_or(false, |outputs| outputs.contains_key(outpoint))
        {
            Some(*owner_hint)
        } else {
            self.index
                .iter()
                .find(|(_, outputs)| outputs.contains_key(outpoint))
                .map(|(owner, _)| *owner)
        };

        let Some(owner) = owner else {
            return false;
        };

        if let Some(outputs) = self.index.get_mut(&owner) {
            outputs.remove(outpoint);
            if outputs.is_empty() {
                self.index.remove(&owner);
            }
        }
        true
    }

    /// Applies one newly appended block: spends its inputs, adds its outputs
    pub fn apply_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            for input in &tx.inputs {
                let outpoint = OutPoint {
                    tx_id: input.referenced_tx_id,
                    index: input.referenced_output_index,
                };
                if !self.remove(&outpoint, &hash_pub_key(&input.public_key)) {
                    warn!(
                        "Block {} spends unknown output {}:{}",
                        hex::encode(block.hash),
                        hex::encode(outpoint.tx_id),
                        outpoint.index
                    );
                }
            }

            for (index, output) in tx.outputs.iter().enumerate() {
                self.insert(tx.id, index as u32, output.clone());
            }
        }
    }

    /// Accumulates the owner's outputs in index order until `amount` is covered
    ///
    /// # Returns
    ///
    /// The accumulated value and the outputs taken. If the owner cannot
    /// cover `amount`, the value is their full balance.
    pub fn find_spendable_outputs(&self, owner: &PubKeyHash, amount: u64) -> (u64, Vec<Utxo>) {
        let mut accumulated = 0u64;
        let mut selected = Vec::new();

        if let Some(outputs) = self.index.get(owner) {
            for (outpoint, output) in outputs {
                if accumulated >= amount {
                    break;
                }
                accumulated += output.value;
                selected.push(Utxo {
                    tx_id: outpoint.tx_id,
                    index: outpoint.index,
                    output: output.clone(),
                });
            }
        }

        (accumulated, selected)
    }

    /// Sum of the owner's unspent values; zero for an unknown owner
    pub fn balance(&self, owner: &PubKeyHash) -> u64 {
        self.index
            .get(owner)
            .map_or(0, |outputs| outputs.values().map(|out| out.value).sum())
    }

    pub fn utxos(&self, owner: &PubKeyHash) -> Vec<Utxo> {
        self.index
            .get(owner)
            .map(|outputs| {
                outputs
                    .iter()
                    .map(|(outpoint, output)| Utxo {
                        tx_id: outpoint.tx_id,
                        index: outpoint.index,
                        output: output.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn owners(&self) -> impl Iterator<Item = &PubKeyHash> {
        self.index.keys()
    }

    /// Total number of unspent outputs
    pub fn len(&self) -> usize {
        self.index.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.index.values().any(|outputs| outputs.contains_key(outpoint))
    }

    /// Rejects a transaction whose inputs are not all currently unspent and distinct
    pub fn check_inputs(&self, tx: &Transaction) -> Result<(), TransactionError> {
        let mut claimed = HashSet::new();
        for input in &tx.inputs {
            let outpoint = OutPoint {
                tx_id: input.referenced_tx_id,
                index: input.referenced_output_index,
            };
            if !claimed.insert(outpoint) || !self.is_unspent(&outpoint) {
                return Err(TransactionError::DoubleSpend {
                    tx_id: hex::encode(outpoint.tx_id),
                    index: outpoint.index,
                });
            }
        }
        Ok(())
    }

    /// Writes the whole index as a fresh snapshot, tagged with the chain tip it reflects
    pub fn persist(&self, storage: &BlockchainStorage, tip: &Hash) -> Result<(), StorageError> {
        let mut buckets: BTreeMap<Hash, UtxoBucket> = BTreeMap::new();
        for outputs in self.index.values() {
            for (outpoint, output) in outputs {
                buckets
                    .entry(outpoint.tx_id)
                    .or_default()
                    .push((outpoint.index, output.clone()));
            }
        }

        storage.save_utxo_snapshot(&buckets, tip)?;
        info!("Persisted UTXO snapshot at tip {}", hex::encode(tip));
        Ok(())
    }

    /// Loads the persisted snapshot and the tip it was taken at
    pub fn load(storage: &BlockchainStorage) -> Result<Option<(Self, Hash)>, StorageError> {
        let Some((tip, buckets)) = storage.load_utxo_snapshot()? else {
            return Ok(None);
        };

        let mut set = UtxoSet::new();
        for (tx_id, bucket) in buckets {
            for (index, output) in bucket {
                set.insert(tx_id, index, output);
            }
        }
        Ok(Some((set, tip)))
    }

    /// Loads the snapshot if it reflects the chain's current tip, otherwise
    /// rebuilds from the chain and persists the result
    pub fn open(chain: &Blockchain) -> Result<Self, BlockchainError> {
        let tip = chain.tip();
        match Self::load(chain.storage())? {
            Some((set, snapshot_tip)) if snapshot_tip == tip => {
                info!("Loaded UTXO snapshot with {} unspent outputs", set.len());
                Ok(set)
            }
            Some(_) => {
                warn!("UTXO snapshot is stale, rebuilding from chain");
                Self::reindex(chain)
            }
            None => {
                info!("No UTXO snapshot found, building from chain");
                Self::reindex(chain)
            }
        }
    }

    /// Rebuilds from the chain and replaces the persisted snapshot
    pub fn reindex(chain: &Blockchain) -> Result<Self, BlockchainError> {
        let set = Self::rebuild(chain)?;
        set.persist(chain.storage(), &chain.tip())?;
        Ok(set)
    }
}
