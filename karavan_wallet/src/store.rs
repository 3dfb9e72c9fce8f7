use crate::clients::LastUnused;
use crate::derive::{DerivedScript, ScriptCache};
use crate::descriptor::{Chain, WalletDescriptor};
use crate::model::{Balance, Height, Timestamp, Tip, TransactionRecord, Utxo};
use crate::update::Update;
use crate::{Error, Network};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, ScriptBuf, Transaction, Txid};
use fxhash::FxHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hasher;

/// Everything the wallet knows about the blockchain
///
/// It is fully reconstructable from the descriptor and data from the electrum server.
/// It changes only by applying an [`Update`], callers get clones of its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletState {
    network: Network,

    descriptor: WalletDescriptor,

    /// contains all my scripts up to the scanned horizon
    scripts: ScriptCache,

    /// inverse of `scripts`
    paths: HashMap<ScriptBuf, (Chain, u32)>,

    /// contains all my txs, including the ones deleted from the history
    txs: HashMap<Txid, Transaction>,

    /// the wallet view of the transactions in the history
    records: HashMap<Txid, TransactionRecord>,

    /// outputs to my scripts, spent or not
    utxos: HashMap<OutPoint, Utxo>,

    /// Contains the time of blocks at the given height. There are only heights containinig wallet txs
    timestamps: HashMap<Height, Timestamp>,

    last_unused: LastUnused,

    /// height and hash of tip of the blockchain
    tip: Tip,
}

impl std::hash::Hash for WalletState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network.as_str().hash(state);
        self.descriptor.id().hash(state);
        self.scripts.hash(state);

        let mut vec: Vec<_> = self.txs.iter().collect();
        vec.sort();
        vec.hash(state);

        let mut vec: Vec<_> = self.records.iter().collect();
        vec.sort_by_key(|kv| kv.0);
        vec.hash(state);

        let mut vec: Vec<_> = self.utxos.iter().collect();
        vec.sort_by_key(|kv| kv.0);
        vec.hash(state);

        let mut vec: Vec<_> = self.timestamps.iter().collect();
        vec.sort();
        vec.hash(state);

        self.last_unused.hash(state);
        self.tip.hash(state);
    }
}

impl WalletState {
    pub fn new(network: Network, descriptor: WalletDescriptor) -> Self {
        Self {
            network,
            descriptor,
            scripts: ScriptCache::default(),
            paths: HashMap::new(),
            txs: HashMap::new(),
            records: HashMap::new(),
            utxos: HashMap::new(),
            timestamps: HashMap::new(),
            last_unused: LastUnused::default(),
            tip: Tip {
                height: 0,
                hash: BlockHash::all_zeros(),
            },
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn descriptor(&self) -> &WalletDescriptor {
        &self.descriptor
    }

    pub fn scripts(&self) -> &ScriptCache {
        &self.scripts
    }

    pub(crate) fn paths(&self) -> &HashMap<ScriptBuf, (Chain, u32)> {
        &self.paths
    }

    pub(crate) fn txs(&self) -> &HashMap<Txid, Transaction> {
        &self.txs
    }

    pub(crate) fn timestamps(&self) -> &HashMap<Height, Timestamp> {
        &self.timestamps
    }

    pub fn transaction(&self, txid: &Txid) -> Option<&Transaction> {
        self.txs.get(txid)
    }

    pub fn record(&self, txid: &Txid) -> Option<&TransactionRecord> {
        self.records.get(txid)
    }

    /// Ids of the transactions in the wallet history
    pub fn txids(&self) -> impl Iterator<Item = Txid> + '_ {
        self.records.keys().copied()
    }

    /// The wallet transactions, ordered by confirmation height with unconfirmed last, then by txid
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by_key(|r| r.history_key());
        records
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    /// Unspent outputs, ordered by outpoint
    pub fn utxos(&self) -> Vec<Utxo> {
        let mut utxos: Vec<_> = self
            .utxos
            .values()
            .filter(|u| !u.is_spent)
            .cloned()
            .collect();
        utxos.sort_by_key(|u| u.outpoint);
        utxos
    }

    /// All the wallet outputs, spent or not, ordered by outpoint
    pub fn txos(&self) -> Vec<Utxo> {
        let mut txos: Vec<_> = self.utxos.values().cloned().collect();
        txos.sort_by_key(|u| u.outpoint);
        txos
    }

    pub fn balance(&self) -> Balance {
        let mut balance = Balance::default();
        for utxo in self.utxos.values().filter(|u| !u.is_spent) {
            match utxo.height {
                Some(_) => balance.confirmed += utxo.value,
                None => balance.unconfirmed += utxo.value,
            }
        }
        balance
    }

    /// First index of the chain after the last one with recorded usage
    pub fn last_unused(&self, chain: Chain) -> u32 {
        self.last_unused[chain]
    }

    pub(crate) fn last_unused_indexes(&self) -> LastUnused {
        self.last_unused
    }

    /// Number of scripts derived and watched for the chain
    pub fn horizon(&self, chain: Chain) -> u32 {
        self.scripts.len(chain)
    }

    /// Indexes of the chain receiving or spending in any wallet transaction
    pub fn used_indexes(&self, chain: Chain) -> BTreeSet<u32> {
        self.records
            .values()
            .flat_map(|r| r.inputs.iter().chain(r.outputs.iter()))
            .filter(|io| io.chain == chain)
            .map(|io| io.index)
            .collect()
    }

    pub fn tip(&self) -> Tip {
        self.tip
    }

    /// Returns true if no update has been applied yet
    pub fn never_scanned(&self) -> bool {
        self.tip.hash == BlockHash::all_zeros()
    }

    /// A deterministic value derived from the descriptor, the network and the content of the state
    ///
    /// It doesn't need cryptographic assurance, thus the faster hasher used in the rust compiler.
    pub fn status(&self) -> u64 {
        let mut hasher = FxHasher::default();
        std::hash::Hash::hash(&self, &mut hasher);
        hasher.finish()
    }

    /// Merge outputs, transaction records and watched scripts into the state.
    ///
    /// Entries are keyed by outpoint, txid and (chain, index); merging the same data twice leaves
    /// the state unchanged. Nothing is merged if the scripts don't extend the cached ones.
    pub fn merge(
        &mut self,
        utxos: &[Utxo],
        records: &[TransactionRecord],
        scripts: &[DerivedScript],
    ) -> Result<(), Error> {
        let mut cache = self.scripts.clone();
        for script in scripts {
            cache.insert(script)?;
        }
        self.scripts = cache;
        for script in scripts {
            self.paths
                .insert(script.script_pubkey.clone(), (script.chain, script.index));
        }

        for record in records {
            if let Some(previous) = self.records.get(&record.txid) {
                let (old, new) = (previous.confirmation.height(), record.confirmation.height());
                if old.is_some() && old != new {
                    log::warn!(
                        "reorg: transaction {} moved from height {old:?} to {new:?}",
                        record.txid
                    );
                }
            }
            self.records.insert(record.txid, record.clone());
        }

        for utxo in utxos {
            self.utxos.insert(utxo.outpoint, utxo.clone());
        }
        Ok(())
    }

    /// Apply an update obtained from [`crate::BlockchainBackend::full_scan()`]
    ///
    /// The update is applied on a copy of the state which replaces the current one only if
    /// everything succeeds. If the state changed since the scan started this returns
    /// [`Error::UpdateOnDifferentStatus`], the caller should scan again.
    pub fn apply_update(&mut self, update: &Update) -> Result<(), Error> {
        if update.wallet_status != 0 && update.wallet_status != self.status() {
            return Err(Error::UpdateOnDifferentStatus {
                wallet_status: self.status(),
                update_status: update.wallet_status,
            });
        }

        let mut next = self.clone();
        next.merge(&update.utxos, &update.records, &update.new_scripts)?;
        next.txs
            .extend(update.new_txs.iter().map(|tx| (tx.compute_txid(), tx.clone())));

        for txid in update.txid_delete.iter() {
            next.records.remove(txid);
            next.utxos.retain(|outpoint, _| outpoint.txid != *txid);
        }
        next.timestamps.extend(update.timestamps.iter().cloned());

        for chain in Chain::ALL {
            next.last_unused[chain] = next.last_unused[chain].max(update.last_unused[chain]);
        }

        if update.tip.height < next.tip.height {
            log::warn!(
                "tip moved back from {} to {}",
                next.tip.height,
                update.tip.height
            );
        }
        next.tip = update.tip;

        log::debug!(
            "applied update: {} records, {} utxos, {} deleted, tip {}",
            update.records.len(),
            update.utxos.len(),
            update.txid_delete.len(),
            update.tip.height
        );
        *self = next;
        Ok(())
    }
}
