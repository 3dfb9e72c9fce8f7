use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bitcoin::block::{Header as BlockHeader, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::{
    BlockHash, CompactTarget, OutPoint, Script, ScriptBuf, Transaction, TxMerkleNode, Txid,
};
use karavan_wallet::{BlockchainBackend, Error, Height, History, Tip, Unspent};

const GENESIS_TIME: u32 = 1_700_000_000;
const BLOCK_INTERVAL: u32 = 600;

#[derive(Default)]
struct Chain {
    height: Height,
    txs: HashMap<Txid, Transaction>,

    /// Confirmation height of the mined transactions, the others are in the mempool
    heights: HashMap<Txid, Height>,

    transient_failures: u32,
    malformed_histories: u32,
    latency: Duration,
    calls: usize,
}

impl Chain {
    fn script_of(&self, outpoint: &OutPoint) -> Option<&ScriptBuf> {
        self.txs
            .get(&outpoint.txid)?
            .output
            .get(outpoint.vout as usize)
            .map(|o| &o.script_pubkey)
    }

    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.txs
            .values()
            .any(|tx| tx.input.iter().any(|i| i.previous_output == *outpoint))
    }

    fn electrum_height(&self, txid: &Txid) -> i32 {
        self.heights.get(txid).map_or(0, |h| *h as i32)
    }

    fn history(&self, script: &Script) -> Vec<History> {
        let mut history: Vec<History> = self
            .txs
            .iter()
            .filter(|(_, tx)| {
                tx.output.iter().any(|o| o.script_pubkey.as_script() == script)
                    || tx
                        .input
                        .iter()
                        .any(|i| self.script_of(&i.previous_output).map(|s| s.as_script()) == Some(script))
            })
            .map(|(txid, _)| History {
                txid: *txid,
                height: self.electrum_height(txid),
            })
            .collect();
        history.sort_by_key(|h| (h.height <= 0, h.height, h.txid));
        history
    }

    fn unspent(&self, script: &Script) -> Vec<Unspent> {
        let mut unspent = vec![];
        for (txid, tx) in self.txs.iter() {
            for (vout, output) in tx.output.iter().enumerate() {
                let outpoint = OutPoint::new(*txid, vout as u32);
                if output.script_pubkey.as_script() == script && !self.is_spent(&outpoint) {
                    unspent.push(Unspent {
                        outpoint,
                        value: output.value.to_sat(),
                        height: self.electrum_height(txid),
                    });
                }
            }
        }
        unspent.sort_by_key(|u| u.outpoint);
        unspent
    }
}

/// The header of the block at the given height of the mock chain
pub fn mock_header(height: Height) -> BlockHeader {
    BlockHeader {
        version: BlockVersion::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: GENESIS_TIME + height * BLOCK_INTERVAL,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce: height,
    }
}

/// An in memory blockchain answering like an Electrum server
///
/// Clones share the same chain, so that a test can keep a handle to mine blocks and inject
/// failures while the wallet owns another one.
#[derive(Clone, Default)]
pub struct MockChain {
    inner: Arc<Mutex<Chain>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Chain> {
        self.inner.lock().expect("mock chain lock")
    }

    /// Simulate a call to the server, failing if failures are pending
    fn call(&self) -> Result<MutexGuard<'_, Chain>, Error> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut chain = self.lock();
        chain.calls += 1;
        if chain.transient_failures > 0 {
            chain.transient_failures -= 1;
            return Err(Error::Transport("connection reset by mock".into()));
        }
        Ok(chain)
    }

    pub fn height(&self) -> Height {
        self.lock().height
    }

    /// Number of calls received, failed ones included
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    /// The next `n` calls fail with a transient error
    pub fn fail_next(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// The next `n` history requests contain an invalid height
    pub fn malform_next_histories(&self, n: u32) {
        self.lock().malformed_histories = n;
    }

    /// Every call takes at least `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Add an unconfirmed transaction
    pub fn push_tx(&self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();
        self.lock().txs.insert(txid, tx);
        txid
    }

    /// Add an unconfirmed transaction paying `value` to `script`
    pub fn receive(&self, script: &Script, value: u64) -> Txid {
        self.push_tx(crate::tx_with(&[], &[(script.to_owned(), value)]))
    }

    /// Mine a block confirming every unconfirmed transaction, return the new height
    pub fn mine(&self) -> Height {
        let mut chain = self.lock();
        chain.height += 1;
        let height = chain.height;
        let unconfirmed: Vec<Txid> = chain
            .txs
            .keys()
            .filter(|txid| !chain.heights.contains_key(*txid))
            .cloned()
            .collect();
        for txid in unconfirmed {
            chain.heights.insert(txid, height);
        }
        height
    }

    pub fn mine_empty(&self, blocks: u32) -> Height {
        let mut chain = self.lock();
        chain.height += blocks;
        chain.height
    }

    /// Move a mined transaction to another height, or back to the mempool with None
    pub fn reorg_tx(&self, txid: &Txid, height: Option<Height>) {
        let mut chain = self.lock();
        match height {
            Some(height) => chain.heights.insert(*txid, height),
            None => chain.heights.remove(txid),
        };
    }

    /// Remove a transaction as if it was evicted from the mempool
    pub fn drop_tx(&self, txid: &Txid) {
        let mut chain = self.lock();
        chain.txs.remove(txid);
        chain.heights.remove(txid);
    }
}

impl BlockchainBackend for MockChain {
    fn tip(&mut self) -> Result<Tip, Error> {
        let chain = self.call()?;
        Ok(Tip {
            height: chain.height,
            hash: mock_header(chain.height).block_hash(),
        })
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error> {
        let mut chain = self.call()?;
        let txid = tx.compute_txid();
        chain.txs.insert(txid, tx.clone());
        Ok(txid)
    }

    fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error> {
        let chain = self.call()?;
        txids
            .iter()
            .map(|txid| {
                chain
                    .txs
                    .get(txid)
                    .cloned()
                    .ok_or_else(|| Error::ProtocolError(format!("unknown transaction {txid}")))
            })
            .collect()
    }

    fn get_headers(&self, heights: &[Height]) -> Result<Vec<BlockHeader>, Error> {
        let chain = self.call()?;
        heights
            .iter()
            .map(|h| match *h <= chain.height {
                true => Ok(mock_header(*h)),
                false => Err(Error::ProtocolError(format!("no block at height {h}"))),
            })
            .collect()
    }

    fn get_scripts_history(&self, scripts: &[&Script]) -> Result<Vec<Vec<History>>, Error> {
        let mut chain = self.call()?;
        let mut histories: Vec<Vec<History>> = scripts.iter().map(|s| chain.history(s)).collect();
        if chain.malformed_histories > 0 {
            chain.malformed_histories -= 1;
            if let Some(first) = histories.first_mut() {
                first.push(History {
                    txid: crate::random_txid(),
                    height: -7,
                });
            }
        }
        Ok(histories)
    }

    fn get_scripts_unspent(&self, scripts: &[&Script]) -> Result<Vec<Vec<Unspent>>, Error> {
        let chain = self.call()?;
        Ok(scripts.iter().map(|s| chain.unspent(s)).collect())
    }
}
