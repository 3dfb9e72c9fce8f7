use crate::derive::DerivedScript;
use crate::descriptor::Chain;
use crate::model::{Confirmation, Height, Timestamp, Tip, TransactionRecord, TxIo, Utxo};
use crate::store::WalletState;
use crate::sync::ScanContext;
use crate::update::{Update, UPDATE_VERSION};
use crate::Error;
use bitcoin::block::Header as BlockHeader;
use bitcoin::{OutPoint, Script, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::{Index, IndexMut};

#[cfg(feature = "electrum")]
pub mod electrum_client;
pub mod electrum_url;

/// Maximum number of items requested to the server in a single batch
pub const BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct LastUnused {
    pub internal: u32,
    pub external: u32,
}

impl Index<Chain> for LastUnused {
    type Output = u32;

    fn index(&self, index: Chain) -> &Self::Output {
        match index {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }
}

impl IndexMut<Chain> for LastUnused {
    fn index_mut(&mut self, index: Chain) -> &mut Self::Output {
        match index {
            Chain::External => &mut self.external,
            Chain::Internal => &mut self.internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
/// Position of a transaction involving a certain script
pub struct History {
    /// Transaction ID
    pub txid: Txid,

    /// Confirmation height of txid
    ///
    /// -1 means unconfirmed with unconfirmed parents
    ///  0 means unconfirmed with confirmed parents
    pub height: i32,
}

impl History {
    fn height(&self) -> Result<Option<Height>, Error> {
        match self.height {
            h if h > 0 => Ok(Some(h as Height)),
            0 | -1 => Ok(None),
            h => Err(Error::ProtocolError(format!(
                "invalid height {h} for transaction {}",
                self.txid
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An unspent output of a certain script as reported by the server
pub struct Unspent {
    pub outpoint: OutPoint,
    pub value: u64,

    /// Same convention as [`History::height`]
    pub height: i32,
}

/// Data accumulated while scanning the scripts histories
#[derive(Default)]
struct Scan {
    txid_height: HashMap<Txid, Option<Height>>,
    new_scripts: Vec<DerivedScript>,
    used_scripts: Vec<ScriptBuf>,
    last_unused: LastUnused,
}

pub trait BlockchainBackend {
    /// Get the blockchain latest block
    fn tip(&mut self) -> Result<Tip, Error>;

    /// Broadcast the transaction
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error>;

    /// Get the transactions with the given txids, in the same order
    fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error>;

    /// Get the block headers at the given heights, in the same order
    fn get_headers(&self, heights: &[Height]) -> Result<Vec<BlockHeader>, Error>;

    /// Get the transactions involved in each of the given scripts
    fn get_scripts_history(&self, scripts: &[&Script]) -> Result<Vec<Vec<History>>, Error>;

    /// Get the unspent outputs of each of the given scripts
    fn get_scripts_unspent(&self, scripts: &[&Script]) -> Result<Vec<Vec<Unspent>>, Error>;

    /// Scan the blockchain for the scripts generated by a watch-only wallet
    ///
    /// This method scans both external and internal address chains, stopping after finding
    /// `ctx.stop_gap` consecutive unused addresses (the gap limit) as recommended by
    /// [BIP44](https://github.com/bitcoin/bips/blob/master/bip-0044.mediawiki#address-gap-limit).
    /// When a script past the previous horizon is found used, the horizon moves forward and the
    /// new window is scanned too, until no more usage is found.
    ///
    /// Returns the [`Update`] bringing the given state to the one of the blockchain.
    fn full_scan(&mut self, state: &WalletState, ctx: &ScanContext) -> Result<Update, Error> {
        ctx.deadline.check()?;
        let tip = self.tip()?;
        ctx.progress.update(0.1, "tip fetched");

        let scan = scan_histories(self, state, ctx)?;
        ctx.progress.update(0.5, "histories fetched");

        let new_txs = download_txs(self, &scan.txid_height, state, ctx)?;
        ctx.progress.update(0.7, "transactions downloaded");

        let timestamps = download_timestamps(self, &scan.txid_height, state, ctx)?;
        ctx.progress.update(0.8, "headers downloaded");

        let mut paths = state.paths().clone();
        for s in scan.new_scripts.iter() {
            paths.insert(s.script_pubkey.clone(), (s.chain, s.index));
        }
        let mut all_txs: HashMap<Txid, &Transaction> =
            state.txs().iter().map(|(txid, tx)| (*txid, tx)).collect();
        for tx in new_txs.iter() {
            all_txs.insert(tx.compute_txid(), tx);
        }
        let mut all_timestamps = state.timestamps().clone();
        all_timestamps.extend(timestamps.iter().cloned());

        let mut records = vec![];
        let mut all_records = vec![];
        for (txid, height) in scan.txid_height.iter() {
            let tx = all_txs.get(txid).ok_or_else(|| {
                Error::Generic(format!("transaction {txid} missing after download"))
            })?;
            let confirmation = match height {
                Some(height) => Confirmation::Confirmed {
                    height: *height,
                    timestamp: all_timestamps.get(height).copied(),
                },
                None => Confirmation::Unconfirmed,
            };
            let record = tx_record(*txid, tx, confirmation, &paths, &all_txs);
            if state.record(txid) != Some(&record) {
                records.push(record.clone());
            }
            all_records.push(record);
        }

        let txid_delete: Vec<Txid> = state
            .txids()
            .filter(|txid| !scan.txid_height.contains_key(txid))
            .collect();
        if !txid_delete.is_empty() {
            log::info!("{} transactions not in history anymore", txid_delete.len());
        }

        let spent: HashSet<OutPoint> = scan
            .txid_height
            .keys()
            .filter_map(|txid| all_txs.get(txid))
            .flat_map(|tx| tx.input.iter().map(|i| i.previous_output))
            .collect();

        let mut all_utxos = HashMap::new();
        for record in all_records.iter() {
            for output in record.outputs.iter() {
                let script_pubkey = all_txs
                    .get(&record.txid)
                    .and_then(|tx| tx.output.get(output.outpoint.vout as usize))
                    .map(|o| o.script_pubkey.clone())
                    .unwrap_or_default();
                let utxo = Utxo {
                    outpoint: output.outpoint,
                    value: output.value,
                    chain: output.chain,
                    index: output.index,
                    script_pubkey,
                    is_spent: spent.contains(&output.outpoint),
                    height: record.confirmation.height(),
                };
                all_utxos.insert(utxo.outpoint, utxo);
            }
        }
        check_unspent(self, &scan.used_scripts, &all_utxos, ctx)?;

        let utxos: Vec<Utxo> = all_utxos
            .into_values()
            .filter(|u| state.utxo(&u.outpoint) != Some(u))
            .collect();

        ctx.progress.update(1.0, "scan completed");
        log::info!(
            "scan completed: {} new scripts, {} new txs, {} changed records, {} deleted, tip {}",
            scan.new_scripts.len(),
            new_txs.len(),
            records.len(),
            txid_delete.len(),
            tip.height
        );

        Ok(Update {
            version: UPDATE_VERSION,
            wallet_status: state.status(),
            new_scripts: scan.new_scripts,
            new_txs,
            records,
            txid_delete,
            utxos,
            timestamps,
            last_unused: scan.last_unused,
            tip,
        })
    }
}

fn scan_histories<B: BlockchainBackend + ?Sized>(
    backend: &B,
    state: &WalletState,
    ctx: &ScanContext,
) -> Result<Scan, Error> {
    let descriptor = state.descriptor();
    let mut cache = state.scripts().clone();
    let mut scan = Scan {
        last_unused: state.last_unused_indexes(),
        ..Default::default()
    };

    for chain in descriptor.chains() {
        let mut last_used = scan.last_unused[chain].checked_sub(1);
        let mut queried = 0u32;
        loop {
            let horizon = last_used.map_or(0, |u| u + 1) + ctx.stop_gap;
            if queried >= horizon {
                break;
            }
            scan.new_scripts
                .extend(cache.derive_up_to(descriptor, chain, horizon)?);
            let batch: Vec<ScriptBuf> = (queried..horizon)
                .filter_map(|i| cache.get(chain, i).cloned())
                .collect();

            let mut histories = Vec::with_capacity(batch.len());
            for chunk in batch.chunks(BATCH_SIZE) {
                ctx.deadline.check()?;
                let scripts: Vec<&Script> = chunk.iter().map(|s| s.as_script()).collect();
                let result = backend.get_scripts_history(&scripts)?;
                if result.len() != chunk.len() {
                    return Err(Error::ProtocolError(format!(
                        "requested history of {} scripts, got {}",
                        chunk.len(),
                        result.len()
                    )));
                }
                histories.extend(result);
            }

            for (i, (script, history)) in batch.iter().zip(histories).enumerate() {
                if history.is_empty() {
                    continue;
                }
                let index = queried + i as u32;
                last_used = Some(last_used.map_or(index, |u| u.max(index)));
                scan.used_scripts.push(script.clone());
                for h in history {
                    let height = h.height()?;
                    let entry = scan.txid_height.entry(h.txid).or_insert(height);
                    if height.is_some() {
                        *entry = height;
                    }
                }
            }
            log::debug!(
                "{chain:?} scripts from {queried} to {horizon} scanned, last used {last_used:?}"
            );
            queried = horizon;
        }
        scan.last_unused[chain] = last_used.map_or(0, |u| u + 1);
    }
    Ok(scan)
}

fn download_txs<B: BlockchainBackend + ?Sized>(
    backend: &B,
    txid_height: &HashMap<Txid, Option<Height>>,
    state: &WalletState,
    ctx: &ScanContext,
) -> Result<Vec<Transaction>, Error> {
    let mut txids: Vec<Txid> = txid_height
        .keys()
        .filter(|txid| !state.txs().contains_key(*txid))
        .cloned()
        .collect();
    txids.sort();

    let mut txs = Vec::with_capacity(txids.len());
    for chunk in txids.chunks(BATCH_SIZE) {
        ctx.deadline.check()?;
        let result = backend.get_transactions(chunk)?;
        if result.len() != chunk.len() {
            return Err(Error::ProtocolError(format!(
                "requested {} transactions, got {}",
                chunk.len(),
                result.len()
            )));
        }
        for (expected, tx) in chunk.iter().zip(result) {
            let txid = tx.compute_txid();
            if txid != *expected {
                return Err(Error::ProtocolError(format!(
                    "requested transaction {expected}, got {txid}"
                )));
            }
            txs.push(tx);
        }
    }
    if !txs.is_empty() {
        log::debug!("downloaded {} transactions", txs.len());
    }
    Ok(txs)
}

fn download_timestamps<B: BlockchainBackend + ?Sized>(
    backend: &B,
    txid_height: &HashMap<Txid, Option<Height>>,
    state: &WalletState,
    ctx: &ScanContext,
) -> Result<Vec<(Height, Timestamp)>, Error> {
    let mut heights: Vec<Height> = txid_height
        .values()
        .flatten()
        .filter(|h| !state.timestamps().contains_key(*h))
        .cloned()
        .collect();
    heights.sort();
    heights.dedup();

    let mut timestamps = Vec::with_capacity(heights.len());
    for chunk in heights.chunks(BATCH_SIZE) {
        ctx.deadline.check()?;
        let headers = backend.get_headers(chunk)?;
        if headers.len() != chunk.len() {
            return Err(Error::ProtocolError(format!(
                "requested {} headers, got {}",
                chunk.len(),
                headers.len()
            )));
        }
        timestamps.extend(chunk.iter().zip(headers).map(|(h, header)| (*h, header.time)));
    }
    Ok(timestamps)
}

/// Cross check the outputs computed from the transactions with the server unspent list
fn check_unspent<B: BlockchainBackend + ?Sized>(
    backend: &B,
    used_scripts: &[ScriptBuf],
    utxos: &HashMap<OutPoint, Utxo>,
    ctx: &ScanContext,
) -> Result<(), Error> {
    for chunk in used_scripts.chunks(BATCH_SIZE) {
        ctx.deadline.check()?;
        let scripts: Vec<&Script> = chunk.iter().map(|s| s.as_script()).collect();
        let result = backend.get_scripts_unspent(&scripts)?;
        if result.len() != chunk.len() {
            return Err(Error::ProtocolError(format!(
                "requested unspent of {} scripts, got {}",
                chunk.len(),
                result.len()
            )));
        }
        for unspent in result.into_iter().flatten() {
            match utxos.get(&unspent.outpoint) {
                Some(utxo) if utxo.value != unspent.value => {
                    return Err(Error::ProtocolError(format!(
                        "unspent {} has value {} while the transaction says {}",
                        unspent.outpoint, unspent.value, utxo.value
                    )))
                }
                Some(utxo) if !utxo.is_spent => {}
                _ => {
                    // history and unspent were fetched at different times
                    return Err(Error::Transport(format!(
                        "server state changed during the scan at {}",
                        unspent.outpoint
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Compute the wallet view of a transaction
fn tx_record(
    txid: Txid,
    tx: &Transaction,
    confirmation: Confirmation,
    paths: &HashMap<ScriptBuf, (Chain, u32)>,
    txs: &HashMap<Txid, &Transaction>,
) -> TransactionRecord {
    let inputs: Vec<TxIo> = tx
        .input
        .iter()
        .filter_map(|input| {
            let prev = input.previous_output;
            let output = txs.get(&prev.txid)?.output.get(prev.vout as usize)?;
            let (chain, index) = paths.get(&output.script_pubkey)?;
            Some(TxIo {
                outpoint: prev,
                value: output.value.to_sat(),
                chain: *chain,
                index: *index,
            })
        })
        .collect();
    let outputs: Vec<TxIo> = tx
        .output
        .iter()
        .enumerate()
        .filter_map(|(vout, output)| {
            let (chain, index) = paths.get(&output.script_pubkey)?;
            Some(TxIo {
                outpoint: OutPoint::new(txid, vout as u32),
                value: output.value.to_sat(),
                chain: *chain,
                index: *index,
            })
        })
        .collect();
    let received: u64 = outputs.iter().map(|o| o.value).sum();
    let sent: u64 = inputs.iter().map(|i| i.value).sum();
    TransactionRecord {
        txid,
        inputs,
        outputs,
        delta: received as i64 - sent as i64,
        confirmation,
    }
}
