#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! # Karavan
//!
//! A bitcoin Watch-Only Wallet defined by an
//! [output descriptor](https://github.com/bitcoin/bitcoin/blob/master/doc/descriptors.md).
//!
//! The wallet derives the scripts of the descriptor, discovers the used ones on an Electrum
//! server and answers balance, new address and transaction history queries from its local state.
//!
//! For an entry point see [`Wallet::new()`]

mod clients;
mod config;
mod crypto;
mod derive;
mod descriptor;
mod error;
mod model;
mod persister;
mod store;
mod sync;
mod update;
mod wallet;

pub use crate::clients::electrum_url::{ElectrumUrl, UrlError};
pub use crate::clients::{BlockchainBackend, History, LastUnused, Unspent, BATCH_SIZE};
pub use crate::config::{BackendConfig, Network, StorageConfig, WalletConfig};
pub use crate::derive::{DerivedScript, ScriptCache};
pub use crate::descriptor::{parse_descriptor, Chain, WalletDescriptor};
pub use crate::error::Error;
pub use crate::model::{
    AddressResult, Balance, Confirmation, Height, Timestamp, Tip, TransactionRecord, TxIo, Utxo,
};
pub use crate::persister::{
    session_dir, FsPersister, FsReservation, NoPersist, PersistError, Persister,
};
pub use crate::store::WalletState;
pub use crate::sync::{backoff, ChainSync, Deadline, NullProgress, Progress, ScanContext, SyncOptions};
pub use crate::update::Update;
pub use crate::wallet::{AddressReservation, InMemoryReservation, Phase, Wallet};

#[cfg(feature = "electrum")]
pub use crate::clients::electrum_client::{ElectrumClient, ElectrumOptions};

pub use bitcoin;
pub use miniscript;
