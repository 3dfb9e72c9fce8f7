use crate::descriptor::Chain;
use bitcoin::{Address, BlockHash, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

pub type Height = u32;
pub type Timestamp = u32;

/// An output received by the wallet
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Utxo {
    /// The outpoint of the output.
    pub outpoint: OutPoint,

    /// The value of the output in satoshi.
    pub value: u64,

    /// The chain of the script receiving the output.
    pub chain: Chain,

    /// The wildcard index of the script receiving the output.
    pub index: u32,

    /// The script pubkey of the output.
    pub script_pubkey: ScriptBuf,

    /// Whether the output is spent by another wallet transaction.
    pub is_spent: bool,

    /// The height of the block containing this output if it's confirmed.
    pub height: Option<Height>,
}

/// An input or an output of a transaction involving a wallet script
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxIo {
    /// For outputs the outpoint created, for inputs the outpoint spent.
    pub outpoint: OutPoint,

    pub value: u64,

    pub chain: Chain,

    pub index: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    Unconfirmed,
    Confirmed {
        height: Height,

        /// The timestamp of the block, if its header has been downloaded
        timestamp: Option<Timestamp>,
    },
}

impl Confirmation {
    pub fn height(&self) -> Option<Height> {
        match self {
            Confirmation::Unconfirmed => None,
            Confirmation::Confirmed { height, .. } => Some(*height),
        }
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Confirmation::Unconfirmed => None,
            Confirmation::Confirmed { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Confirmation::Confirmed { .. })
    }
}

/// A transaction from the perspective of the wallet
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionRecord {
    pub txid: Txid,

    /// The inputs spending wallet outputs, in the order they appear in the transaction.
    pub inputs: Vec<TxIo>,

    /// The outputs to wallet scripts, in the order they appear in the transaction.
    pub outputs: Vec<TxIo>,

    /// Net change of the wallet balance caused by the transaction, in satoshi.
    pub delta: i64,

    pub confirmation: Confirmation,
}

impl TransactionRecord {
    /// Order by confirmation height, unconfirmed last, then by txid bytes
    pub(crate) fn history_key(&self) -> (u32, [u8; 32]) {
        use bitcoin::hashes::Hash;
        let height = self.confirmation.height().unwrap_or(u32::MAX);
        (height, self.txid.to_byte_array())
    }
}

/// The wallet balance in satoshi
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
}

impl Balance {
    pub fn total(&self) -> u64 {
        self.confirmed + self.unconfirmed
    }
}

/// Value returned from [`crate::Wallet::get_new_address()`] and [`crate::Wallet::address()`]
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AddressResult {
    address: Address,
    index: u32,
}

impl AddressResult {
    pub fn new(address: Address, index: u32) -> Self {
        Self { address, index }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// The best block known by the wallet
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tip {
    pub height: Height,
    pub hash: BlockHash,
}
