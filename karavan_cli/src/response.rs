use karavan_wallet::{AddressResult, Confirmation, TransactionRecord, Utxo};
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct Balance {
    pub balance: u64,
    pub confirmed: u64,
    pub unconfirmed: u64,
}

#[derive(Serialize, Debug)]
pub struct Address {
    pub address: String,
    pub index: u32,
}

#[derive(Serialize, Debug)]
pub struct Tx {
    pub txid: String,
    pub confirmed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u32>,

    /// Net change of the wallet balance in satoshi
    pub delta: i64,
}

#[derive(Serialize, Debug)]
pub struct Transactions {
    pub transactions: Vec<Tx>,
}

#[derive(Serialize, Debug)]
pub struct Unspent {
    pub outpoint: String,
    pub value: u64,
    pub address_index: u32,
    pub internal: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Serialize, Debug)]
pub struct Utxos {
    pub utxos: Vec<Unspent>,
}

impl From<karavan_wallet::Balance> for Balance {
    fn from(value: karavan_wallet::Balance) -> Self {
        Balance {
            balance: value.total(),
            confirmed: value.confirmed,
            unconfirmed: value.unconfirmed,
        }
    }
}

impl From<AddressResult> for Address {
    fn from(value: AddressResult) -> Self {
        Address {
            address: value.address().to_string(),
            index: value.index(),
        }
    }
}

impl From<TransactionRecord> for Tx {
    fn from(value: TransactionRecord) -> Self {
        Tx {
            txid: value.txid.to_string(),
            confirmed: matches!(value.confirmation, Confirmation::Confirmed { .. }),
            height: value.confirmation.height(),
            timestamp: value.confirmation.timestamp(),
            delta: value.delta,
        }
    }
}

impl From<Utxo> for Unspent {
    fn from(value: Utxo) -> Self {
        Unspent {
            outpoint: value.outpoint.to_string(),
            value: value.value,
            address_index: value.index,
            internal: value.chain == karavan_wallet::Chain::Internal,
            height: value.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karavan_wallet::bitcoin::hashes::Hash;
    use karavan_wallet::bitcoin::Txid;

    #[test]
    fn test_tx_json() {
        let record = TransactionRecord {
            txid: Txid::all_zeros(),
            inputs: vec![],
            outputs: vec![],
            delta: -1500,
            confirmation: Confirmation::Unconfirmed,
        };
        let value = serde_json::to_value(Tx::from(record)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "txid": Txid::all_zeros().to_string(),
                "confirmed": false,
                "delta": -1500,
            })
        );

        let balance = Balance::from(karavan_wallet::Balance {
            confirmed: 10,
            unconfirmed: 5,
        });
        assert_eq!(
            serde_json::to_value(balance).unwrap(),
            serde_json::json!({"balance": 15, "confirmed": 10, "unconfirmed": 5})
        );
    }
}
