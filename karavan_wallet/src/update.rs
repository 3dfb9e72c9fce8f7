use crate::clients::LastUnused;
use crate::crypto::{decrypt_with_nonce_prefix, encrypt_with_random_nonce};
use crate::derive::DerivedScript;
use crate::descriptor::WalletDescriptor;
use crate::error::Error;
use crate::model::{Height, Timestamp, Tip, TransactionRecord, Utxo};
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};

/// Current version of the serialized [`Update`]
pub const UPDATE_VERSION: u8 = 1;

/// Passing a wallet state to [`crate::BlockchainBackend::full_scan()`] returns this structure which
/// contains the delta of information to be applied to the wallet to reach the latest status.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Update {
    /// The version of the update
    pub version: u8,

    /// The status of the wallet this update is generated from
    ///
    /// If 0 the status is not checked when applying the update
    pub wallet_status: u64,

    /// Scripts derived during the scan, extending the cached ones
    pub new_scripts: Vec<DerivedScript>,

    /// The transactions not previously known by the wallet
    pub new_txs: Vec<Transaction>,

    /// New transaction records, or records that changed since the wallet status
    pub records: Vec<TransactionRecord>,

    /// The transaction ids to delete, for example after a reorg or a replace by fee.
    pub txid_delete: Vec<Txid>,

    /// New outputs, or outputs whose spent flag or height changed
    pub utxos: Vec<Utxo>,

    /// The timestamps of the blocks at the heights containing wallet transactions
    pub timestamps: Vec<(Height, Timestamp)>,

    /// First unused index of each chain
    pub last_unused: LastUnused,

    /// The tip of the blockchain at the time the update was generated
    pub tip: Tip,
}

impl Update {
    /// Whether this update only changes the tip
    pub fn only_tip(&self) -> bool {
        self.new_scripts.is_empty()
            && self.new_txs.is_empty()
            && self.records.is_empty()
            && self.txid_delete.is_empty()
            && self.utxos.is_empty()
    }

    /// Serialize an [`Update`] to a JSON byte array
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize an [`Update`] from a JSON byte array
    pub fn deserialize(bytes: &[u8]) -> Result<Update, Error> {
        let update: Update = serde_json::from_slice(bytes)?;
        if update.version > UPDATE_VERSION {
            return Err(Error::Generic(format!(
                "unsupported update version {}",
                update.version
            )));
        }
        Ok(update)
    }

    /// Serialize an update to a byte array, encrypted with a key derived from the descriptor. Decrypt using [`Self::deserialize_decrypted()`]
    pub fn serialize_encrypted(&self, desc: &WalletDescriptor) -> Result<Vec<u8>, Error> {
        let plaintext = self.serialize()?;
        let mut cipher = desc.cipher();
        encrypt_with_random_nonce(&mut cipher, &plaintext)
    }

    /// Deserialize an update from a byte array, decrypted with a key derived from the descriptor. Create the byte array using [`Self::serialize_encrypted()`]
    pub fn deserialize_decrypted(bytes: &[u8], desc: &WalletDescriptor) -> Result<Update, Error> {
        let mut cipher = desc.cipher();
        let plaintext = decrypt_with_nonce_prefix(&mut cipher, bytes)?;
        Update::deserialize(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Chain;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, OutPoint, ScriptBuf};
    use std::str::FromStr;

    const DESC: &str = "wpkh([73c5da0a/84'/1'/0']tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M/<0;1>/*)";

    fn tip_only_update() -> Update {
        Update {
            version: UPDATE_VERSION,
            wallet_status: 1,
            new_scripts: vec![],
            new_txs: vec![],
            records: vec![],
            txid_delete: vec![],
            utxos: vec![],
            timestamps: vec![],
            last_unused: LastUnused::default(),
            tip: Tip {
                height: 100,
                hash: BlockHash::all_zeros(),
            },
        }
    }

    #[test]
    fn test_only_tip() {
        let mut update = tip_only_update();
        assert!(update.only_tip());
        update.timestamps.push((100, 1_700_000_000));
        assert!(update.only_tip());
        update.txid_delete.push(Txid::all_zeros());
        assert!(!update.only_tip());

        let mut update = tip_only_update();
        update.utxos.push(Utxo {
            outpoint: OutPoint::null(),
            value: 1000,
            chain: Chain::External,
            index: 0,
            script_pubkey: ScriptBuf::new(),
            is_spent: false,
            height: None,
        });
        assert!(!update.only_tip());
    }

    #[test]
    fn test_update_encryption() {
        let desc = WalletDescriptor::from_str(DESC).unwrap();
        let mut update = tip_only_update();
        update.new_scripts.push(DerivedScript {
            chain: Chain::Internal,
            index: 0,
            script_pubkey: desc.derive(Chain::Internal, 0).unwrap(),
        });
        update.timestamps.push((100, 1_700_000_000));

        let plain = update.serialize().unwrap();
        assert_eq!(Update::deserialize(&plain).unwrap(), update);

        let enc1 = update.serialize_encrypted(&desc).unwrap();
        let enc2 = update.serialize_encrypted(&desc).unwrap();
        assert_ne!(enc1, enc2); // encryption is not deterministic
        assert_eq!(Update::deserialize_decrypted(&enc1, &desc).unwrap(), update);

        let other = WalletDescriptor::from_str(&DESC.replace("<0;1>", "<2;3>")).unwrap();
        assert!(Update::deserialize_decrypted(&enc1, &other).is_err());
    }

    #[test]
    fn test_future_version() {
        let mut update = tip_only_update();
        update.version = UPDATE_VERSION + 1;
        let bytes = serde_json::to_vec(&update).unwrap();
        assert!(matches!(Update::deserialize(&bytes), Err(Error::Generic(_))));
    }
}
