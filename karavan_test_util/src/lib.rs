use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use rand::{thread_rng, Rng};

mod mock;
mod test_env;
pub use mock::{mock_header, MockChain};
pub use test_env::{TestEnv, TestEnvBuilder};

/// Account xpub at `m/84'/1'/0'` of the mnemonic "abandon abandon ... about"
pub const TEST_TPUB: &str = "[73c5da0a/84'/1'/0']tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M";

/// Master xpub of the BIP32 test vector 1
pub const TEST_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

/// A single key wallet with external addresses only
pub fn test_descriptor() -> String {
    format!("wpkh({TEST_TPUB}/0/*)")
}

/// A single key wallet with external and change addresses
pub fn test_descriptor_multipath() -> String {
    format!("wpkh({TEST_TPUB}/<0;1>/*)")
}

pub fn init_logging() {
    let _ = env_logger::try_init();
}

/// A txid nobody knows the transaction of
pub fn random_txid() -> Txid {
    let bytes: [u8; 32] = thread_rng().gen();
    Txid::from_byte_array(bytes)
}

/// A transaction spending `inputs` and creating `outputs`
///
/// Without inputs, a random outpoint is spent so that every call returns a different transaction.
pub fn tx_with(inputs: &[OutPoint], outputs: &[(ScriptBuf, u64)]) -> Transaction {
    let inputs: Vec<OutPoint> = if inputs.is_empty() {
        vec![OutPoint::new(random_txid(), 0)]
    } else {
        inputs.to_vec()
    };
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(script_pubkey, value)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: script_pubkey.clone(),
            })
            .collect(),
    }
}

/// A script paying to nobody in the wallet
pub fn foreign_script() -> ScriptBuf {
    let bytes: [u8; 20] = thread_rng().gen();
    ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_with() {
        let a = tx_with(&[], &[(foreign_script(), 1000)]);
        let b = tx_with(&[], &[(foreign_script(), 1000)]);
        assert_ne!(a.compute_txid(), b.compute_txid());
        assert_eq!(a.output[0].value.to_sat(), 1000);

        let spend = tx_with(&[OutPoint::new(a.compute_txid(), 0)], &[]);
        assert_eq!(spend.input[0].previous_output.txid, a.compute_txid());
        assert!(spend.output.is_empty());
    }

    #[test]
    fn test_descriptors() {
        let desc: karavan_wallet::WalletDescriptor = test_descriptor().parse().unwrap();
        assert_eq!(desc.chains(), vec![karavan_wallet::Chain::External]);
        let desc: karavan_wallet::WalletDescriptor = test_descriptor_multipath().parse().unwrap();
        assert_eq!(desc.chains().len(), 2);
        let desc: karavan_wallet::WalletDescriptor =
            format!("wpkh({TEST_XPUB}/0/*)").parse().unwrap();
        assert!(desc.is_for_network(karavan_wallet::Network::Mainnet));
    }
}
