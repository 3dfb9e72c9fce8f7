use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::{Transaction, Txid};

use crate::clients::BlockchainBackend;
use crate::config::{StorageConfig, WalletConfig};
use crate::derive::DerivedScript;
use crate::descriptor::{Chain, WalletDescriptor};
use crate::model::{AddressResult, Balance, TransactionRecord, Utxo};
use crate::persister::{session_dir, FsPersister, FsReservation, NoPersist, Persister};
use crate::store::WalletState;
use crate::sync::{ChainSync, Progress};
use crate::{Error, Network};

/// Keeps track of the addresses returned by [`Wallet::get_new_address()`]
///
/// Wallets with [`StorageConfig::Memory`] use an [`InMemoryReservation`], forgetting everything
/// when the process ends. With [`StorageConfig::Filesystem`] the reservations are stored in the
/// data dir, see [`FsReservation`].
pub trait AddressReservation {
    /// Whether the external `index` has already been given out for the wallet
    fn is_reserved(&self, wallet_id: &str, index: u32) -> Result<bool, Error>;

    /// Mark the external `index` as given out for the wallet
    fn reserve(&self, wallet_id: &str, index: u32) -> Result<(), Error>;
}

/// Reservations kept in memory for the lifetime of the process
#[derive(Debug, Default)]
pub struct InMemoryReservation {
    reserved: Mutex<HashMap<String, BTreeSet<u32>>>,
}

impl InMemoryReservation {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, BTreeSet<u32>>>, Error> {
        self.reserved
            .lock()
            .map_err(|_| Error::Generic("reservation lock poisoned".into()))
    }
}

impl AddressReservation for InMemoryReservation {
    fn is_reserved(&self, wallet_id: &str, index: u32) -> Result<bool, Error> {
        Ok(self
            .lock()?
            .get(wallet_id)
            .is_some_and(|set| set.contains(&index)))
    }

    fn reserve(&self, wallet_id: &str, index: u32) -> Result<(), Error> {
        self.lock()?
            .entry(wallet_id.to_string())
            .or_default()
            .insert(index);
        Ok(())
    }
}

/// The lifecycle of a [`Wallet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No descriptor given yet
    Created,

    /// Descriptor and network accepted, persisted data loaded
    Initialized,

    /// At least one sync succeeded since the initialization
    Synced,
}

struct Session {
    id: String,
    state: WalletState,
    persister: Arc<dyn Persister + Send + Sync>,
}

struct Inner {
    phase: Phase,
    chain: ChainSync,
    session: Option<Session>,
}

impl Inner {
    fn session(&self) -> Result<&Session, Error> {
        self.session.as_ref().ok_or(Error::WalletNotInitialized)
    }

    /// Sync and apply the update, the state and the phase don't change on failure
    fn sync(&mut self) -> Result<(), Error> {
        let session = self.session.as_mut().ok_or(Error::WalletNotInitialized)?;
        let update = self.chain.sync(&session.state)?;

        let mut next = session.state.clone();
        next.apply_update(&update)?;
        session.persister.push(update)?;
        session.state = next;
        self.phase = Phase::Synced;
        Ok(())
    }
}

/// A watch-only wallet defined by a descriptor, kept in sync with the blockchain
///
/// Every method takes an internal lock, so calls on the same wallet are serialized while
/// different wallets proceed in parallel.
pub struct Wallet {
    config: WalletConfig,
    reservation: Arc<dyn AddressReservation + Send + Sync>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("config", &self.config)
            .finish()
    }
}

impl Wallet {
    /// Create a wallet using the backend in the config, connected at the first sync
    pub fn new(config: WalletConfig) -> Result<Self, Error> {
        let chain = ChainSync::from_config(&config)?;
        Ok(Self::with_chain(config, chain))
    }

    /// Create a wallet fetching data from the given backend instead of the configured one
    pub fn with_backend<B: BlockchainBackend + Send + 'static>(
        config: WalletConfig,
        backend: B,
    ) -> Result<Self, Error> {
        config.validate()?;
        let chain = ChainSync::with_backend(backend, (&config).into());
        Ok(Self::with_chain(config, chain))
    }

    fn with_chain(config: WalletConfig, chain: ChainSync) -> Self {
        let reservation: Arc<dyn AddressReservation + Send + Sync> = match &config.storage {
            StorageConfig::Memory => Arc::new(InMemoryReservation::default()),
            StorageConfig::Filesystem { datadir } => Arc::new(FsReservation::new(datadir)),
        };
        Self {
            config,
            reservation,
            inner: Mutex::new(Inner {
                phase: Phase::Created,
                chain,
                session: None,
            }),
        }
    }

    /// Share address reservations with other wallets or processes
    pub fn with_reservation(mut self, reservation: Arc<dyn AddressReservation + Send + Sync>) -> Self {
        self.reservation = reservation;
        self
    }

    /// Receive the advancement of the syncs
    pub fn with_progress(mut self, progress: Arc<dyn Progress + Send + Sync>) -> Result<Self, Error> {
        self.inner
            .get_mut()
            .map_err(|_| Error::Generic("wallet lock poisoned".into()))?
            .chain
            .set_progress(progress);
        Ok(self)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, Error> {
        self.inner
            .lock()
            .map_err(|_| Error::Generic("wallet lock poisoned".into()))
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn phase(&self) -> Result<Phase, Error> {
        Ok(self.lock()?.phase)
    }

    /// Set the descriptor and the network of the wallet
    ///
    /// The network name is case insensitive and must be one of the networks allowed in the
    /// config. Persisted updates, if any, are applied. Calling it again replaces the previous
    /// descriptor, the wallet is initialized but not synced.
    pub fn initialize(&self, descriptor: &str, network: &str) -> Result<(), Error> {
        if descriptor.trim().is_empty() {
            return Err(Error::EmptyDescriptor);
        }
        let network = self.config.network(network)?;
        let mut desc = WalletDescriptor::from_str(descriptor)?;
        if let Some(change) = self.config.change_descriptor.as_deref() {
            desc = desc.with_change(change)?;
        }
        if !desc.has_wildcard() {
            return Err(Error::UnsupportedDescriptorWithoutWildcard);
        }
        if !desc.has_address() {
            return Err(Error::UnsupportedScriptKind(desc.kind()));
        }
        if !desc.is_for_network(network) {
            return Err(Error::DescriptorNetworkMismatch(network));
        }
        for chain in desc.chains() {
            desc.derive(chain, 0)?;
        }

        let id = format!("{network}:{}", desc.id());
        let persister: Arc<dyn Persister + Send + Sync> = match &self.config.storage {
            StorageConfig::Memory => Arc::new(NoPersist),
            StorageConfig::Filesystem { datadir } => {
                FsPersister::new(&session_dir(datadir, &id)?, &desc)?
            }
        };
        let updates = persister.updates()?;
        let mut state = WalletState::new(network, desc);
        for update in updates.iter() {
            state.apply_update(update)?;
        }
        log::info!(
            "wallet initialized on {network}, {} persisted updates applied",
            updates.len()
        );

        let mut inner = self.lock()?;
        inner.session = Some(Session {
            id,
            state,
            persister,
        });
        inner.phase = Phase::Initialized;
        Ok(())
    }

    /// Fetch the latest blockchain data of the wallet scripts
    pub fn sync(&self) -> Result<(), Error> {
        self.lock()?.sync()
    }

    /// Sync and return the sum of the unspent outputs
    pub fn get_balance(&self) -> Result<Balance, Error> {
        let mut inner = self.lock()?;
        inner.sync()?;
        Ok(inner.session()?.state.balance())
    }

    /// Sync and return the external address with the lowest index that has never been used
    /// on chain nor returned by this method before
    pub fn get_new_address(&self) -> Result<AddressResult, Error> {
        let mut inner = self.lock()?;
        inner.sync()?;
        let session = inner.session()?;
        let used = session.state.used_indexes(Chain::External);
        let mut index = 0u32;
        loop {
            if !used.contains(&index) && !self.reservation.is_reserved(&session.id, index)? {
                break;
            }
            index = index
                .checked_add(1)
                .filter(|i| *i < (1 << 31))
                .ok_or_else(|| Error::Generic("no unused address left".into()))?;
        }
        let address = address_at(&session.state, index)?;
        self.reservation.reserve(&session.id, index)?;
        log::debug!("new address at index {index}");
        Ok(address)
    }

    /// Sync and return the wallet transactions, ordered by confirmation height with unconfirmed last
    pub fn get_transaction_history(&self) -> Result<Vec<TransactionRecord>, Error> {
        let mut inner = self.lock()?;
        inner.sync()?;
        Ok(inner.session()?.state.transactions())
    }

    /// The external address at the given index, without syncing or reserving it
    pub fn address(&self, index: u32) -> Result<AddressResult, Error> {
        let inner = self.lock()?;
        address_at(&inner.session()?.state, index)
    }

    /// The unspent outputs as of the last sync
    pub fn utxos(&self) -> Result<Vec<Utxo>, Error> {
        Ok(self.lock()?.session()?.state.utxos())
    }

    pub fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error> {
        let mut inner = self.lock()?;
        inner.session()?;
        let txid = inner.chain.broadcast(tx)?;
        log::info!("broadcasted {txid}");
        Ok(txid)
    }

    /// See [`WalletState::status()`]
    pub fn status(&self) -> Result<u64, Error> {
        Ok(self.lock()?.session()?.state.status())
    }

    /// A snapshot of the wallet state
    pub fn state(&self) -> Result<WalletState, Error> {
        Ok(self.lock()?.session()?.state.clone())
    }

    pub fn network(&self) -> Result<Network, Error> {
        Ok(self.lock()?.session()?.state.network())
    }
}

fn address_at(state: &WalletState, index: u32) -> Result<AddressResult, Error> {
    let script = DerivedScript {
        chain: Chain::External,
        index,
        script_pubkey: state.descriptor().derive(Chain::External, index)?,
    };
    let address = script
        .address(state.network())
        .ok_or_else(|| Error::UnsupportedScriptKind(state.descriptor().kind()))?;
    Ok(AddressResult::new(address, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{History, Unspent};
    use crate::model::{Height, Tip};
    use bitcoin::block::Header as BlockHeader;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, Script};
    use std::time::Duration;

    const DESC: &str = "wpkh([73c5da0a/84'/1'/0']tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M/0/*)";

    struct EmptyChain;

    impl BlockchainBackend for EmptyChain {
        fn tip(&mut self) -> Result<Tip, Error> {
            Ok(Tip {
                height: 1,
                hash: BlockHash::all_zeros(),
            })
        }

        fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error> {
            Ok(tx.compute_txid())
        }

        fn get_transactions(&self, _txids: &[Txid]) -> Result<Vec<Transaction>, Error> {
            Ok(vec![])
        }

        fn get_headers(&self, _heights: &[Height]) -> Result<Vec<BlockHeader>, Error> {
            Ok(vec![])
        }

        fn get_scripts_history(&self, scripts: &[&Script]) -> Result<Vec<Vec<History>>, Error> {
            Ok(vec![vec![]; scripts.len()])
        }

        fn get_scripts_unspent(&self, scripts: &[&Script]) -> Result<Vec<Vec<Unspent>>, Error> {
            Ok(vec![vec![]; scripts.len()])
        }
    }

    fn config() -> WalletConfig {
        let mut config = WalletConfig::default_testnet();
        config.retry_backoff = Duration::from_millis(1);
        config
    }

    fn wallet() -> Wallet {
        Wallet::with_backend(config(), EmptyChain).unwrap()
    }

    #[test]
    fn test_not_initialized() {
        let wallet = wallet();
        assert_eq!(wallet.phase().unwrap(), Phase::Created);
        assert!(matches!(wallet.get_balance(), Err(Error::WalletNotInitialized)));
        assert!(matches!(wallet.get_new_address(), Err(Error::WalletNotInitialized)));
        assert!(matches!(
            wallet.get_transaction_history(),
            Err(Error::WalletNotInitialized)
        ));
        assert!(matches!(wallet.address(0), Err(Error::WalletNotInitialized)));
        assert!(matches!(wallet.sync(), Err(Error::WalletNotInitialized)));
    }

    #[test]
    fn test_initialize_errors() {
        let wallet = wallet();
        assert!(matches!(wallet.initialize("", "TESTNET"), Err(Error::EmptyDescriptor)));
        assert!(matches!(
            wallet.initialize(DESC, "mainnet"),
            Err(Error::UnsupportedNetwork(n)) if n == "mainnet"
        ));
        assert!(matches!(
            wallet.initialize(DESC, "liquid"),
            Err(Error::UnsupportedNetwork(_))
        ));
        assert!(matches!(
            wallet.initialize("wpkh(", "TESTNET"),
            Err(Error::MalformedDescriptor { .. })
        ));
        assert!(matches!(
            wallet.initialize(&DESC.replace("/0/*", "/0/1"), "TESTNET"),
            Err(Error::UnsupportedDescriptorWithoutWildcard)
        ));
        assert!(matches!(
            wallet.initialize(&DESC.replace("wpkh", "combo"), "TESTNET"),
            Err(Error::UnsupportedScriptKind(_))
        ));

        // valid descriptors without an address form
        assert!(matches!(
            wallet.initialize(&DESC.replace("wpkh", "pk"), "TESTNET"),
            Err(Error::UnsupportedScriptKind(k)) if k == "pk"
        ));
        let key = &DESC["wpkh(".len()..DESC.len() - 1];
        let bare_multi = format!(
            "multi(1,{key},0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798)"
        );
        assert!(matches!(
            wallet.initialize(&bare_multi, "TESTNET"),
            Err(Error::UnsupportedScriptKind(k)) if k == "multi"
        ));
        assert!(matches!(wallet.get_new_address(), Err(Error::WalletNotInitialized)));
        assert_eq!(wallet.phase().unwrap(), Phase::Created);

        // miniscript policies are accepted
        let policy = format!("wsh(and_v(v:pk({key}),older(144)))");
        wallet.initialize(&policy, "TESTNET").unwrap();
        let address = wallet.get_new_address().unwrap();
        assert!(address.address().to_string().starts_with("tb1q"));

        let mut config = config();
        config.allowed_networks.push(Network::Mainnet);
        let wallet = Wallet::with_backend(config, EmptyChain).unwrap();
        assert!(matches!(
            wallet.initialize(DESC, "mainnet"),
            Err(Error::DescriptorNetworkMismatch(Network::Mainnet))
        ));
    }

    #[test]
    fn test_empty_wallet() {
        let wallet = wallet();
        wallet.initialize(DESC, "testnet").unwrap();
        assert_eq!(wallet.phase().unwrap(), Phase::Initialized);

        assert_eq!(wallet.get_balance().unwrap().total(), 0);
        assert_eq!(wallet.phase().unwrap(), Phase::Synced);
        assert!(wallet.get_transaction_history().unwrap().is_empty());

        let first = wallet.get_new_address().unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(first, wallet.address(0).unwrap());
        assert!(first.address().to_string().starts_with("tb1q"));

        // reserved addresses are not returned again
        let second = wallet.get_new_address().unwrap();
        assert_eq!(second.index(), 1);

        // re-initializing keeps the reservations of the same descriptor
        wallet.initialize(DESC, "TESTNET").unwrap();
        assert_eq!(wallet.phase().unwrap(), Phase::Initialized);
        assert_eq!(wallet.get_new_address().unwrap().index(), 2);
    }

    #[test]
    fn test_send_sync() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<Wallet>();
    }
}
