//! Synchronization of a [`WalletState`] with a chain backend.
//!
//! A sync is a full scan of the wallet scripts (see [`BlockchainBackend::full_scan()`]) repeated
//! while it fails for transient reasons, up to the configured retry budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::{Transaction, Txid};

use crate::clients::BlockchainBackend;
use crate::config::{BackendConfig, WalletConfig, DEFAULT_RETRY, DEFAULT_RETRY_BACKOFF, DEFAULT_STOP_GAP};
use crate::store::WalletState;
use crate::update::Update;
use crate::Error;

/// Receives the advancement of a scan
pub trait Progress {
    /// `progress` goes from 0.0 to 1.0
    fn update(&self, progress: f32, message: &str);
}

/// Drops every progress event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn update(&self, _progress: f32, _message: &str) {}
}

/// The instant after which a sync attempt gives up
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline `timeout` from now, or never if None
    pub fn after(timeout: Option<Duration>) -> Self {
        Deadline(timeout.map(|t| Instant::now() + t))
    }

    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn check(&self) -> Result<(), Error> {
        match self.0 {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout),
            _ => Ok(()),
        }
    }
}

/// Parameters of a single scan
pub struct ScanContext<'a> {
    /// Number of consecutive unused scripts after which a chain scan stops
    pub stop_gap: u32,

    pub deadline: Deadline,

    pub progress: &'a dyn Progress,
}

impl ScanContext<'static> {
    pub fn new(stop_gap: u32) -> Self {
        ScanContext {
            stop_gap,
            deadline: Deadline::none(),
            progress: &NullProgress,
        }
    }
}

impl<'a> ScanContext<'a> {
    pub fn with_deadline(self, deadline: Deadline) -> Self {
        Self { deadline, ..self }
    }

    pub fn with_progress<'b>(self, progress: &'b dyn Progress) -> ScanContext<'b> {
        ScanContext {
            stop_gap: self.stop_gap,
            deadline: self.deadline,
            progress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub stop_gap: u32,

    /// Number of retries after the first attempt
    pub retry: u8,

    /// Bounds every attempt
    pub timeout: Option<Duration>,

    pub retry_backoff: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            stop_gap: DEFAULT_STOP_GAP,
            retry: DEFAULT_RETRY,
            timeout: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl From<&WalletConfig> for SyncOptions {
    fn from(config: &WalletConfig) -> Self {
        Self {
            stop_gap: config.stop_gap,
            retry: config.retry,
            timeout: config.timeout,
            retry_backoff: config.retry_backoff,
        }
    }
}

/// Wait before the retry following the failed `attempt` (starting at 0)
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

type DynBackend = Box<dyn BlockchainBackend + Send>;

enum Source {
    /// Given by the caller, kept across failures
    Injected(DynBackend),

    /// Connected on first use and dropped after a transient failure
    #[cfg(feature = "electrum")]
    Electrum {
        url: crate::ElectrumUrl,
        options: crate::clients::electrum_client::ElectrumOptions,
        client: Option<DynBackend>,
    },
}

/// Keeps the connection to the chain backend and runs syncs with retries
pub struct ChainSync {
    source: Source,
    options: SyncOptions,
    progress: Arc<dyn Progress + Send + Sync>,
}

impl std::fmt::Debug for ChainSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSync")
            .field("options", &self.options)
            .finish()
    }
}

impl ChainSync {
    /// Use the given backend
    pub fn with_backend<B: BlockchainBackend + Send + 'static>(
        backend: B,
        options: SyncOptions,
    ) -> Self {
        Self {
            source: Source::Injected(Box::new(backend)),
            options,
            progress: Arc::new(NullProgress),
        }
    }

    /// Connect to the configured backend lazily, on the first sync
    pub fn from_config(config: &WalletConfig) -> Result<Self, Error> {
        config.validate()?;
        let source = match &config.backend {
            #[cfg(feature = "electrum")]
            BackendConfig::Electrum {
                url,
                skip_domain_validation,
                socks5,
            } => {
                let mut url: crate::ElectrumUrl = url.parse()?;
                if *skip_domain_validation {
                    url = url.without_domain_validation();
                }
                let options = crate::clients::electrum_client::ElectrumOptions {
                    timeout: config
                        .timeout
                        .map(|t| t.as_secs().clamp(1, u8::MAX as u64) as u8),
                    socks5: socks5.clone(),
                };
                Source::Electrum {
                    url,
                    options,
                    client: None,
                }
            }
            #[cfg(not(feature = "electrum"))]
            BackendConfig::Electrum { .. } => {
                return Err(Error::InvalidConfig(
                    "electrum backend requires the `electrum` feature".into(),
                ))
            }
        };
        Ok(Self {
            source,
            options: config.into(),
            progress: Arc::new(NullProgress),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress + Send + Sync>) -> Self {
        self.set_progress(progress);
        self
    }

    pub fn set_progress(&mut self, progress: Arc<dyn Progress + Send + Sync>) {
        self.progress = progress;
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    fn backend(&mut self) -> Result<&mut DynBackend, Error> {
        match &mut self.source {
            Source::Injected(backend) => Ok(backend),
            #[cfg(feature = "electrum")]
            Source::Electrum {
                url,
                options,
                client,
            } => {
                if client.is_none() {
                    log::info!("connecting to {url}");
                    let electrum =
                        crate::ElectrumClient::with_options(url, options.clone())?;
                    *client = Some(Box::new(electrum));
                }
                client
                    .as_mut()
                    .ok_or_else(|| Error::Generic("electrum client not connected".into()))
            }
        }
    }

    /// Drop the connection, the next attempt reconnects
    fn reset(&mut self) {
        match &mut self.source {
            Source::Injected(_) => {}
            #[cfg(feature = "electrum")]
            Source::Electrum { client, .. } => {
                if client.take().is_some() {
                    log::debug!("electrum connection dropped");
                }
            }
        }
    }

    fn attempt(&mut self, state: &WalletState) -> Result<Update, Error> {
        let deadline = Deadline::after(self.options.timeout);
        let progress = self.progress.clone();
        let ctx = ScanContext::new(self.options.stop_gap)
            .with_deadline(deadline)
            .with_progress(progress.as_ref());
        let backend = self.backend()?;
        deadline.check()?;
        let update = backend.full_scan(state, &ctx)?;
        // the last backend call may have overrun the deadline
        deadline.check()?;
        Ok(update)
    }

    /// Scan the blockchain for the wallet scripts, retrying on transient failures
    ///
    /// Returns the update to apply to the given state. Fails with [`Error::SyncUnavailable`] if
    /// every attempt failed for transient reasons, or immediately for other errors such as
    /// [`Error::ProtocolError`].
    pub fn sync(&mut self, state: &WalletState) -> Result<Update, Error> {
        let attempts = self.options.retry as u32 + 1;
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let wait = backoff(self.options.retry_backoff, attempt - 1);
                log::info!("retrying sync in {wait:?}, attempt {} of {attempts}", attempt + 1);
                std::thread::sleep(wait);
            }
            let start = Instant::now();
            match self.attempt(state) {
                Ok(update) => {
                    log::info!(
                        "sync completed in {:?} at attempt {}",
                        start.elapsed(),
                        attempt + 1
                    );
                    return Ok(update);
                }
                Err(e) if e.is_transient() => {
                    log::warn!("sync attempt {} of {attempts} failed: {e}", attempt + 1);
                    self.reset();
                    last_error = Some(e);
                }
                Err(e) => {
                    log::warn!("sync failed: {e}");
                    return Err(e);
                }
            }
        }
        Err(Error::SyncUnavailable {
            attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Broadcast a transaction, without retries
    pub fn broadcast(&mut self, tx: &Transaction) -> Result<Txid, Error> {
        let result = self.backend().and_then(|backend| backend.broadcast(tx));
        if matches!(&result, Err(e) if e.is_transient()) {
            self.reset();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{History, Unspent};
    use crate::model::{Height, Tip};
    use crate::{Network, WalletDescriptor};
    use bitcoin::block::Header as BlockHeader;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, Script};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const DESC: &str = "wpkh([73c5da0a/84'/1'/0']tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M/<0;1>/*)";

    /// A chain without wallet activity failing the first calls
    #[derive(Default)]
    struct EmptyChain {
        fail_transport: u32,
        fail_protocol: bool,
        tip_latency: Duration,
        history_latency: Duration,
        calls: Arc<AtomicU32>,
    }

    impl BlockchainBackend for EmptyChain {
        fn tip(&mut self) -> Result<Tip, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_transport > 0 {
                self.fail_transport -= 1;
                return Err(Error::Transport("connection refused".into()));
            }
            std::thread::sleep(self.tip_latency);
            Ok(Tip {
                height: 10,
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
            if self.fail_protocol {
                return Ok(vec![]);
            }
            std::thread::sleep(self.history_latency);
            Ok(vec![vec![]; scripts.len()])
        }

        fn get_scripts_unspent(&self, scripts: &[&Script]) -> Result<Vec<Vec<Unspent>>, Error> {
            Ok(vec![vec![]; scripts.len()])
        }
    }

    fn state() -> WalletState {
        WalletState::new(Network::Testnet, WalletDescriptor::from_str(DESC).unwrap())
    }

    fn options(retry: u8) -> SyncOptions {
        SyncOptions {
            retry,
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 0), Duration::from_millis(100));
        assert_eq!(backoff(base, 1), Duration::from_millis(200));
        assert_eq!(backoff(base, 3), Duration::from_millis(800));
        assert_eq!(backoff(base, 100), backoff(base, 16));
        assert_eq!(backoff(Duration::MAX, 2), Duration::MAX);
    }

    #[test]
    fn test_deadline() {
        assert!(Deadline::none().check().is_ok());
        assert!(Deadline::after(None).check().is_ok());
        assert!(Deadline::after(Some(Duration::from_secs(60))).check().is_ok());
        assert!(matches!(
            Deadline::after(Some(Duration::ZERO)).check(),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_sync_retries_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = EmptyChain {
            fail_transport: 3,
            calls: calls.clone(),
            ..Default::default()
        };
        let mut sync = ChainSync::with_backend(chain, options(5));
        let state = state();
        let update = sync.sync(&state).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(update.tip.height, 10);
        assert_eq!(update.new_scripts.len(), 20);
        assert_eq!(update.wallet_status, state.status());
    }

    #[test]
    fn test_sync_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = EmptyChain {
            fail_transport: 10,
            calls: calls.clone(),
            ..Default::default()
        };
        let mut sync = ChainSync::with_backend(chain, options(2));
        let err = sync.sync(&state()).unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::SyncUnavailable {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("connection refused"));
            }
            e => panic!("unexpected {e:?}"),
        }
    }

    #[test]
    fn test_protocol_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = EmptyChain {
            fail_protocol: true,
            calls: calls.clone(),
            ..Default::default()
        };
        let mut sync = ChainSync::with_backend(chain, options(5));
        let err = sync.sync(&state()).unwrap_err();
        assert!(matches!(err, Error::ProtocolError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_is_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = EmptyChain {
            tip_latency: Duration::from_millis(30),
            calls: calls.clone(),
            ..Default::default()
        };
        let mut options = options(1);
        options.timeout = Some(Duration::from_millis(5));
        let mut sync = ChainSync::with_backend(chain, options);
        let err = sync.sync(&state()).unwrap_err();
        assert!(
            matches!(&err, Error::SyncUnavailable { attempts: 2, last_error } if last_error.contains("Timeout")),
            "{err:?}"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timeout_on_last_call() {
        let chain = EmptyChain {
            history_latency: Duration::from_millis(500),
            ..Default::default()
        };
        let mut options = options(0);
        options.stop_gap = 5;
        options.timeout = Some(Duration::from_millis(100));
        let mut sync = ChainSync::with_backend(chain, options);

        // a single history batch, nothing is requested after it
        let desc = WalletDescriptor::from_str(&DESC.replace("<0;1>", "0")).unwrap();
        let state = WalletState::new(Network::Testnet, desc);
        let err = sync.sync(&state).unwrap_err();
        assert!(
            matches!(&err, Error::SyncUnavailable { attempts: 1, last_error } if last_error.contains("Timeout")),
            "{err:?}"
        );
    }

    #[test]
    fn test_progress() {
        struct Recorder(Mutex<Vec<f32>>);
        impl Progress for Recorder {
            fn update(&self, progress: f32, _message: &str) {
                self.0.lock().unwrap().push(progress);
            }
        }
        let recorder = Arc::new(Recorder(Mutex::new(vec![])));
        let mut sync = ChainSync::with_backend(EmptyChain::default(), options(0))
            .with_progress(recorder.clone());
        sync.sync(&state()).unwrap();
        let events = recorder.0.lock().unwrap().clone();
        assert!(!events.is_empty());
        assert!(events.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(events.last(), Some(&1.0));
    }

    #[test]
    fn test_from_config() {
        let config = WalletConfig::default_regtest("tcp://127.0.0.1:50001");
        let sync = ChainSync::from_config(&config).unwrap();
        assert_eq!(sync.options().stop_gap, 10);
        assert_eq!(sync.options().retry, 5);

        let mut config = WalletConfig::default_regtest("http://127.0.0.1:50001");
        assert!(ChainSync::from_config(&config).is_err());
        config.backend = BackendConfig::electrum("ssl://127.0.0.1:50001");
        assert!(ChainSync::from_config(&config).is_err());
    }
}
