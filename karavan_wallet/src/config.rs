use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const BLOCKSTREAM_MAINNET_SOCKET: &str = "blockstream.info:700";
pub const BLOCKSTREAM_TESTNET_SOCKET: &str = "electrum.blockstream.info:60002";

pub const DEFAULT_STOP_GAP: u32 = 10;
pub const DEFAULT_RETRY: u8 = 5;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The networks a wallet can be initialized on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub const ALL: [Network; 4] = [
        Network::Mainnet,
        Network::Testnet,
        Network::Signet,
        Network::Regtest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "MAINNET",
            Network::Testnet => "TESTNET",
            Network::Signet => "SIGNET",
            Network::Regtest => "REGTEST",
        }
    }

    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    /// Case insensitive, there is no fallback on unknown values
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::ALL
            .into_iter()
            .find(|n| n.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnsupportedNetwork(s.to_string()))
    }
}

/// Where the wallet fetches blockchain data from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Electrum {
        /// `ssl://host:port` or `tcp://host:port`
        url: String,

        /// Skip domain validation, only meaningful with `ssl`
        #[serde(default)]
        skip_domain_validation: bool,

        /// A socks5 proxy like `127.0.0.1:9050`
        #[serde(default)]
        socks5: Option<String>,
    },
}

impl BackendConfig {
    pub fn electrum(url: &str) -> Self {
        BackendConfig::Electrum {
            url: url.to_string(),
            skip_domain_validation: false,
            socks5: None,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        match self {
            BackendConfig::Electrum { url, socks5, .. } => {
                let _: crate::ElectrumUrl = url.parse()?;
                if let Some(proxy) = socks5 {
                    if !proxy.contains(':') {
                        return Err(Error::InvalidConfig(format!(
                            "socks5 proxy '{proxy}' misses the port"
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Where the wallet keeps its state between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Nothing is persisted, every process starts from scratch
    #[default]
    Memory,

    /// Encrypted updates are persisted under the given directory
    Filesystem { datadir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// The networks this deployment accepts in [`crate::Wallet::initialize()`]
    pub allowed_networks: Vec<Network>,

    pub backend: BackendConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Number of consecutive unused scripts after which a branch scan stops
    #[serde(default = "default_stop_gap")]
    pub stop_gap: u32,

    /// How many times a sync failing for transient reasons is retried
    #[serde(default = "default_retry")]
    pub retry: u8,

    /// Maximum duration of a single sync attempt, no limit if None
    #[serde(default, with = "opt_duration_secs")]
    pub timeout: Option<Duration>,

    /// Base of the exponential backoff between retries
    #[serde(default = "default_retry_backoff", with = "duration_millis")]
    pub retry_backoff: Duration,

    /// A descriptor for change addresses, alternative to a multipath `<0;1>` descriptor
    #[serde(default)]
    pub change_descriptor: Option<String>,
}

fn default_stop_gap() -> u32 {
    DEFAULT_STOP_GAP
}

fn default_retry() -> u8 {
    DEFAULT_RETRY
}

fn default_retry_backoff() -> Duration {
    DEFAULT_RETRY_BACKOFF
}

impl WalletConfig {
    fn with_backend(network: Network, backend: BackendConfig) -> Self {
        Self {
            allowed_networks: vec![network],
            backend,
            storage: StorageConfig::Memory,
            stop_gap: DEFAULT_STOP_GAP,
            retry: DEFAULT_RETRY,
            timeout: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            change_descriptor: None,
        }
    }

    pub fn default_mainnet() -> Self {
        Self::with_backend(
            Network::Mainnet,
            BackendConfig::electrum(&format!("ssl://{BLOCKSTREAM_MAINNET_SOCKET}")),
        )
    }

    pub fn default_testnet() -> Self {
        Self::with_backend(
            Network::Testnet,
            BackendConfig::electrum(&format!("ssl://{BLOCKSTREAM_TESTNET_SOCKET}")),
        )
    }

    /// For signet and regtest there are no reasonable default for the electrum url
    /// It will be caller responsability to give one according to the environment
    pub fn default_signet(electrum_url: &str) -> Self {
        Self::with_backend(Network::Signet, BackendConfig::electrum(electrum_url))
    }

    pub fn default_regtest(electrum_url: &str) -> Self {
        let mut config = Self::with_backend(Network::Regtest, BackendConfig::electrum(electrum_url));
        // Retry faster while testing
        config.retry_backoff = Duration::from_millis(100);
        config
    }

    /// Parse a json config, the result is validated
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: WalletConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.allowed_networks.is_empty() {
            return Err(Error::InvalidConfig("no allowed networks".into()));
        }
        if self.stop_gap == 0 {
            return Err(Error::InvalidConfig("stop gap must be at least 1".into()));
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(Error::InvalidConfig("timeout must be positive".into()));
            }
        }
        if let Some(change) = self.change_descriptor.as_ref() {
            if change.trim().is_empty() {
                return Err(Error::InvalidConfig("change descriptor is empty".into()));
            }
        }
        self.backend.validate()
    }

    /// Resolve a network name accepting only the ones allowed in this deployment
    pub fn network(&self, name: &str) -> Result<Network, Error> {
        let network: Network = name.parse()?;
        if self.allowed_networks.contains(&network) {
            Ok(network)
        } else {
            Err(Error::UnsupportedNetwork(name.to_string()))
        }
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
