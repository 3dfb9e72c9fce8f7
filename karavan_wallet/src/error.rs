use crate::descriptor::Chain;

/// Error type for the whole crate.
#[derive(thiserror::Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    #[error("{0}")]
    Generic(String),

    #[error("Aes {0}")]
    Aes(String),

    #[error("Malformed descriptor at position {position} ('{token}'): {reason}")]
    MalformedDescriptor {
        position: usize,
        token: String,
        reason: String,
    },

    #[error("Descriptor is empty")]
    EmptyDescriptor,

    #[error("Script kind '{0}' is not supported")]
    UnsupportedScriptKind(String),

    #[error("Unsupported network '{0}'")]
    UnsupportedNetwork(String),

    #[error("Descriptor without wildcard not supported")]
    UnsupportedDescriptorWithoutWildcard,

    #[error("Descriptor keys are for a different network than {0}")]
    DescriptorNetworkMismatch(crate::Network),

    #[error("Descriptor has no {0:?} branch")]
    MissingBranch(Chain),

    #[error("Wallet not initialized")]
    WalletNotInitialized,

    #[error("Sync unavailable after {attempts} attempts, last error: {last_error}")]
    SyncUnavailable { attempts: u32, last_error: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout elapsed while syncing")]
    Timeout,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Update has a script at {chain:?}/{index} not contiguous with the {cached} cached ones")]
    NonContiguousScript {
        chain: Chain,
        index: u32,
        cached: u32,
    },

    #[error("Update has a script at {chain:?}/{index} different from the cached one")]
    ConflictingScript { chain: Chain, index: u32 },

    #[error("The wallet status {wallet_status} is different from the one of the update {update_status}")]
    UpdateOnDifferentStatus {
        wallet_status: u64,
        update_status: u64,
    },

    #[error(transparent)]
    Miniscript(#[from] miniscript::Error),

    #[error(transparent)]
    DescConversion(#[from] miniscript::descriptor::ConversionError),

    #[error(transparent)]
    JsonFrom(#[from] serde_json::Error),

    #[error(transparent)]
    StdIOError(#[from] std::io::Error),

    #[error(transparent)]
    Url(#[from] crate::UrlError),

    #[error(transparent)]
    PersistError(#[from] crate::persister::PersistError),
}

impl Error {
    /// Whether the error is worth a retry: connectivity problems and timeouts are, malformed
    /// responses and local errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout)
    }
}

#[cfg(feature = "electrum")]
impl From<electrum_client::Error> for Error {
    fn from(err: electrum_client::Error) -> Self {
        use electrum_client::Error as E;
        match err {
            E::AllAttemptsErrored(mut errors) => match errors.pop() {
                Some(last) => last.into(),
                None => Error::Transport("all attempts errored".into()),
            },
            E::JSON(_) | E::Hex(_) | E::Bitcoin(_) | E::InvalidResponse(_) | E::Protocol(_) => {
                Error::ProtocolError(err.to_string())
            }
            _ => Error::Transport(err.to_string()),
        }
    }
}

// cannot derive automatically with this error because of trait bound
impl From<aes_gcm_siv::aead::Error> for Error {
    fn from(err: aes_gcm_siv::aead::Error) -> Self {
        Self::Aes(err.to_string())
    }
}
