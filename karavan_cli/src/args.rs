use std::{fmt::Display, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        };
        write!(f, "{s}")
    }
}

/// A bitcoin watch-only wallet defined by an output descriptor, synced from an Electrum server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Network
    #[arg(short, long, default_value = "testnet")]
    pub network: Network,

    /// The descriptor of the wallet, eg. `wpkh(tpub.../<0;1>/*)`
    #[arg(short, long, env = "KARAVAN_DESCRIPTOR")]
    pub descriptor: Option<String>,

    /// A JSON file with the wallet configuration, replacing the network defaults
    #[arg(long, env = "KARAVAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Electrum server, eg. `ssl://electrum.blockstream.info:60002` or `tcp://127.0.0.1:50001`
    #[arg(long, env = "KARAVAN_ELECTRUM_URL")]
    pub electrum_url: Option<String>,

    /// Where encrypted wallet data is persisted, nothing is persisted if missing
    #[arg(long)]
    pub datadir: Option<PathBuf>,

    /// Number of consecutive unused addresses after which the scan stops
    #[arg(long)]
    pub stop_gap: Option<u32>,

    /// How many times a failing sync is retried
    #[arg(long)]
    pub retry: Option<u8>,

    /// Maximum duration of a sync attempt in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// The sub command
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Sync and show the balance in satoshi
    Balance,

    /// Sync and return a never used address
    Address {
        /// Show the address at the given index instead, without syncing
        #[arg(long)]
        index: Option<u32>,
    },

    /// Sync and list the wallet transactions, ordered by confirmation height
    Transactions,

    /// List the unspent outputs as of the last sync
    Utxos,

    #[clap(hide = true)]
    GenerateCompletion { shell: Shell },
}
