#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::CommandFactory;
use karavan_wallet::{BackendConfig, StorageConfig, Wallet, WalletConfig};
use serde_json::Value;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

use crate::args::{CliCommand, Network};
pub use args::Cli;

mod args;
pub mod response;

/// The wallet configuration given by the config file or the network defaults, with the
/// command line overrides applied
pub fn build_config(args: &Cli) -> anyhow::Result<WalletConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read config file {path:?}"))?;
            WalletConfig::from_json(&json)?
        }
        None => match args.network {
            Network::Mainnet => WalletConfig::default_mainnet(),
            Network::Testnet => WalletConfig::default_testnet(),
            Network::Signet | Network::Regtest => {
                let url = args.electrum_url.as_ref().ok_or_else(|| {
                    anyhow!("on {} you have to specify --electrum-url", args.network)
                })?;
                match args.network {
                    Network::Signet => WalletConfig::default_signet(url),
                    _ => WalletConfig::default_regtest(url),
                }
            }
        },
    };
    if let Some(url) = &args.electrum_url {
        config.backend = BackendConfig::electrum(url);
    }
    if let Some(datadir) = &args.datadir {
        config.storage = StorageConfig::Filesystem {
            datadir: datadir.clone(),
        };
    }
    if let Some(stop_gap) = args.stop_gap {
        config.stop_gap = stop_gap;
    }
    if let Some(retry) = args.retry {
        config.retry = retry;
    }
    if let Some(timeout) = args.timeout {
        config.timeout = Some(Duration::from_secs(timeout));
    }
    config.validate()?;
    Ok(config)
}

pub fn inner_main(args: Cli) -> anyhow::Result<Value> {
    let (appender, _guard) = tracing_appender::non_blocking(std::io::stderr());
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(appender)
        .finish();
    // also forwards the `log` records of the wallet library
    match subscriber.try_init() {
        Ok(_) => tracing::info!("logging initialized"),
        Err(_) => tracing::debug!("logging already initialized"),
    }

    tracing::info!("CLI initialized with args: {:?}", args);

    if let CliCommand::GenerateCompletion { shell } = args.command {
        let mut result = vec![];
        clap_complete::generate(shell, &mut Cli::command(), "karavan", &mut result);
        let s = String::from_utf8(result)?;
        return Ok(Value::String(s));
    }

    let descriptor = args
        .descriptor
        .as_deref()
        .ok_or_else(|| anyhow!("specify the wallet with --descriptor"))?;
    let config = build_config(&args)?;
    let wallet = Wallet::new(config)?;
    wallet
        .initialize(descriptor, &args.network.to_string())
        .with_context(|| format!("Cannot load the wallet on {}", args.network))?;

    Ok(match args.command {
        CliCommand::Balance => {
            let balance: response::Balance = wallet.get_balance()?.into();
            serde_json::to_value(balance)?
        }
        CliCommand::Address { index } => {
            let address: response::Address = match index {
                Some(index) => wallet.address(index)?,
                None => wallet.get_new_address()?,
            }
            .into();
            serde_json::to_value(address)?
        }
        CliCommand::Transactions => {
            let transactions = wallet
                .get_transaction_history()?
                .into_iter()
                .map(Into::into)
                .collect();
            serde_json::to_value(response::Transactions { transactions })?
        }
        CliCommand::Utxos => {
            wallet.sync()?;
            let utxos = wallet.utxos()?.into_iter().map(Into::into).collect();
            serde_json::to_value(response::Utxos { utxos })?
        }
        CliCommand::GenerateCompletion { .. } => Value::Null,
    })
}
