use crate::model::{Height, Tip};
use crate::{ElectrumUrl, Error};
use bitcoin::block::Header as BlockHeader;
use bitcoin::{OutPoint, Script, Transaction, Txid};
use electrum_client::{
    Client, ConfigBuilder, ElectrumApi, GetHistoryRes, HeaderNotification, ListUnspentRes,
    Socks5Config,
};
use std::fmt::Debug;

use super::{History, Unspent};

/// A client to issue TCP requests to an electrum server.
pub struct ElectrumClient {
    client: Client,

    tip: Tip,
}

impl Debug for ElectrumClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectrumClient")
            .field("tip", &self.tip)
            .finish()
    }
}

#[derive(Default, Debug, Clone)]
pub struct ElectrumOptions {
    /// Socket timeout in seconds
    pub timeout: Option<u8>,

    /// A socks5 proxy like `127.0.0.1:9050`
    pub socks5: Option<String>,
}

fn build_client(url: &ElectrumUrl, options: &ElectrumOptions) -> Result<Client, Error> {
    // retries are driven by the sync loop, which tells transient errors from protocol ones
    let builder = ConfigBuilder::new()
        .retry(0)
        .validate_domain(url.validate_domain())
        .timeout(options.timeout)
        .socks5(options.socks5.as_ref().map(Socks5Config::new));
    Ok(Client::from_config(&url.to_string(), builder.build())?)
}

fn to_tip(notification: HeaderNotification) -> Tip {
    Tip {
        height: notification.height as Height,
        hash: notification.header.block_hash(),
    }
}

impl ElectrumClient {
    /// Creates an Electrum client with default options
    pub fn new(url: &ElectrumUrl) -> Result<Self, Error> {
        Self::with_options(url, ElectrumOptions::default())
    }

    /// Creates an Electrum client specifying non default options like timeout
    pub fn with_options(url: &ElectrumUrl, options: ElectrumOptions) -> Result<Self, Error> {
        let client = build_client(url, &options)?;
        let tip = to_tip(client.block_headers_subscribe()?);
        log::debug!("connected to {url}, tip at {}", tip.height);

        Ok(Self { client, tip })
    }
}

impl super::BlockchainBackend for ElectrumClient {
    fn tip(&mut self) -> Result<Tip, Error> {
        let mut popped_header = None;
        while let Some(header) = self.client.block_headers_pop()? {
            popped_header = Some(header)
        }

        match popped_header {
            Some(header) => self.tip = to_tip(header),
            None => {
                // https://github.com/bitcoindevkit/rust-electrum-client/issues/124
                // It might be that the client has reconnected and subscriptions don't persist
                // across connections. Calling `client.ping()` won't help here because the
                // successful retry will prevent us knowing about the reconnect.
                if let Ok(header) = self.client.block_headers_subscribe() {
                    self.tip = to_tip(header);
                }
            }
        }

        Ok(self.tip)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error> {
        Ok(self.client.transaction_broadcast(tx)?)
    }

    fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error> {
        Ok(self.client.batch_transaction_get(txids)?)
    }

    fn get_headers(&self, heights: &[Height]) -> Result<Vec<BlockHeader>, Error> {
        Ok(self.client.batch_block_header(heights)?)
    }

    fn get_scripts_history(&self, scripts: &[&Script]) -> Result<Vec<Vec<History>>, Error> {
        Ok(self
            .client
            .batch_script_get_history(scripts)?
            .into_iter()
            .map(|e| e.into_iter().map(Into::into).collect())
            .collect())
    }

    fn get_scripts_unspent(&self, scripts: &[&Script]) -> Result<Vec<Vec<Unspent>>, Error> {
        self.client
            .batch_script_list_unspent(scripts)?
            .into_iter()
            .map(|e| e.into_iter().map(TryInto::try_into).collect())
            .collect()
    }
}

impl From<GetHistoryRes> for History {
    fn from(value: GetHistoryRes) -> Self {
        History {
            txid: value.tx_hash,
            height: value.height,
        }
    }
}

impl TryFrom<ListUnspentRes> for Unspent {
    type Error = Error;

    fn try_from(value: ListUnspentRes) -> Result<Self, Self::Error> {
        let invalid = |what: &str| {
            Error::ProtocolError(format!("invalid {what} for unspent of {}", value.tx_hash))
        };
        Ok(Unspent {
            outpoint: OutPoint::new(
                value.tx_hash,
                u32::try_from(value.tx_pos).map_err(|_| invalid("position"))?,
            ),
            value: value.value,
            height: i32::try_from(value.height).map_err(|_| invalid("height"))?,
        })
    }
}
