use crate::init_logging;

use electrsd::bitcoind;
use electrsd::electrum_client::ElectrumApi;
use electrsd::ElectrsD;

use bitcoind::bitcoincore_rpc::{Client, RpcApi};
use bitcoind::BitcoinD;

use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

/// Configure and start the test environment
pub struct TestEnvBuilder {
    bitcoind_exec: String,
    electrs_exec: String,
}

impl TestEnvBuilder {
    /// Create TestEnvBuilder reading from environment variables
    ///
    /// * BITCOIND_EXEC
    /// * ELECTRS_EXEC
    pub fn from_env() -> Self {
        Self {
            bitcoind_exec: std::env::var("BITCOIND_EXEC").unwrap_or_default(),
            electrs_exec: std::env::var("ELECTRS_EXEC").unwrap_or_default(),
        }
    }

    /// Whether the executables are available
    pub fn is_available(&self) -> bool {
        !self.bitcoind_exec.is_empty() && !self.electrs_exec.is_empty()
    }

    pub fn build(self) -> TestEnv {
        assert!(
            self.is_available(),
            "set BITCOIND_EXEC and ELECTRS_EXEC to run the regtest environment"
        );
        init_logging();
        let view_stdout = std::env::var("RUST_LOG").is_ok();

        let mut bitcoind_conf = bitcoind::Conf::default();
        bitcoind_conf.view_stdout = view_stdout;
        let bitcoind = BitcoinD::with_conf(&self.bitcoind_exec, &bitcoind_conf).unwrap();
        TestEnv::generate_(&bitcoind.client, 101);

        let mut electrs_conf = electrsd::Conf::default();
        electrs_conf.view_stderr = view_stdout;
        electrs_conf.http_enabled = false;
        electrs_conf.network = "regtest";
        let electrsd = ElectrsD::with_conf(&self.electrs_exec, &bitcoind, &electrs_conf).unwrap();
        electrsd.trigger().unwrap();

        let env = TestEnv { bitcoind, electrsd };
        env.wait_height(101);
        log::info!("regtest environment ready at {}", env.electrum_url());
        env
    }
}

/// Test environment with a regtest Bitcoin node and an Electrum server
///
/// Use `TestEnvBuilder` to configure and build
pub struct TestEnv {
    bitcoind: BitcoinD,
    electrsd: ElectrsD,
}

impl TestEnv {
    pub fn electrum_url(&self) -> String {
        format!("tcp://{}", self.electrsd.electrum_url)
    }

    fn getnewaddress_(client: &Client) -> bitcoin::Address {
        let addr: Value = client
            .call("getnewaddress", &["label".into(), "bech32".into()])
            .unwrap();
        bitcoin::Address::from_str(addr.as_str().unwrap())
            .unwrap()
            .assume_checked()
    }

    fn generate_(client: &Client, block_num: u32) {
        let address = Self::getnewaddress_(client).to_string();
        client
            .call::<Value>("generatetoaddress", &[block_num.into(), address.into()])
            .unwrap();
    }

    pub fn height(&self) -> u64 {
        self.bitcoind
            .client
            .call::<Value>("getblockcount", &[])
            .unwrap()
            .as_u64()
            .unwrap()
    }

    /// Mine blocks and wait for the Electrum server to index them
    pub fn generate(&self, blocks: u32) {
        log::debug!("mining {blocks} blocks");
        let target = self.height() + blocks as u64;
        Self::generate_(&self.bitcoind.client, blocks);
        self.electrsd.trigger().unwrap();
        self.wait_height(target);
    }

    fn wait_height(&self, height: u64) {
        let mut i = 120;
        loop {
            assert!(i > 0, "1 minute without updates");
            i -= 1;
            let current = self
                .electrsd
                .client
                .block_headers_subscribe_raw()
                .unwrap()
                .height;
            if current as u64 >= height {
                break;
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    pub fn sendtoaddress(&self, address: &bitcoin::Address, satoshi: u64) -> bitcoin::Txid {
        let btc = sat2btc(satoshi);
        let r = self
            .bitcoind
            .client
            .call::<Value>("sendtoaddress", &[address.to_string().into(), btc.into()])
            .unwrap();
        self.electrsd.trigger().unwrap();
        bitcoin::Txid::from_str(r.as_str().unwrap()).unwrap()
    }
}

fn sat2btc(sat: u64) -> String {
    let amount = bitcoin::Amount::from_sat(sat);
    amount.to_string_in(bitcoin::amount::Denomination::Bitcoin)
}
