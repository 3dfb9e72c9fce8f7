extern crate karavan_wallet;

use karavan_wallet::{Confirmation, Wallet, WalletConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This example creates a testnet watch only wallet from a descriptor
    // and prints a list of its transactions.
    // Run this example with cargo:
    // cargo run --example list_transactions

    let desc = "wpkh([73c5da0a/84'/1'/0']tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M/<0;1>/*)";

    // The default testnet config connects to a public Electrum server
    let wallet = Wallet::new(WalletConfig::default_testnet())?;
    wallet.initialize(desc, "TESTNET")?;

    // Every query syncs the wallet first
    let balance = wallet.get_balance()?;
    println!(
        "balance: {} sat ({} unconfirmed)",
        balance.total(),
        balance.unconfirmed
    );

    // Print a summary of the wallet transactions, most recent first
    for tx in wallet.get_transaction_history()?.into_iter().rev() {
        let when = match tx.confirmation {
            Confirmation::Confirmed { height, .. } => format!("height {height}"),
            Confirmation::Unconfirmed => "unconfirmed".to_string(),
        };
        println!("TXID: {} ({when})", tx.txid);
        if tx.delta > 0 {
            println!(" * received: {} sat", tx.delta);
        } else {
            println!(" * sent:     {} sat", -tx.delta);
        }
    }
    Ok(())
}
