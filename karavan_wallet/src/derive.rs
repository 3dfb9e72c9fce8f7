use bitcoin::{Address, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::descriptor::{Chain, WalletDescriptor};
use crate::{Error, Network};

/// A script derived from the wallet descriptor at a given chain and index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivedScript {
    pub chain: Chain,
    pub index: u32,
    pub script_pubkey: ScriptBuf,
}

impl DerivedScript {
    /// The address encoding of the script, None for scripts without one (eg. `pk()` or bare multisig)
    pub fn address(&self, network: Network) -> Option<Address> {
        Address::from_script(&self.script_pubkey, network.bitcoin_network()).ok()
    }
}

/// The scripts derived so far, per chain, contiguous from index 0
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScriptCache {
    external: Vec<ScriptBuf>,
    internal: Vec<ScriptBuf>,
}

impl ScriptCache {
    fn scripts(&self, chain: Chain) -> &Vec<ScriptBuf> {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    fn scripts_mut(&mut self, chain: Chain) -> &mut Vec<ScriptBuf> {
        match chain {
            Chain::External => &mut self.external,
            Chain::Internal => &mut self.internal,
        }
    }

    /// Number of scripts cached for the chain
    pub fn len(&self, chain: Chain) -> u32 {
        self.scripts(chain).len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.external.is_empty() && self.internal.is_empty()
    }

    pub fn get(&self, chain: Chain, index: u32) -> Option<&ScriptBuf> {
        self.scripts(chain).get(index as usize)
    }

    /// Derive the scripts with index in `[0, count)` for the given chain
    ///
    /// Previously derived scripts are kept as they are, only the missing ones are derived and
    /// returned. Nothing is cached if any derivation fails.
    pub fn derive_up_to(
        &mut self,
        descriptor: &WalletDescriptor,
        chain: Chain,
        count: u32,
    ) -> Result<Vec<DerivedScript>, Error> {
        let desc = descriptor.descriptor(chain)?;
        let start = self.len(chain);
        let new = (start..count)
            .map(|index| {
                Ok(DerivedScript {
                    chain,
                    index,
                    script_pubkey: desc.at_derivation_index(index)?.script_pubkey(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        self.scripts_mut(chain)
            .extend(new.iter().map(|d| d.script_pubkey.clone()));
        if !new.is_empty() {
            log::debug!("derived {chain:?} scripts from {start} to {count}");
        }
        Ok(new)
    }

    /// Insert a script computed elsewhere, for example in an update.
    ///
    /// Returns false if the same script was already cached.
    pub fn insert(&mut self, script: &DerivedScript) -> Result<bool, Error> {
        let scripts = self.scripts_mut(script.chain);
        let cached = scripts.len() as u32;
        match scripts.get(script.index as usize) {
            Some(existing) if *existing == script.script_pubkey => Ok(false),
            Some(_) => Err(Error::ConflictingScript {
                chain: script.chain,
                index: script.index,
            }),
            None if script.index == cached => {
                scripts.push(script.script_pubkey.clone());
                Ok(true)
            }
            None => Err(Error::NonContiguousScript {
                chain: script.chain,
                index: script.index,
                cached,
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = DerivedScript> + '_ {
        Chain::ALL.into_iter().flat_map(move |chain| {
            self.scripts(chain)
                .iter()
                .enumerate()
                .map(move |(index, script_pubkey)| DerivedScript {
                    chain,
                    index: index as u32,
                    script_pubkey: script_pubkey.clone(),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const DESC: &str = "wpkh([73c5da0a/84'/1'/0']tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M/<0;1>/*)";

    #[test]
    fn test_derive_up_to_is_monotonic() {
        let desc = WalletDescriptor::from_str(DESC).unwrap();
        let mut cache = ScriptCache::default();

        let first = cache.derive_up_to(&desc, Chain::External, 5).unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(cache.len(Chain::External), 5);
        assert_eq!(cache.len(Chain::Internal), 0);

        let second = cache.derive_up_to(&desc, Chain::External, 12).unwrap();
        assert_eq!(second.len(), 7);
        assert_eq!(second[0].index, 5);

        let mut other = ScriptCache::default();
        let all = other.derive_up_to(&desc, Chain::External, 12).unwrap();
        assert_eq!(&all[..5], &first[..]);
        assert_eq!(&all[5..], &second[..]);

        // asking less than cached is a no-op
        assert!(cache.derive_up_to(&desc, Chain::External, 3).unwrap().is_empty());
        assert_eq!(cache, other);

        for d in all {
            assert_eq!(desc.derive(d.chain, d.index).unwrap(), d.script_pubkey);
        }
    }

    #[test]
    fn test_failed_derivation_caches_nothing() {
        let desc = WalletDescriptor::from_str(&DESC.replace("<0;1>", "0")).unwrap();
        let mut cache = ScriptCache::default();
        let err = cache.derive_up_to(&desc, Chain::Internal, 3).unwrap_err();
        assert!(matches!(err, Error::MissingBranch(Chain::Internal)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert() {
        let desc = WalletDescriptor::from_str(DESC).unwrap();
        let mut derived = ScriptCache::default();
        let scripts = derived.derive_up_to(&desc, Chain::Internal, 3).unwrap();

        let mut cache = ScriptCache::default();
        let err = cache.insert(&scripts[1]).unwrap_err();
        assert!(matches!(err, Error::NonContiguousScript { index: 1, cached: 0, .. }));
        assert!(cache.insert(&scripts[0]).unwrap());
        assert!(!cache.insert(&scripts[0]).unwrap());
        let mut wrong = scripts[1].clone();
        wrong.index = 0;
        assert!(matches!(
            cache.insert(&wrong),
            Err(Error::ConflictingScript { index: 0, .. })
        ));
        assert_eq!(cache.iter().count(), 1);
    }

    #[test]
    fn test_address() {
        let desc = WalletDescriptor::from_str(DESC).unwrap();
        let mut cache = ScriptCache::default();
        let scripts = cache.derive_up_to(&desc, Chain::External, 1).unwrap();
        let address = scripts[0].address(Network::Testnet).unwrap();
        assert!(address.to_string().starts_with("tb1q"));
        let address = scripts[0].address(Network::Regtest).unwrap();
        assert!(address.to_string().starts_with("bcrt1q"));

        let pk = "pk(0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798)";
        let desc = WalletDescriptor::from_str(pk).unwrap();
        let script = DerivedScript {
            chain: Chain::External,
            index: 0,
            script_pubkey: desc.derive(Chain::External, 0).unwrap(),
        };
        assert!(script.address(Network::Testnet).is_none());
    }
}
