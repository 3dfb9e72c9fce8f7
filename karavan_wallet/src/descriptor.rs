use std::fmt::Display;
use std::str::FromStr;

use aes_gcm_siv::Aes256GcmSiv;
use bitcoin::hashes::{sha256t_hash_newtype, Hash};
use bitcoin::{NetworkKind, ScriptBuf};
use miniscript::descriptor::{DescriptorType, Wildcard};
use miniscript::{Descriptor, DescriptorPublicKey, ForEachKey};
use serde::{Deserialize, Serialize};

use crate::crypto::cipher_from_key_bytes;
use crate::{Error, Network};

sha256t_hash_newtype! {
    /// The tag of the hash
    pub struct EncryptionKeyTag = hash_str("Karavan-FS-Encryption-Key/1.0");

    /// A tagged hash to generate the key for encryption in the encrypted file system persister
    #[hash_newtype(forward)]
    pub struct EncryptionKeyHash(_);
}

/// Script types with a descriptor syntax but no derivation in this wallet
const UNSUPPORTED_KINDS: [&str; 4] = ["combo", "rawtr", "addr", "raw"];

/// Fragments whose arguments are numbers or hashes, not keys
const NON_KEY_ARGS: [&str; 6] = ["older", "after", "sha256", "hash256", "ripemd160", "hash160"];

const FRAGMENTS: [&str; 27] = [
    "sh",
    "wsh",
    "pkh",
    "wpkh",
    "tr",
    "pk",
    "multi",
    "sortedmulti",
    "multi_a",
    "sortedmulti_a",
    "pk_k",
    "pk_h",
    "older",
    "after",
    "sha256",
    "hash256",
    "ripemd160",
    "hash160",
    "andor",
    "and_v",
    "and_b",
    "and_n",
    "or_b",
    "or_c",
    "or_d",
    "or_i",
    "thresh",
];

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum Chain {
    /// External address, shown when asked for a payment.
    /// Wallet having a single descriptor are considered External
    External,

    /// Internal address, used for the change
    Internal,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::External, Chain::Internal];
}

fn malformed(position: usize, token: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::MalformedDescriptor {
        position,
        token: token.into(),
        reason: reason.into(),
    }
}

/// A piece of descriptor text between `(`, `)`, `,`, `{` and `}`
#[derive(Debug)]
struct Token<'a> {
    position: usize,
    text: &'a str,

    /// The fragment this token is an argument of
    parent: Option<&'a str>,

    /// Followed by `(`
    fragment: bool,
}

/// Strip the miniscript wrappers like `v:` from a fragment name
fn base_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn check_brackets(input: &str) -> Result<(), Error> {
    let mut stack = vec![];
    for (pos, c) in input.char_indices() {
        match c {
            '(' | '[' | '<' | '{' => stack.push((pos, c)),
            ')' | ']' | '>' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    '>' => '<',
                    _ => '{',
                };
                if stack.pop().map(|(_, c)| c) != Some(open) {
                    return Err(malformed(pos, c, "unbalanced bracket"));
                }
            }
            _ => {}
        }
    }
    match stack.pop() {
        Some((pos, c)) => Err(malformed(pos, c, "bracket is never closed")),
        None => Ok(()),
    }
}

fn tokenize(body: &str) -> Result<Vec<Token<'_>>, Error> {
    let mut tokens = vec![];
    let mut parents: Vec<&str> = vec![];
    let mut start = 0;
    for (i, c) in body.char_indices() {
        if !matches!(c, '(' | ')' | ',' | '{' | '}') {
            continue;
        }
        let text = &body[start..i];
        if c == '(' {
            if text.is_empty() {
                return Err(malformed(i, "(", "expected a fragment name"));
            }
            tokens.push(Token {
                position: start,
                text,
                parent: parents.last().copied(),
                fragment: true,
            });
            parents.push(text);
        } else {
            if !text.is_empty() {
                tokens.push(Token {
                    position: start,
                    text,
                    parent: parents.last().copied(),
                    fragment: false,
                });
            } else if c == ')' && body[..i].ends_with('(') {
                return Err(malformed(i, "", "missing argument"));
            }
            if c == ')' {
                parents.pop();
            }
        }
        start = i + 1;
    }
    if start < body.len() {
        return match tokens.is_empty() {
            true => Err(malformed(0, body, "expected a script type")),
            false => Err(malformed(
                start,
                &body[start..],
                "unexpected characters after the descriptor",
            )),
        };
    }
    Ok(tokens)
}

fn hardened_free(key: &DescriptorPublicKey) -> bool {
    match key {
        DescriptorPublicKey::Single(_) => true,
        DescriptorPublicKey::XPub(x) => {
            x.wildcard != Wildcard::Hardened
                && x.derivation_path.as_ref().iter().all(|c| c.is_normal())
        }
        DescriptorPublicKey::MultiXPub(x) => {
            x.wildcard != Wildcard::Hardened
                && x.derivation_paths
                    .paths()
                    .iter()
                    .all(|p| p.as_ref().iter().all(|c| c.is_normal()))
        }
    }
}

/// Check fragment names and keys one by one, so that errors point to the offending token
fn check_tokens(tokens: &[Token<'_>]) -> Result<(), Error> {
    for token in tokens {
        if token.fragment {
            if !FRAGMENTS.contains(&base_name(token.text)) {
                return Err(malformed(token.position, token.text, "unknown fragment"));
            }
            continue;
        }
        let parent = token.parent.map(base_name).unwrap_or_default();
        if NON_KEY_ARGS.contains(&parent) || token.text.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let key_part = token.text.rsplit(']').next().unwrap_or(token.text);
        if key_part.starts_with("xprv") || key_part.starts_with("tprv") {
            return Err(malformed(
                token.position,
                token.text,
                "private keys are not allowed in a watch-only wallet",
            ));
        }
        let key = DescriptorPublicKey::from_str(token.text)
            .map_err(|e| malformed(token.position, token.text, e.to_string()))?;
        if !hardened_free(&key) {
            return Err(malformed(
                token.position,
                token.text,
                "hardened steps cannot be derived from a public key",
            ));
        }
    }
    Ok(())
}

/// Point a miniscript error to the most specific token it mentions
fn locate(body: &str, tokens: &[Token<'_>], err: &miniscript::Error) -> Error {
    let reason = err.to_string();
    tokens
        .iter()
        .filter(|t| t.text.len() > 1 && reason.contains(t.text))
        .max_by_key(|t| t.text.len())
        .or_else(|| tokens.first())
        .map(|t| malformed(t.position, t.text, reason.clone()))
        .unwrap_or_else(|| malformed(0, body, reason.clone()))
}

fn check_multipath(body: &str, desc: &Descriptor<DescriptorPublicKey>) -> Result<(), Error> {
    if !desc.is_multipath() {
        return Ok(());
    }
    let count = desc.clone().into_single_descriptors()?.len();
    if count != 2 {
        let position = body.find('<').unwrap_or_default();
        let end = body[position..]
            .find('>')
            .map_or(body.len(), |e| position + e + 1);
        return Err(malformed(
            position,
            &body[position..end],
            "multipath step must have exactly two values",
        ));
    }
    Ok(())
}

/// Parse a public descriptor, with errors naming the offending token and its byte position
pub fn parse_descriptor(s: &str) -> Result<Descriptor<DescriptorPublicKey>, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::EmptyDescriptor);
    }
    let (body, checksum) = match s.split_once('#') {
        Some((body, checksum)) => (body, Some(checksum)),
        None => (s, None),
    };
    check_brackets(body)?;
    let tokens = tokenize(body)?;
    match tokens.first() {
        Some(top) if top.fragment => {
            if UNSUPPORTED_KINDS.contains(&top.text) {
                return Err(Error::UnsupportedScriptKind(top.text.to_string()));
            }
        }
        _ => return Err(malformed(0, body, "expected a script type")),
    }
    check_tokens(&tokens)?;

    let desc = Descriptor::<DescriptorPublicKey>::from_str(body)
        .map_err(|e| locate(body, &tokens, &e))?;
    if let Some(checksum) = checksum {
        if let Err(e) = Descriptor::<DescriptorPublicKey>::from_str(s) {
            return Err(malformed(body.len(), checksum, e.to_string()));
        }
    }
    check_multipath(body, &desc)?;
    Ok(desc)
}

fn keys_for_network(desc: &Descriptor<DescriptorPublicKey>, network: Network) -> bool {
    let kind = NetworkKind::from(network.bitcoin_network());
    desc.for_each_key(|k| match k {
        DescriptorPublicKey::Single(_) => true,
        DescriptorPublicKey::XPub(x) => x.xkey.network == kind,
        DescriptorPublicKey::MultiXPub(x) => x.xkey.network == kind,
    })
}

/// The descriptor of a wallet, with an external chain and an optional internal one
///
/// A multipath descriptor like `wpkh(tpub.../<0;1>/*)` defines both chains, otherwise the
/// internal one can be given with [`WalletDescriptor::with_change()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletDescriptor {
    source: Descriptor<DescriptorPublicKey>,
    change: Option<Descriptor<DescriptorPublicKey>>,
    external: Descriptor<DescriptorPublicKey>,
    internal: Option<Descriptor<DescriptorPublicKey>>,
}

impl FromStr for WalletDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = parse_descriptor(s)?;
        let (external, internal) = if source.is_multipath() {
            let mut descriptors = source.clone().into_single_descriptors()?;
            let internal = descriptors.pop();
            let external = descriptors.pop().ok_or(Error::MissingBranch(Chain::External))?;
            (external, internal)
        } else {
            (source.clone(), None)
        };
        Ok(WalletDescriptor {
            source,
            change: None,
            external,
            internal,
        })
    }
}

impl WalletDescriptor {
    /// Use a separate descriptor for the internal chain
    pub fn with_change(mut self, change: &str) -> Result<Self, Error> {
        if self.internal.is_some() {
            return Err(Error::InvalidConfig(
                "descriptor already defines the change with a multipath step".into(),
            ));
        }
        let change = parse_descriptor(change)?;
        if change.is_multipath() {
            return Err(Error::InvalidConfig(
                "change descriptor cannot have a multipath step".into(),
            ));
        }
        self.internal = Some(change.clone());
        self.change = Some(change);
        Ok(self)
    }

    pub fn descriptor(&self, chain: Chain) -> Result<&Descriptor<DescriptorPublicKey>, Error> {
        match chain {
            Chain::External => Ok(&self.external),
            Chain::Internal => self.internal.as_ref().ok_or(Error::MissingBranch(chain)),
        }
    }

    /// The chains scanned by this wallet
    pub fn chains(&self) -> Vec<Chain> {
        match self.internal {
            Some(_) => Chain::ALL.to_vec(),
            None => vec![Chain::External],
        }
    }

    fn all(&self) -> impl Iterator<Item = &Descriptor<DescriptorPublicKey>> {
        std::iter::once(&self.external).chain(self.internal.as_ref())
    }

    pub fn has_wildcard(&self) -> bool {
        self.all().all(|d| d.has_wildcard())
    }

    /// Whether all the extended keys are meant for the given network
    pub fn is_for_network(&self, network: Network) -> bool {
        self.all().all(|d| keys_for_network(d, network))
    }

    /// Whether the derived scripts can be encoded as addresses, false for `pk()` or bare `multi()`
    pub fn has_address(&self) -> bool {
        self.all().all(|d| d.desc_type() != DescriptorType::Bare)
    }

    /// The outer script type, like `wpkh` or `sh`
    pub fn kind(&self) -> String {
        let s = self.external.to_string();
        s.split('(').next().unwrap_or_default().to_string()
    }

    /// Derive the script at the given chain and index, without caching
    pub fn derive(&self, chain: Chain, index: u32) -> Result<ScriptBuf, Error> {
        Ok(self
            .descriptor(chain)?
            .at_derivation_index(index)?
            .script_pubkey())
    }

    /// A string identifying the wallet, including the change descriptor if any
    pub fn id(&self) -> String {
        match self.change.as_ref() {
            Some(change) => format!("{self}|{change}"),
            None => self.to_string(),
        }
    }

    pub fn cipher(&self) -> Aes256GcmSiv {
        cipher_from_key_bytes(EncryptionKeyHash::hash(self.id().as_bytes()).to_byte_array())
    }
}

impl Display for WalletDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.source, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const TPUB: &str = "[73c5da0a/84'/1'/0']tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M";
    const TPUB2: &str = "[759db348/84'/1'/0']tpubDCRMaF33e44pcJj534LXVhFbHibPbJ5vuLhSSPFAw57kYURv4tzXFL6LSnd78bkjqdmE3USedkbpXJUPA1tdzKfuYSL7PianceqAhwL2UkA";
    const TPUB3: &str = "[28b3f14e/84'/1'/0']tpubDC2Q4xK4XH72GM7MowNuajyWVbigRLBWKswyP5T88hpPwu5nGqJWnda8zhJEFt71av73Hm8mUMMFSz9acNVzz8b1UbdSHCDXKTbSv5eEytu";
    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
    const PK1: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const PK2: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    fn address(desc: &WalletDescriptor, chain: Chain, index: u32) -> String {
        let script = desc.derive(chain, index).unwrap();
        bitcoin::Address::from_script(&script, bitcoin::Network::Testnet)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_bip84_address() {
        // abandon abandon ... about
        let desc = WalletDescriptor::from_str(&format!("wpkh({TPUB}/<0;1>/*)")).unwrap();
        assert_eq!(
            address(&desc, Chain::External, 0),
            "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl"
        );
        assert_eq!(desc.kind(), "wpkh");
        assert!(desc.has_address());
    }

    #[test]
    fn test_miniscript_policies() {
        let desc = format!("wsh(and_v(v:pk({TPUB}/0/*),older(144)))");
        let wallet_desc = WalletDescriptor::from_str(&desc).unwrap();
        assert_eq!(wallet_desc.chains(), vec![Chain::External]);
        assert!(wallet_desc.has_wildcard());
        assert!(address(&wallet_desc, Chain::External, 3).starts_with("tb1q"));

        let desc = format!(
            "wsh(or_d(multi(2,{TPUB}/<0;1>/*,{TPUB2}/<0;1>/*),and_v(v:pk({TPUB3}/<0;1>/*),older(4032))))"
        );
        let wallet_desc = WalletDescriptor::from_str(&desc).unwrap();
        assert_eq!(wallet_desc.chains(), Chain::ALL.to_vec());
        assert_ne!(
            wallet_desc.derive(Chain::External, 0).unwrap(),
            wallet_desc.derive(Chain::Internal, 0).unwrap()
        );

        let desc = format!("tr({TPUB}/0/*,{{pk({TPUB2}/0/*),pk({TPUB3}/0/*)}})");
        let wallet_desc = WalletDescriptor::from_str(&desc).unwrap();
        assert!(address(&wallet_desc, Chain::External, 0).starts_with("tb1p"));
    }

    #[test]
    fn test_multipath() {
        let desc = format!("wpkh({TPUB}/<0;1>/*)");
        let wallet_desc = WalletDescriptor::from_str(&desc).unwrap();
        assert_eq!(wallet_desc.chains(), vec![Chain::External, Chain::Internal]);

        let external = WalletDescriptor::from_str(&format!("wpkh({TPUB}/0/*)")).unwrap();
        let internal = WalletDescriptor::from_str(&format!("wpkh({TPUB}/1/*)")).unwrap();
        for i in 0..3 {
            assert_eq!(
                wallet_desc.derive(Chain::External, i).unwrap(),
                external.derive(Chain::External, i).unwrap()
            );
            assert_eq!(
                wallet_desc.derive(Chain::Internal, i).unwrap(),
                internal.derive(Chain::External, i).unwrap()
            );
        }
        assert!(wallet_desc.to_string().starts_with(&desc));

        assert_eq!(external.chains(), vec![Chain::External]);
        assert!(matches!(
            external.derive(Chain::Internal, 0),
            Err(Error::MissingBranch(Chain::Internal))
        ));

        let with_change = external
            .clone()
            .with_change(&format!("wpkh({TPUB}/1/*)"))
            .unwrap();
        assert_eq!(
            with_change.derive(Chain::Internal, 2).unwrap(),
            internal.derive(Chain::External, 2).unwrap()
        );
        assert_ne!(with_change.id(), external.id());
        assert!(wallet_desc
            .with_change(&format!("wpkh({TPUB}/1/*)"))
            .is_err());
    }

    #[test]
    fn test_display_and_checksum() {
        let desc = format!("wpkh({TPUB}/0/*)");
        let ours = WalletDescriptor::from_str(&desc).unwrap();
        let displayed = ours.to_string();
        let (body, checksum) = displayed.split_once('#').unwrap();
        assert_eq!(body, desc);
        assert_eq!(checksum.len(), 8);
        assert_eq!(WalletDescriptor::from_str(&displayed).unwrap(), ours);

        let hardened_h = desc.replace('\'', "h");
        assert_eq!(
            WalletDescriptor::from_str(&hardened_h).unwrap().derive(Chain::External, 0).unwrap(),
            ours.derive(Chain::External, 0).unwrap()
        );

        let wrong = format!("{body}#aaaaaaaa");
        match WalletDescriptor::from_str(&wrong).unwrap_err() {
            Error::MalformedDescriptor {
                position, token, ..
            } => assert_eq!((position, token.as_str()), (body.len(), "aaaaaaaa")),
            e => panic!("unexpected error {e:?}"),
        }
    }

    #[test]
    fn test_kinds() {
        for desc in [
            format!("combo({TPUB}/0/*)"),
            format!("rawtr({TPUB}/0/*)"),
            "addr(tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx)".to_string(),
            "raw(deadbeef)".to_string(),
        ] {
            let err = WalletDescriptor::from_str(&desc).unwrap_err();
            assert!(matches!(err, Error::UnsupportedScriptKind(_)), "{desc}");
        }

        let bare = WalletDescriptor::from_str(&format!("pk({TPUB}/0/*)")).unwrap();
        assert!(!bare.has_address());
        assert_eq!(bare.kind(), "pk");
        let bare = WalletDescriptor::from_str(&format!("multi(1,{TPUB}/0/*,{PK1})")).unwrap();
        assert!(!bare.has_address());

        let sh = WalletDescriptor::from_str(&format!("sh(wpkh({TPUB}/0/*))")).unwrap();
        assert!(sh.has_address());
        assert_eq!(sh.kind(), "sh");
    }

    #[test]
    fn test_network() {
        let desc = WalletDescriptor::from_str(&format!("wpkh({TPUB}/0/*)")).unwrap();
        assert!(desc.is_for_network(Network::Testnet));
        assert!(desc.is_for_network(Network::Regtest));
        assert!(!desc.is_for_network(Network::Mainnet));

        let desc = WalletDescriptor::from_str(&format!("wpkh({XPUB}/<0;1>/*)")).unwrap();
        assert!(desc.is_for_network(Network::Mainnet));
        assert!(!desc.is_for_network(Network::Signet));

        let desc = WalletDescriptor::from_str(&format!("wpkh({PK1})")).unwrap();
        assert!(desc.is_for_network(Network::Mainnet));
        assert!(!desc.has_wildcard());
    }

    fn err_position(desc: &str) -> (usize, String) {
        match parse_descriptor(desc).unwrap_err() {
            Error::MalformedDescriptor {
                position, token, ..
            } => (position, token),
            e => panic!("unexpected error {e:?} for {desc}"),
        }
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(parse_descriptor(""), Err(Error::EmptyDescriptor)));
        assert!(matches!(parse_descriptor("   "), Err(Error::EmptyDescriptor)));

        assert_eq!(err_position("foo(abc)"), (0, "foo".to_string()));
        assert_eq!(err_position("wpkh(abc"), (4, "(".to_string()));
        assert_eq!(err_position("wpkh(abc))"), (9, ")".to_string()));
        assert_eq!(err_position("wpkh(abc)"), (5, "abc".to_string()));
        assert_eq!(err_position("wpkh()"), (5, "".to_string()));
        assert_eq!(err_position("wpkh"), (0, "wpkh".to_string()));
        assert_eq!(
            err_position(&format!("wsh(and_x(pk({PK1}),older(1)))")),
            (4, "and_x".to_string())
        );
        let desc = format!("wpkh({PK1})x");
        assert_eq!(err_position(&desc), (desc.len() - 1, "x".to_string()));

        // keys
        let key = format!("[73c5da0/84'/1'/0']{PK1}");
        assert_eq!(err_position(&format!("wpkh({key})")), (5, key));
        let key = format!("{XPUB}/0'/*");
        assert_eq!(err_position(&format!("wpkh({key})")), (5, key));
        let key = format!("{XPUB}/*'");
        assert_eq!(err_position(&format!("wpkh({key})")), (5, key));
        let key = format!("{XPUB}/*/0");
        assert_eq!(err_position(&format!("wpkh({key})")), (5, key));
        let key = format!("{TPUB2}/0/*");
        let desc = format!("wsh(multi(1,{PK1},{key}x))");
        assert_eq!(err_position(&desc), (13 + PK1.len(), format!("{key}x")));

        let xprv = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";
        let (pos, token) = err_position(&format!("wpkh({xprv}/0/*)"));
        assert_eq!((pos, token), (5, format!("{xprv}/0/*")));

        // rejected by miniscript as a whole
        for desc in [
            format!("wsh(multi(3,{PK1},{PK2}))"),
            format!("wsh(multi(0,{PK1},{PK2}))"),
            format!("wpkh({PK1},{PK2})"),
            format!("wpkh({})", &PK1[2..]),
        ] {
            assert!(
                matches!(
                    parse_descriptor(&desc),
                    Err(Error::MalformedDescriptor { .. })
                ),
                "{desc}"
            );
        }

        let (_, token) = err_position(&format!("wpkh({TPUB}/<0;1;2>/*)"));
        assert_eq!(token, "<0;1;2>");
    }
}
