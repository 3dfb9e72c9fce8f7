use std::{net::IpAddr, str::FromStr};

/// An electrum url parsable from string in the following form: `tcp://example.com:50001` or `ssl://example.com:50002`
///
/// If you need to use tls without validating the domain, use [`ElectrumUrl::without_domain_validation()`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectrumUrl {
    /// The TLS scheme with the host and port, and the flag indicating if the domain name should be validated
    Tls(String, bool),

    /// The plaintext scheme with the host and port
    Plaintext(String),
}

impl FromStr for ElectrumUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url: url::Url = s.parse()?;
        let ssl = url.scheme() == "ssl";
        if !(ssl || url.scheme() == "tcp") {
            return Err(UrlError::Schema(url.scheme().to_string()));
        }
        let port = url.port().ok_or(UrlError::MissingPort)?;
        let host = url.host_str().ok_or(UrlError::MissingDomain)?;
        let host_port = format!("{host}:{port}");
        match host.trim_matches(&['[', ']'][..]).parse::<IpAddr>() {
            Ok(_) if ssl => Err(UrlError::SslWithoutDomain),
            Ok(_) => ElectrumUrl::new(&host_port, false, false),
            Err(_) => ElectrumUrl::new(&host_port, ssl, ssl),
        }
    }
}

impl std::fmt::Display for ElectrumUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectrumUrl::Tls(s, _) => write!(f, "ssl://{s}"),
            ElectrumUrl::Plaintext(s) => write!(f, "tcp://{s}"),
        }
    }
}

impl ElectrumUrl {
    /// Create an electrum url from its parts
    ///
    /// The given `host_port` is a domain name or an ip with the port and without the scheme,
    /// eg. `example.com:50001` or `127.0.0.1:50001`
    ///
    /// Note: you cannot validate domain without TLS, an error is thrown in this case.
    pub fn new(host_port: &str, tls: bool, validate_domain: bool) -> Result<Self, UrlError> {
        if host_port.contains("://") {
            return Err(UrlError::NoScheme);
        }

        if tls {
            Ok(ElectrumUrl::Tls(host_port.into(), validate_domain))
        } else if validate_domain {
            Err(UrlError::ValidateWithoutTls)
        } else {
            Ok(ElectrumUrl::Plaintext(host_port.into()))
        }
    }

    /// Keep TLS but don't check the certificate matches the domain, no-op for plaintext urls
    pub fn without_domain_validation(self) -> Self {
        match self {
            ElectrumUrl::Tls(host_port, _) => ElectrumUrl::Tls(host_port, false),
            plaintext => plaintext,
        }
    }

    pub fn host_port(&self) -> &str {
        match self {
            ElectrumUrl::Tls(s, _) | ElectrumUrl::Plaintext(s) => s,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ElectrumUrl::Tls(..))
    }

    pub fn validate_domain(&self) -> bool {
        matches!(self, ElectrumUrl::Tls(_, true))
    }
}

/// Error type when parsing a string to the [`ElectrumUrl`] type.
#[derive(thiserror::Error, Debug)]
#[allow(missing_docs)]
pub enum UrlError {
    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error("Invalid schema `{0}` supported ones are `ssl` or `tcp`")]
    Schema(String),

    #[error("Port is missing")]
    MissingPort,

    #[error("Domain is missing")]
    MissingDomain,

    #[error("Cannot specify `ssl` scheme without a domain")]
    SslWithoutDomain,

    #[error("Cannot validate the domain without tls")]
    ValidateWithoutTls,

    #[error("Don't specify the scheme in the url")]
    NoScheme,
}
