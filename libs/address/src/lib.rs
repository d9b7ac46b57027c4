//! Machine address parsing and validation.
//!
//! A `PhysicalMachine` declares its agent endpoint as a plain
//! `scheme://host:port` string. This library turns that declaration into an
//! immutable [`Endpoint`] or rejects it with an [`AddressError`].
//!
//! # Invariants
//!
//! - Resolution is a pure function: deterministic, total, no I/O.
//! - A malformed address is a configuration error. It is never retried,
//!   because no amount of waiting fixes a typo; callers surface the error
//!   to the resource status and stop.

use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Address validation errors. All variants are non-retryable configuration
/// problems that require a spec edit to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Address string is empty.
    #[error("address is empty")]
    Empty,

    /// No `scheme://` separator present.
    #[error("address {0:?} has no scheme (expected scheme://host:port)")]
    MissingScheme(String),

    /// Scheme is not one the agent protocol speaks.
    #[error("unsupported scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),

    /// Scheme is known but excluded by the operator allow-list.
    #[error("scheme {0:?} is not allowed by controller configuration")]
    DisallowedScheme(String),

    /// Host portion is empty.
    #[error("address has an empty host")]
    EmptyHost,

    /// Host portion contains invalid characters or malformed IPv6.
    #[error("invalid host {0:?}")]
    InvalidHost(String),

    /// No `:port` suffix present.
    #[error("address {0:?} has no port (expected scheme://host:port)")]
    MissingPort(String),

    /// Port is not a number in 1..=65535.
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// A path, query, or fragment trails the authority.
    #[error("address must not carry a path or query, got {0:?}")]
    TrailingPath(String),
}

/// Wire protocol scheme the agent is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl FromStr for Scheme {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(AddressError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated connection target for one machine's agent.
///
/// The host is stored unbracketed; `Display` re-brackets IPv6 hosts so the
/// rendered form is always a valid address string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Base URL for HTTP clients, without a trailing slash.
    pub fn base_url(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Resolve a declared machine address into an [`Endpoint`].
///
/// The input must be exactly `scheme://host:port`: bracketed IPv6 hosts are
/// accepted, anything after the port (path, query, fragment) is rejected,
/// and the scheme must appear in `allowed`.
pub fn resolve(declared: &str, allowed: &[Scheme]) -> Result<Endpoint, AddressError> {
    if declared.is_empty() {
        return Err(AddressError::Empty);
    }

    let Some((scheme_str, rest)) = declared.split_once("://") else {
        return Err(AddressError::MissingScheme(declared.to_string()));
    };

    let scheme: Scheme = scheme_str.parse()?;
    if !allowed.contains(&scheme) {
        return Err(AddressError::DisallowedScheme(scheme.to_string()));
    }

    if rest.contains(['/', '?', '#']) {
        return Err(AddressError::TrailingPath(declared.to_string()));
    }

    let (host, port_str) = split_authority(rest, declared)?;
    validate_host(host)?;

    let port: u16 = port_str
        .parse()
        .map_err(|_| AddressError::InvalidPort(port_str.to_string()))?;
    if port == 0 {
        return Err(AddressError::InvalidPort(port_str.to_string()));
    }

    Ok(Endpoint {
        scheme,
        host: host.to_string(),
        port,
    })
}

/// Split `host:port` or `[v6]:port` into host and port strings.
fn split_authority<'a>(rest: &'a str, declared: &str) -> Result<(&'a str, &'a str), AddressError> {
    if let Some(inner) = rest.strip_prefix('[') {
        let Some((host, after)) = inner.split_once(']') else {
            return Err(AddressError::InvalidHost(rest.to_string()));
        };
        let Some(port_str) = after.strip_prefix(':') else {
            return Err(AddressError::MissingPort(declared.to_string()));
        };
        return Ok((host, port_str));
    }

    let Some((host, port_str)) = rest.rsplit_once(':') else {
        return Err(AddressError::MissingPort(declared.to_string()));
    };

    // A second colon means an unbracketed IPv6 literal.
    if host.contains(':') {
        return Err(AddressError::InvalidHost(rest.to_string()));
    }

    Ok((host, port_str))
}

fn validate_host(host: &str) -> Result<(), AddressError> {
    if host.is_empty() {
        return Err(AddressError::EmptyHost);
    }

    // Bracketed hosts must be real IPv6 literals.
    if host.contains(':') {
        Ipv6Addr::from_str(host).map_err(|_| AddressError::InvalidHost(host.to_string()))?;
        return Ok(());
    }

    let valid_chars = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    let valid_labels = host.split('.').all(|label| !label.is_empty());

    if !valid_chars || !valid_labels {
        return Err(AddressError::InvalidHost(host.to_string()));
    }

    Ok(())
}
