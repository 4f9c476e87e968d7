//! Connection Policy
//!
//! Decides, per accepted connection and before any byte is read, whether a
//! PROXY header is used, required, rejected, ignored or not looked for.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;

use super::error::ProxyError;
use super::header::Address;

/// How a connection treats a PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Use the header's addresses if one is present
    #[default]
    Use,
    /// Fail the connection unless a header is present
    Require,
    /// Fail the connection if a header is present
    Reject,
    /// Consume a header if present but keep the transport's addresses
    Ignore,
    /// Do not look for a header; the connection is passed through untouched
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown policy {0:?}, expected one of use, require, reject, ignore, skip")]
pub struct ParsePolicyError(String);

impl FromStr for Policy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "use" => Ok(Policy::Use),
            "require" => Ok(Policy::Require),
            "reject" => Ok(Policy::Reject),
            "ignore" => Ok(Policy::Ignore),
            "skip" => Ok(Policy::Skip),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Identity of an accepted connection, as seen by a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnPolicyOptions {
    /// Peer address of the accepted transport (the proxy, when there is one)
    pub upstream: Address,
    /// Local address the connection was accepted on
    pub downstream: Address,
}

pub type UpstreamPolicyFn = dyn Fn(&Address) -> Result<Policy, ProxyError> + Send + Sync;
pub type ConnPolicyFn = dyn Fn(&ConnPolicyOptions) -> Result<Policy, ProxyError> + Send + Sync;

/// Resolves a connection's [`Policy`].
///
/// A resolver is either a function of the upstream address or a function of
/// the full [`ConnPolicyOptions`]; a listener holds at most one.
///
/// Returning [`ProxyError::InvalidUpstream`] makes a listener drop the
/// connection and keep accepting. Any other error is returned from `accept`.
#[derive(Clone)]
pub enum PolicyResolver {
    Upstream(Arc<UpstreamPolicyFn>),
    Connection(Arc<ConnPolicyFn>),
}

impl PolicyResolver {
    pub fn upstream<F>(f: F) -> Self
    where
        F: Fn(&Address) -> Result<Policy, ProxyError> + Send + Sync + 'static,
    {
        PolicyResolver::Upstream(Arc::new(f))
    }

    pub fn connection<F>(f: F) -> Self
    where
        F: Fn(&ConnPolicyOptions) -> Result<Policy, ProxyError> + Send + Sync + 'static,
    {
        PolicyResolver::Connection(Arc::new(f))
    }

    /// Same policy for every connection.
    pub fn fixed(policy: Policy) -> Self {
        Self::upstream(move |_| Ok(policy))
    }

    pub fn resolve(&self, opts: &ConnPolicyOptions) -> Result<Policy, ProxyError> {
        match self {
            PolicyResolver::Upstream(f) => f(&opts.upstream),
            PolicyResolver::Connection(f) => f(opts),
        }
    }

    /// USE for listed upstreams, IGNORE for everyone else.
    pub fn lax_allow_list<I, S>(allowed: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = AllowList::parse(allowed)?;
        Ok(Self::upstream(move |upstream| {
            Ok(if list.contains(upstream) {
                Policy::Use
            } else {
                Policy::Ignore
            })
        }))
    }

    /// USE for listed upstreams, REJECT for everyone else.
    pub fn strict_allow_list<I, S>(allowed: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = AllowList::parse(allowed)?;
        Ok(Self::upstream(move |upstream| {
            Ok(if list.contains(upstream) {
                Policy::Use
            } else {
                Policy::Reject
            })
        }))
    }

    /// SKIP for upstreams inside `network`, `default` otherwise.
    pub fn skip_for_cidr(network: IpNet, default: Policy) -> Self {
        Self::upstream(move |upstream| {
            Ok(match upstream.ip() {
                Some(ip) if network.contains(&ip.to_canonical()) => Policy::Skip,
                _ => default,
            })
        })
    }

    /// Connection-shaped variant of [`PolicyResolver::lax_allow_list`].
    pub fn trust_from<I, S>(trusted: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = AllowList::parse(trusted)?;
        Ok(Self::connection(move |opts| {
            Ok(if list.contains(&opts.upstream) {
                Policy::Use
            } else {
                Policy::Ignore
            })
        }))
    }
}

impl fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyResolver::Upstream(_) => f.write_str("PolicyResolver::Upstream(..)"),
            PolicyResolver::Connection(_) => f.write_str("PolicyResolver::Connection(..)"),
        }
    }
}

/// IP addresses and networks. Single addresses are stored as host networks.
#[derive(Debug, Clone, Default)]
struct AllowList {
    networks: Vec<IpNet>,
}

impl AllowList {
    fn parse<I, S>(entries: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let networks = entries
            .into_iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                if entry.contains('/') {
                    entry.parse::<IpNet>().ok()
                } else {
                    entry.parse::<IpAddr>().ok().map(IpNet::from)
                }
                .ok_or_else(|| ProxyError::InvalidAddress(entry.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { networks })
    }

    fn contains(&self, addr: &Address) -> bool {
        let Some(ip) = addr.ip() else {
            return false;
        };
        let ip = ip.to_canonical();
        self.networks.iter().any(|net| net.contains(&ip))
    }
}
