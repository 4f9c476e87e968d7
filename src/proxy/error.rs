//! PROXY Protocol Errors
//!
//! Structural decode/encode failures live in [`HeaderError`]. Everything a
//! connection or listener can report is a [`ProxyError`], which is cheap to
//! clone so a failed connection can replay the same error on every call.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by caller-supplied hooks.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Malformed bytes or an unencodable header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// v1 line exceeded 107 bytes without a line feed
    #[error("v1 header exceeds 107 bytes")]
    LineTooLong,

    /// v1 line feed not preceded by a carriage return
    #[error("v1 header must end with CRLF")]
    MissingCrlf,

    /// A v1 token failed its length or charset check
    #[error("invalid v1 {0}")]
    InvalidToken(&'static str),

    /// v1 protocol token other than TCP4, TCP6 or UNKNOWN
    #[error("unsupported v1 protocol")]
    UnsupportedProtocol,

    /// Version nibble is not 2 (v2) or version is neither 1 nor 2 (encode)
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    /// Command nibble is neither LOCAL nor PROXY
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),

    /// Unknown address family / protocol byte
    #[error("unsupported address family and protocol {0:#04x}")]
    UnsupportedTransport(u8),

    /// Declared v2 length is shorter than the family's address block
    #[error("declared length {declared} is shorter than the {required}-byte address block")]
    InvalidLength { declared: usize, required: usize },

    /// TLV framing ran past the declared header length
    #[error("TLV overruns the declared header length")]
    TlvOverrun,

    /// CRC32C TLV value is not 4 bytes
    #[error("CRC32C TLV must be 4 bytes, got {0}")]
    InvalidChecksumTlv(usize),

    /// CRC32C did not match the header contents
    #[error("CRC32C mismatch: header carries {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Stream ended inside a header whose signature was already recognised
    #[error("truncated PROXY header")]
    Truncated,

    /// Addresses do not match the transport protocol's family
    #[error("address family does not match transport protocol")]
    AddressMismatch,

    /// PROXY command without the addresses its transport protocol needs
    #[error("missing source or destination address")]
    MissingAddress,

    /// UNIX path longer than the 108-byte v2 field
    #[error("unix path is {0} bytes, at most 108 fit")]
    UnixPathTooLong(usize),

    /// TLV value or whole v2 payload does not fit a u16 length
    #[error("v2 header payload too long")]
    TooLong,

    /// v1 can only carry TCP over IPv4/IPv6
    #[error("transport protocol cannot be expressed in a v1 header")]
    NotRepresentable,
}

/// Errors reported by a PROXY protocol aware connection or listener.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// No PROXY header on the wire where one is required
    #[error("PROXY protocol header not present")]
    NoProxyProtocol,

    /// A PROXY header was sent on a connection whose policy rejects it
    #[error("PROXY protocol header present but not allowed")]
    SuperfluousProxyHeader,

    /// Returned by a policy resolver to drop a connection silently
    #[error("upstream connection address not trusted for PROXY information")]
    InvalidUpstream,

    /// Allow-list entry that is neither an IP nor a CIDR
    #[error("invalid address or network: {0}")]
    InvalidAddress(String),

    /// Malformed header bytes
    #[error("invalid PROXY header: {0}")]
    Header(#[from] HeaderError),

    /// Header-validation hook veto
    #[error("PROXY header rejected: {0}")]
    Validation(Arc<dyn StdError + Send + Sync>),

    /// Custom error returned by a policy resolver
    #[error("policy resolution failed: {0}")]
    Policy(Arc<dyn StdError + Send + Sync>),

    /// Transport failure, including timeouts
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl ProxyError {
    /// Wraps a header-validation failure.
    pub fn validation(err: impl Into<BoxError>) -> Self {
        ProxyError::Validation(Arc::from(err.into()))
    }

    /// Wraps a custom policy resolver failure.
    pub fn policy(err: impl Into<BoxError>) -> Self {
        ProxyError::Policy(Arc::from(err.into()))
    }

    /// Recovers the `ProxyError` carried by an `io::Error` produced by this crate.
    pub fn from_io(err: &io::Error) -> Option<&ProxyError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<ProxyError>())
    }

    /// True when the underlying transport timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            ProxyError::NoProxyProtocol | ProxyError::SuperfluousProxyHeader => {
                io::ErrorKind::ConnectionRefused
            }
            ProxyError::InvalidUpstream | ProxyError::Policy(_) => {
                io::ErrorKind::PermissionDenied
            }
            ProxyError::Header(_) | ProxyError::Validation(_) | ProxyError::InvalidAddress(_) => {
                io::ErrorKind::InvalidData
            }
            ProxyError::Io(e) => e.kind(),
        }
    }
}

impl PartialEq for ProxyError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ProxyError::NoProxyProtocol, ProxyError::NoProxyProtocol)
            | (ProxyError::SuperfluousProxyHeader, ProxyError::SuperfluousProxyHeader)
            | (ProxyError::InvalidUpstream, ProxyError::InvalidUpstream) => true,
            (ProxyError::InvalidAddress(a), ProxyError::InvalidAddress(b)) => a == b,
            (ProxyError::Header(a), ProxyError::Header(b)) => a == b,
            (ProxyError::Validation(a), ProxyError::Validation(b))
            | (ProxyError::Policy(a), ProxyError::Policy(b)) => Arc::ptr_eq(a, b),
            (ProxyError::Io(a), ProxyError::Io(b)) => {
                Arc::ptr_eq(a, b) || a.kind() == b.kind()
            }
            _ => false,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        // Errors that already carry a ProxyError are unwrapped, not nested
        match ProxyError::from_io(&e) {
            Some(inner) => inner.clone(),
            None => ProxyError::Io(Arc::new(e)),
        }
    }
}

impl From<ProxyError> for io::Error {
    fn from(e: ProxyError) -> Self {
        io::Error::new(e.io_kind(), e)
    }
}

/// Error carried by [`ProxyError::Validation`] or [`ProxyError::Policy`]
/// when the hook only has a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection(pub String);

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Rejection {}
