//! PROXY Protocol Module
//!
//! HAProxy PROXY protocol v1/v2 support for tokio listeners:
//!
//! - a header codec ([`parse`], [`read_header`], [`Header::encode`]) with
//!   TLV extensions and CRC32C verification,
//! - per-connection [`Policy`] resolution,
//! - [`ProxyStream`], a connection decorator that consumes the header on
//!   first use and reports the addresses it carries,
//! - [`ProxyListener`], which resolves policy at accept time.

mod deadline;
mod encoder;
mod error;
mod header;
mod listener;
mod parser;
mod policy;
mod stream;
pub mod tlv;
mod transport;

pub use error::{BoxError, HeaderError, ProxyError, Rejection};
pub use header::{Address, Command, Header, TransportProtocol};
pub use listener::{Accept, Accepted, ProxyListener, DEFAULT_READ_HEADER_TIMEOUT};
pub use parser::{
    parse, read_header, signature_recognized, Parsed, PROXY_V1_SIGNATURE, PROXY_V2_SIGNATURE,
    V1_MAX_LENGTH,
};
pub use policy::{
    ConnPolicyFn, ConnPolicyOptions, ParsePolicyError, Policy, PolicyResolver, UpstreamPolicyFn,
};
pub use stream::{ProxyStream, ValidateHeader};
pub use tlv::{SslInfo, Tlv};
pub use transport::{BulkCopy, Transport};
