//! PROXY v2 TLV Extensions
//!
//! Raw TLV framing plus typed accessors for the registered types, including
//! the TLS termination details carried in PP2_TYPE_SSL.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::HeaderError;
use super::header::Header;

pub const PP2_TYPE_ALPN: u8 = 0x01;
pub const PP2_TYPE_AUTHORITY: u8 = 0x02;
pub const PP2_TYPE_CRC32C: u8 = 0x03;
pub const PP2_TYPE_NOOP: u8 = 0x04;
pub const PP2_TYPE_UNIQUE_ID: u8 = 0x05;
pub const PP2_TYPE_SSL: u8 = 0x20;
pub const PP2_SUBTYPE_SSL_VERSION: u8 = 0x21;
pub const PP2_SUBTYPE_SSL_CN: u8 = 0x22;
pub const PP2_SUBTYPE_SSL_CIPHER: u8 = 0x23;
pub const PP2_SUBTYPE_SSL_SIG_ALG: u8 = 0x24;
pub const PP2_SUBTYPE_SSL_KEY_ALG: u8 = 0x25;
pub const PP2_TYPE_NETNS: u8 = 0x30;

/// Range reserved for application-specific TLVs.
pub const PP2_TYPE_MIN_CUSTOM: u8 = 0xE0;
pub const PP2_TYPE_MAX_CUSTOM: u8 = 0xEF;
/// Range reserved for experimental TLVs.
pub const PP2_TYPE_MIN_EXPERIMENT: u8 = 0xF0;
pub const PP2_TYPE_MAX_EXPERIMENT: u8 = 0xF7;

/// Maximum length of a PP2_TYPE_UNIQUE_ID value.
pub const MAX_UNIQUE_ID_LEN: usize = 128;

/// PP2_CLIENT_SSL: client connected over SSL/TLS
const PP2_CLIENT_SSL: u8 = 0x01;
/// PP2_CLIENT_CERT_CONN: client presented a certificate on this connection
const PP2_CLIENT_CERT_CONN: u8 = 0x02;
/// PP2_CLIENT_CERT_SESS: client presented a certificate at least once in this session
const PP2_CLIENT_CERT_SESS: u8 = 0x04;

/// One type-length-value record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tlv {
    pub kind: u8,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(kind: u8, value: impl Into<Bytes>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    /// Types defined by the protocol document.
    pub fn is_registered(&self) -> bool {
        matches!(
            self.kind,
            PP2_TYPE_ALPN
                | PP2_TYPE_AUTHORITY
                | PP2_TYPE_CRC32C
                | PP2_TYPE_NOOP
                | PP2_TYPE_UNIQUE_ID
                | PP2_TYPE_SSL
                | PP2_SUBTYPE_SSL_VERSION
                | PP2_SUBTYPE_SSL_CN
                | PP2_SUBTYPE_SSL_CIPHER
                | PP2_SUBTYPE_SSL_SIG_ALG
                | PP2_SUBTYPE_SSL_KEY_ALG
                | PP2_TYPE_NETNS
        )
    }

    pub fn is_custom(&self) -> bool {
        (PP2_TYPE_MIN_CUSTOM..=PP2_TYPE_MAX_CUSTOM).contains(&self.kind)
    }

    pub fn is_experiment(&self) -> bool {
        (PP2_TYPE_MIN_EXPERIMENT..=PP2_TYPE_MAX_EXPERIMENT).contains(&self.kind)
    }

    /// Encoded size: 3 header bytes plus the value.
    pub fn encoded_len(&self) -> usize {
        3 + self.value.len()
    }
}

/// Splits a TLV vector. The input must be consumed exactly.
pub fn split_tlvs(mut raw: &[u8]) -> Result<Vec<Tlv>, HeaderError> {
    let mut tlvs = Vec::new();
    while !raw.is_empty() {
        if raw.len() < 3 {
            return Err(HeaderError::TlvOverrun);
        }
        let kind = raw[0];
        let len = u16::from_be_bytes([raw[1], raw[2]]) as usize;
        let end = 3 + len;
        if end > raw.len() {
            return Err(HeaderError::TlvOverrun);
        }
        tlvs.push(Tlv::new(kind, Bytes::copy_from_slice(&raw[3..end])));
        raw = &raw[end..];
    }
    Ok(tlvs)
}

/// Frames TLVs back into their wire form.
pub fn join_tlvs(tlvs: &[Tlv]) -> Result<Bytes, HeaderError> {
    let mut buf = BytesMut::with_capacity(tlvs.iter().map(Tlv::encoded_len).sum());
    for tlv in tlvs {
        let len = u16::try_from(tlv.value.len()).map_err(|_| HeaderError::TooLong)?;
        buf.put_u8(tlv.kind);
        buf.put_u16(len);
        buf.put_slice(&tlv.value);
    }
    Ok(buf.freeze())
}

/// Same types and values in the same order, ignoring CRC32C values.
pub(crate) fn same_sequence(a: &[Tlv], b: &[Tlv]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.kind == y.kind && (x.kind == PP2_TYPE_CRC32C || x.value == y.value)
        })
}

/// TLS termination details from a PP2_TYPE_SSL TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslInfo {
    pub client: u8,
    pub verify: u32,
    pub tlvs: Vec<Tlv>,
}

impl SslInfo {
    /// Parses a PP2_TYPE_SSL value:
    /// - 1 byte: client bitfield
    /// - 4 bytes: verify (0 = certificate verified)
    /// - remaining: sub-TLVs
    pub fn parse(value: &[u8]) -> Result<Self, HeaderError> {
        if value.len() < 5 {
            return Err(HeaderError::TlvOverrun);
        }
        Ok(Self {
            client: value[0],
            verify: u32::from_be_bytes([value[1], value[2], value[3], value[4]]),
            tlvs: split_tlvs(&value[5..])?,
        })
    }

    /// Encodes into a PP2_TYPE_SSL TLV.
    pub fn to_tlv(&self) -> Result<Tlv, HeaderError> {
        let sub = join_tlvs(&self.tlvs)?;
        let mut buf = BytesMut::with_capacity(5 + sub.len());
        buf.put_u8(self.client);
        buf.put_u32(self.verify);
        buf.put_slice(&sub);
        Ok(Tlv::new(PP2_TYPE_SSL, buf.freeze()))
    }

    pub fn client_ssl(&self) -> bool {
        self.client & PP2_CLIENT_SSL != 0
    }

    pub fn client_cert_conn(&self) -> bool {
        self.client & PP2_CLIENT_CERT_CONN != 0
    }

    pub fn client_cert_sess(&self) -> bool {
        self.client & PP2_CLIENT_CERT_SESS != 0
    }

    /// Client presented a certificate and it was verified.
    pub fn verified(&self) -> bool {
        (self.client_cert_conn() || self.client_cert_sess()) && self.verify == 0
    }

    /// TLS version string, e.g. "TLSv1.3".
    pub fn version(&self) -> Option<&str> {
        self.sub_str(PP2_SUBTYPE_SSL_VERSION)
    }

    /// Client certificate Common Name.
    pub fn common_name(&self) -> Option<&str> {
        self.sub_str(PP2_SUBTYPE_SSL_CN)
    }

    pub fn cipher(&self) -> Option<&str> {
        self.sub_str(PP2_SUBTYPE_SSL_CIPHER)
    }

    pub fn sig_alg(&self) -> Option<&str> {
        self.sub_str(PP2_SUBTYPE_SSL_SIG_ALG)
    }

    pub fn key_alg(&self) -> Option<&str> {
        self.sub_str(PP2_SUBTYPE_SSL_KEY_ALG)
    }

    fn sub_str(&self, kind: u8) -> Option<&str> {
        self.tlvs
            .iter()
            .find(|t| t.kind == kind)
            .and_then(|t| std::str::from_utf8(&t.value).ok())
    }
}

impl Header {
    /// First TLV of the given type.
    pub fn find_tlv(&self, kind: u8) -> Option<&Tlv> {
        self.tlvs.iter().find(|t| t.kind == kind)
    }

    /// Application-Layer Protocol Negotiation value (e.g. `h2`).
    pub fn alpn(&self) -> Option<&[u8]> {
        self.find_tlv(PP2_TYPE_ALPN).map(|t| t.value.as_ref())
    }

    /// Host name the client asked for, typically the TLS SNI.
    pub fn authority(&self) -> Option<&str> {
        self.find_tlv(PP2_TYPE_AUTHORITY)
            .and_then(|t| std::str::from_utf8(&t.value).ok())
    }

    /// Connection identifier assigned by the proxy.
    pub fn unique_id(&self) -> Option<&[u8]> {
        self.find_tlv(PP2_TYPE_UNIQUE_ID)
            .map(|t| t.value.as_ref())
            .filter(|v| v.len() <= MAX_UNIQUE_ID_LEN)
    }

    /// Network namespace name.
    pub fn netns(&self) -> Option<&str> {
        self.find_tlv(PP2_TYPE_NETNS)
            .and_then(|t| std::str::from_utf8(&t.value).ok())
    }

    /// Checksum value carried by the header, if any.
    pub fn crc32c(&self) -> Option<u32> {
        self.find_tlv(PP2_TYPE_CRC32C)
            .and_then(|t| <[u8; 4]>::try_from(t.value.as_ref()).ok())
            .map(u32::from_be_bytes)
    }

    /// TLS termination details. Malformed SSL TLVs are treated as absent.
    pub fn ssl(&self) -> Option<SslInfo> {
        self.find_tlv(PP2_TYPE_SSL)
            .and_then(|t| SslInfo::parse(&t.value).ok())
    }
}
