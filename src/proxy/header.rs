//! PROXY Header Model
//!
//! Version-independent representation of a v1 or v2 header. Values are
//! built either by the parser or directly by callers that want to encode.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;

use super::tlv::{self, Tlv};

/// What the sender asks the receiver to do with the addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Connection made by the proxy itself (e.g. health checks); addresses are meaningless
    Local,
    /// Connection relayed on behalf of another node
    Proxy,
}

impl Command {
    pub(crate) fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0x0 => Some(Command::Local),
            0x1 => Some(Command::Proxy),
            _ => None,
        }
    }

    pub(crate) fn nibble(self) -> u8 {
        match self {
            Command::Local => 0x0,
            Command::Proxy => 0x1,
        }
    }
}

/// Address family and transport protocol pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Unspec,
    TcpV4,
    UdpV4,
    TcpV6,
    UdpV6,
    UnixStream,
    UnixDatagram,
}

impl TransportProtocol {
    /// Decodes the v2 family/protocol byte.
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(TransportProtocol::Unspec),
            0x11 => Some(TransportProtocol::TcpV4),
            0x12 => Some(TransportProtocol::UdpV4),
            0x21 => Some(TransportProtocol::TcpV6),
            0x22 => Some(TransportProtocol::UdpV6),
            0x31 => Some(TransportProtocol::UnixStream),
            0x32 => Some(TransportProtocol::UnixDatagram),
            _ => None,
        }
    }

    pub(crate) fn byte(self) -> u8 {
        match self {
            TransportProtocol::Unspec => 0x00,
            TransportProtocol::TcpV4 => 0x11,
            TransportProtocol::UdpV4 => 0x12,
            TransportProtocol::TcpV6 => 0x21,
            TransportProtocol::UdpV6 => 0x22,
            TransportProtocol::UnixStream => 0x31,
            TransportProtocol::UnixDatagram => 0x32,
        }
    }

    /// Size of the v2 address block for this family.
    pub fn address_len(self) -> usize {
        match self {
            TransportProtocol::Unspec => 0,
            TransportProtocol::TcpV4 | TransportProtocol::UdpV4 => 12,
            TransportProtocol::TcpV6 | TransportProtocol::UdpV6 => 36,
            TransportProtocol::UnixStream | TransportProtocol::UnixDatagram => 216,
        }
    }

    pub fn is_ipv4(self) -> bool {
        matches!(self, TransportProtocol::TcpV4 | TransportProtocol::UdpV4)
    }

    pub fn is_ipv6(self) -> bool {
        matches!(self, TransportProtocol::TcpV6 | TransportProtocol::UdpV6)
    }

    pub fn is_unix(self) -> bool {
        matches!(
            self,
            TransportProtocol::UnixStream | TransportProtocol::UnixDatagram
        )
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            TransportProtocol::TcpV4 | TransportProtocol::TcpV6 | TransportProtocol::UnixStream
        )
    }

    pub fn is_datagram(self) -> bool {
        matches!(
            self,
            TransportProtocol::UdpV4 | TransportProtocol::UdpV6 | TransportProtocol::UnixDatagram
        )
    }
}

/// Endpoint carried in a header or reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 or IPv6 address with port
    Inet(SocketAddr),
    /// Unix socket path bytes, without NUL padding (empty when unnamed)
    Unix(Bytes),
}

impl Address {
    pub fn unix(path: impl Into<Bytes>) -> Self {
        Address::Unix(path.into())
    }

    /// Socket address for IP endpoints.
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            Address::Inet(addr) => Some(*addr),
            Address::Unix(_) => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.as_inet().map(|a| a.ip())
    }

    pub fn port(&self) -> Option<u16> {
        self.as_inet().map(|a| a.port())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Inet(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(addr) => write!(f, "{}", addr),
            Address::Unix(path) if path.is_empty() => f.write_str("(unnamed)"),
            Address::Unix(path) => write!(f, "{}", String::from_utf8_lossy(path)),
        }
    }
}

/// A decoded or to-be-encoded PROXY protocol header.
///
/// Equality follows the protocol's meaning rather than the byte layout:
/// version, command and transport protocol always count; addresses count
/// unless the command is LOCAL; for v2 the TLV sequence counts too, except
/// the value of a CRC32C TLV, which is derived from the rest of the header.
#[derive(Debug, Clone, Eq)]
pub struct Header {
    pub version: u8,
    pub command: Command,
    pub transport_protocol: TransportProtocol,
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub tlvs: Vec<Tlv>,
}

impl Header {
    /// Empty header without addresses or TLVs.
    pub fn new(version: u8, command: Command, transport_protocol: TransportProtocol) -> Self {
        Self {
            version,
            command,
            transport_protocol,
            source: None,
            destination: None,
            tlvs: Vec::new(),
        }
    }

    /// LOCAL header, as sent by proxies for their own health checks.
    pub fn local(version: u8) -> Self {
        Self::new(version, Command::Local, TransportProtocol::Unspec)
    }

    /// PROXY/TCP header for a relayed connection. Falls back to a LOCAL
    /// header when the two addresses are of different IP families.
    pub fn from_addrs(version: u8, source: SocketAddr, destination: SocketAddr) -> Self {
        let transport = match (source, destination) {
            (SocketAddr::V4(_), SocketAddr::V4(_)) => TransportProtocol::TcpV4,
            (SocketAddr::V6(_), SocketAddr::V6(_)) => TransportProtocol::TcpV6,
            _ => return Self::local(version),
        };
        Self::new(version, Command::Proxy, transport).with_addresses(source, destination)
    }

    pub fn with_addresses(
        mut self,
        source: impl Into<Address>,
        destination: impl Into<Address>,
    ) -> Self {
        self.source = Some(source.into());
        self.destination = Some(destination.into());
        self
    }

    /// Appends a TLV; order is kept and duplicates are allowed.
    pub fn with_tlv(mut self, kind: u8, value: impl Into<Bytes>) -> Self {
        self.tlvs.push(Tlv::new(kind, value));
        self
    }

    /// Appends a CRC32C TLV; its value is filled in when encoding.
    pub fn with_checksum(self) -> Self {
        self.with_tlv(tlv::PP2_TYPE_CRC32C, Bytes::from_static(&[0; 4]))
    }

    pub fn is_local(&self) -> bool {
        self.command == Command::Local
    }

    /// Source and destination socket addresses, if this header relays an IP connection.
    pub fn ip_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        if self.is_local() {
            return None;
        }
        match (&self.source, &self.destination) {
            (Some(Address::Inet(src)), Some(Address::Inet(dst))) => Some((*src, *dst)),
            _ => None,
        }
    }

    /// Addresses to report for a connection carrying this header. LOCAL
    /// headers and UNSPEC transports report none.
    pub(crate) fn proxied_source(&self) -> Option<&Address> {
        if self.is_local() || self.transport_protocol == TransportProtocol::Unspec {
            return None;
        }
        self.source.as_ref()
    }

    /// Headers the v1 text form can only write as `PROXY UNKNOWN`.
    pub(crate) fn is_v1_unknown(&self) -> bool {
        self.is_local() || self.transport_protocol == TransportProtocol::Unspec
    }

    pub(crate) fn proxied_destination(&self) -> Option<&Address> {
        if self.is_local() || self.transport_protocol == TransportProtocol::Unspec {
            return None;
        }
        self.destination.as_ref()
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        if self.version == 1
            && other.version == 1
            && self.is_v1_unknown()
            && other.is_v1_unknown()
        {
            return true;
        }
        if self.version != other.version
            || self.command != other.command
            || self.transport_protocol != other.transport_protocol
        {
            return false;
        }
        if self.version == 2 && !tlv::same_sequence(&self.tlvs, &other.tlvs) {
            return false;
        }
        if self.is_local() {
            return true;
        }
        self.source == other.source && self.destination == other.destination
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} {:?} {:?}",
            self.version, self.command, self.transport_protocol
        )?;
        if let (Some(src), Some(dst)) = (&self.source, &self.destination) {
            write!(f, " {} -> {}", src, dst)?;
        }
        if !self.tlvs.is_empty() {
            write!(f, " ({} TLVs)", self.tlvs.len())?;
        }
        Ok(())
    }
}
