//! PROXY Protocol Parser
//!
//! Auto-detects and parses PROXY v1 (text) and v2 (binary) headers.
//!
//! [`parse`] works on whatever bytes have been buffered so far and tells the
//! caller whether it needs more, whether the bytes are not a PROXY header at
//! all, or how long the decoded header was. Everything after that length
//! belongs to the application and must be replayed.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use super::error::{HeaderError, ProxyError};
use super::header::{Address, Command, Header, TransportProtocol};
use super::tlv::{self, split_tlvs};

/// PROXY v1 signature: "PROXY"
pub const PROXY_V1_SIGNATURE: &[u8] = b"PROXY";

/// PROXY v2 signature (12 bytes)
pub const PROXY_V2_SIGNATURE: &[u8] = b"\r\n\r\n\x00\r\nQUIT\n";

/// Maximum v1 line length, CRLF included
pub const V1_MAX_LENGTH: usize = 107;

/// Signature, version/command, family/protocol and length
pub const V2_PREFIX_LEN: usize = 16;

/// Size of each path in a v2 UNIX address block
pub const UNIX_PATH_LEN: usize = 108;

/// Bytes requested from the stream per read while looking for a header
pub(crate) const READ_CHUNK: usize = 536;

/// Result of looking at the buffered prefix of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// More bytes are needed to decide
    Incomplete,
    /// The stream does not start with a PROXY header
    NotProxy,
    /// A complete header occupying the first `len` bytes
    Header { header: Header, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signature {
    Partial,
    Absent,
    V1,
    V2,
}

fn detect(buf: &[u8]) -> Signature {
    if buf.is_empty() {
        return Signature::Partial;
    }
    for (sig, found) in [
        (PROXY_V2_SIGNATURE, Signature::V2),
        (PROXY_V1_SIGNATURE, Signature::V1),
    ] {
        let n = buf.len().min(sig.len());
        if buf[..n] == sig[..n] {
            return if n == sig.len() {
                found
            } else {
                Signature::Partial
            };
        }
    }
    Signature::Absent
}

/// True once `buf` starts with a complete v1 or v2 signature.
pub fn signature_recognized(buf: &[u8]) -> bool {
    matches!(detect(buf), Signature::V1 | Signature::V2)
}

/// Decode a header from the start of `buf`.
pub fn parse(buf: &[u8]) -> Result<Parsed, HeaderError> {
    match detect(buf) {
        Signature::Partial => Ok(Parsed::Incomplete),
        Signature::Absent => Ok(Parsed::NotProxy),
        Signature::V1 => parse_v1_header(buf),
        Signature::V2 => parse_v2_header(buf),
    }
}

/// Read a PROXY header from a stream
///
/// Returns `None` when the stream does not start with a header. The second
/// element holds every byte read past the header (or every byte read at all
/// when there was none); it must be consumed before reading the stream again.
///
/// If `timeout_duration` elapses before a signature has been recognised the
/// stream is treated as carrying no header. Once a signature is recognised,
/// an elapsed timeout is an `io::ErrorKind::TimedOut` error.
pub async fn read_header<S: AsyncRead + Unpin>(
    stream: &mut S,
    timeout_duration: Option<Duration>,
) -> Result<(Option<Header>, BytesMut), ProxyError> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let result = match timeout_duration {
        Some(duration) => {
            let outcome = timeout(duration, read_until_header_complete(stream, &mut buf)).await;
            match outcome {
                Ok(result) => result,
                Err(_) if !signature_recognized(&buf) => Ok(None),
                Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
            }
        }
        None => read_until_header_complete(stream, &mut buf).await,
    };

    result.map(|header| (header, buf))
}

/// Read until `parse` reaches a verdict, leaving unconsumed bytes in `buf`
async fn read_until_header_complete<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Option<Header>, ProxyError> {
    loop {
        match parse(buf)? {
            Parsed::Header { header, len } => {
                buf.advance(len);
                return Ok(Some(header));
            }
            Parsed::NotProxy => return Ok(None),
            Parsed::Incomplete => {}
        }

        buf.reserve(READ_CHUNK);
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            if signature_recognized(buf) {
                return Err(HeaderError::Truncated.into());
            }
            return Ok(None);
        }
    }
}

/// Parse a PROXY v1 (text) header
fn parse_v1_header(buf: &[u8]) -> Result<Parsed, HeaderError> {
    let window = &buf[..buf.len().min(V1_MAX_LENGTH)];

    let Some(lf) = window.iter().position(|&b| b == b'\n') else {
        if buf.len() >= V1_MAX_LENGTH {
            return Err(HeaderError::LineTooLong);
        }
        return Ok(Parsed::Incomplete);
    };

    if lf == 0 || window[lf - 1] != b'\r' {
        return Err(HeaderError::MissingCrlf);
    }

    let header = parse_v1_line(&window[..lf - 1])?;
    Ok(Parsed::Header {
        header,
        len: lf + 1,
    })
}

/// Parse the v1 line without its CRLF
fn parse_v1_line(line: &[u8]) -> Result<Header, HeaderError> {
    if !line.is_ascii() {
        return Err(HeaderError::InvalidToken("character"));
    }
    let line = std::str::from_utf8(line).map_err(|_| HeaderError::InvalidToken("character"))?;

    let mut tokens = line.split(' ');
    if tokens.next() != Some("PROXY") {
        return Err(HeaderError::InvalidToken("signature"));
    }

    let transport = match tokens.next() {
        Some("TCP4") => TransportProtocol::TcpV4,
        Some("TCP6") => TransportProtocol::TcpV6,
        // Anything after UNKNOWN is unspecified and ignored. v1 cannot tell
        // LOCAL from PROXY over an unknown transport, so every v1 header that
        // encodes as UNKNOWN decodes as LOCAL/UNSPEC and compares equal to it.
        Some("UNKNOWN") => {
            return Ok(Header::new(1, Command::Local, TransportProtocol::Unspec));
        }
        _ => return Err(HeaderError::UnsupportedProtocol),
    };

    let fields: Vec<&str> = tokens.collect();
    if fields.len() != 4 {
        return Err(HeaderError::InvalidToken("field count"));
    }

    let source_ip = parse_v1_ip(transport, fields[0], "source address")?;
    let destination_ip = parse_v1_ip(transport, fields[1], "destination address")?;
    let source_port = parse_v1_port(fields[2], "source port")?;
    let destination_port = parse_v1_port(fields[3], "destination port")?;

    Ok(Header::new(1, Command::Proxy, transport).with_addresses(
        SocketAddr::new(source_ip, source_port),
        SocketAddr::new(destination_ip, destination_port),
    ))
}

fn parse_v1_ip(
    transport: TransportProtocol,
    token: &str,
    field: &'static str,
) -> Result<IpAddr, HeaderError> {
    // Longest textual IPv6 form is 45 characters (IPv4-mapped)
    let charset_ok = token
        .bytes()
        .all(|b| b.is_ascii_hexdigit() || b == b'.' || b == b':');
    if token.is_empty() || token.len() > 45 || !charset_ok {
        return Err(HeaderError::InvalidToken(field));
    }

    let ip = if transport.is_ipv4() {
        token.parse::<Ipv4Addr>().map(IpAddr::V4)
    } else {
        token.parse::<Ipv6Addr>().map(IpAddr::V6)
    };
    ip.map_err(|_| HeaderError::InvalidToken(field))
}

fn parse_v1_port(token: &str, field: &'static str) -> Result<u16, HeaderError> {
    let valid = !token.is_empty()
        && token.len() <= 5
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !valid {
        return Err(HeaderError::InvalidToken(field));
    }
    token
        .parse::<u16>()
        .map_err(|_| HeaderError::InvalidToken(field))
}

/// Parse a PROXY v2 (binary) header
fn parse_v2_header(buf: &[u8]) -> Result<Parsed, HeaderError> {
    // Reject bad version/command and family bytes as soon as they arrive
    if buf.len() > 12 {
        let version = buf[12] >> 4;
        if version != 2 {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        if Command::from_nibble(buf[12] & 0x0F).is_none() {
            return Err(HeaderError::UnsupportedCommand(buf[12] & 0x0F));
        }
    }
    if buf.len() > 13 && TransportProtocol::from_byte(buf[13]).is_none() {
        return Err(HeaderError::UnsupportedTransport(buf[13]));
    }
    if buf.len() < V2_PREFIX_LEN {
        return Ok(Parsed::Incomplete);
    }

    let command = Command::from_nibble(buf[12] & 0x0F)
        .ok_or(HeaderError::UnsupportedCommand(buf[12] & 0x0F))?;
    let transport =
        TransportProtocol::from_byte(buf[13]).ok_or(HeaderError::UnsupportedTransport(buf[13]))?;

    // Length covers the address block and TLVs (bytes 14-15, big-endian u16)
    let declared = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let required = transport.address_len();
    if declared < required {
        return Err(HeaderError::InvalidLength { declared, required });
    }

    let total_len = V2_PREFIX_LEN + declared;
    if buf.len() < total_len {
        return Ok(Parsed::Incomplete);
    }

    let payload = &buf[V2_PREFIX_LEN..total_len];
    let (source, destination) = parse_v2_addresses(transport, &payload[..required]);
    let tlvs = split_tlvs(&payload[required..])?;
    verify_checksum(&buf[..total_len], V2_PREFIX_LEN + required)?;

    Ok(Parsed::Header {
        header: Header {
            version: 2,
            command,
            transport_protocol: transport,
            source,
            destination,
            tlvs,
        },
        len: total_len,
    })
}

fn parse_v2_addresses(
    transport: TransportProtocol,
    block: &[u8],
) -> (Option<Address>, Option<Address>) {
    if transport.is_ipv4() {
        let src = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
        let dst = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
        let src_port = u16::from_be_bytes([block[8], block[9]]);
        let dst_port = u16::from_be_bytes([block[10], block[11]]);
        (
            Some(Address::Inet(SocketAddr::new(IpAddr::V4(src), src_port))),
            Some(Address::Inet(SocketAddr::new(IpAddr::V4(dst), dst_port))),
        )
    } else if transport.is_ipv6() {
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&block[0..16]);
        dst.copy_from_slice(&block[16..32]);
        let src_port = u16::from_be_bytes([block[32], block[33]]);
        let dst_port = u16::from_be_bytes([block[34], block[35]]);
        (
            Some(Address::Inet(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(src)),
                src_port,
            ))),
            Some(Address::Inet(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(dst)),
                dst_port,
            ))),
        )
    } else if transport.is_unix() {
        (
            Some(unix_path(&block[..UNIX_PATH_LEN])),
            Some(unix_path(&block[UNIX_PATH_LEN..2 * UNIX_PATH_LEN])),
        )
    } else {
        (None, None)
    }
}

fn unix_path(field: &[u8]) -> Address {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Address::Unix(Bytes::copy_from_slice(&field[..end]))
}

/// Verify the first CRC32C TLV, if any. TLV framing is already validated.
fn verify_checksum(header: &[u8], tlv_start: usize) -> Result<(), HeaderError> {
    let mut offset = tlv_start;
    while offset + 3 <= header.len() {
        let kind = header[offset];
        let len = u16::from_be_bytes([header[offset + 1], header[offset + 2]]) as usize;
        let value = offset + 3;

        if kind == tlv::PP2_TYPE_CRC32C {
            if len != 4 {
                return Err(HeaderError::InvalidChecksumTlv(len));
            }
            let expected = u32::from_be_bytes([
                header[value],
                header[value + 1],
                header[value + 2],
                header[value + 3],
            ]);
            let actual = checksum(header, value);
            if expected != actual {
                return Err(HeaderError::ChecksumMismatch { expected, actual });
            }
            return Ok(());
        }

        offset = value + len;
    }
    Ok(())
}

/// CRC32C of `header` with the 4 bytes at `value` taken as zero.
pub(crate) fn checksum(header: &[u8], value: usize) -> u32 {
    let crc = crc32c::crc32c(&header[..value]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &header[value + 4..])
}
