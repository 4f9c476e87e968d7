//! PROXY Protocol Encoder
//!
//! Produces the v1 text or v2 binary form of a [`Header`], matching its
//! `version` field.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::error::{HeaderError, ProxyError};
use super::header::{Address, Header, TransportProtocol};
use super::parser::{checksum, PROXY_V2_SIGNATURE, UNIX_PATH_LEN, V2_PREFIX_LEN};
use super::tlv;

impl Header {
    /// Encode into wire bytes.
    pub fn encode(&self) -> Result<Bytes, HeaderError> {
        match self.version {
            1 => encode_v1(self),
            2 => encode_v2(self),
            v => Err(HeaderError::UnsupportedVersion(v)),
        }
    }

    /// Encode and write to `sink`, returning the number of bytes written.
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        sink: &mut W,
    ) -> Result<usize, ProxyError> {
        let bytes = self.encode()?;
        sink.write_all(&bytes).await?;
        Ok(bytes.len())
    }
}

fn encode_v1(header: &Header) -> Result<Bytes, HeaderError> {
    if header.is_v1_unknown() {
        return Ok(Bytes::from_static(b"PROXY UNKNOWN\r\n"));
    }
    let proto = match header.transport_protocol {
        TransportProtocol::TcpV4 => "TCP4",
        TransportProtocol::TcpV6 => "TCP6",
        _ => return Err(HeaderError::NotRepresentable),
    };

    let (src, dst) = ip_pair(header)?;
    let line = format!(
        "PROXY {} {} {} {} {}\r\n",
        proto,
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    );
    Ok(Bytes::from(line))
}

fn encode_v2(header: &Header) -> Result<Bytes, HeaderError> {
    let transport = header.transport_protocol;
    let tlv_len: usize = header.tlvs.iter().map(tlv::Tlv::encoded_len).sum();
    let payload_len = transport.address_len() + tlv_len;
    let length = u16::try_from(payload_len).map_err(|_| HeaderError::TooLong)?;

    let mut buf = BytesMut::with_capacity(V2_PREFIX_LEN + payload_len);
    buf.put_slice(PROXY_V2_SIGNATURE);
    buf.put_u8(0x20 | header.command.nibble());
    buf.put_u8(transport.byte());
    buf.put_u16(length);

    put_addresses(&mut buf, header)?;

    let mut checksum_at = None;
    for tlv in &header.tlvs {
        let len = u16::try_from(tlv.value.len()).map_err(|_| HeaderError::TooLong)?;
        buf.put_u8(tlv.kind);
        buf.put_u16(len);
        if tlv.kind == tlv::PP2_TYPE_CRC32C && checksum_at.is_none() {
            if len != 4 {
                return Err(HeaderError::InvalidChecksumTlv(len as usize));
            }
            checksum_at = Some(buf.len());
            buf.put_u32(0);
        } else {
            buf.put_slice(&tlv.value);
        }
    }

    if let Some(at) = checksum_at {
        let crc = checksum(&buf, at);
        buf[at..at + 4].copy_from_slice(&crc.to_be_bytes());
    }

    Ok(buf.freeze())
}

fn put_addresses(buf: &mut BytesMut, header: &Header) -> Result<(), HeaderError> {
    let transport = header.transport_protocol;
    if transport == TransportProtocol::Unspec {
        return Ok(());
    }

    // LOCAL headers carry a zeroed block when no addresses are given
    if header.is_local() && header.source.is_none() && header.destination.is_none() {
        buf.put_bytes(0, transport.address_len());
        return Ok(());
    }

    if transport.is_unix() {
        let (src, dst) = match (&header.source, &header.destination) {
            (Some(Address::Unix(src)), Some(Address::Unix(dst))) => (src, dst),
            (Some(_), Some(_)) => return Err(HeaderError::AddressMismatch),
            _ => return Err(HeaderError::MissingAddress),
        };
        for path in [src, dst] {
            if path.len() > UNIX_PATH_LEN {
                return Err(HeaderError::UnixPathTooLong(path.len()));
            }
            buf.put_slice(path);
            buf.put_bytes(0, UNIX_PATH_LEN - path.len());
        }
        return Ok(());
    }

    let (src, dst) = ip_pair(header)?;
    match (src, dst) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) if transport.is_ipv4() => {
            buf.put_slice(&src.ip().octets());
            buf.put_slice(&dst.ip().octets());
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) if transport.is_ipv6() => {
            buf.put_slice(&src.ip().octets());
            buf.put_slice(&dst.ip().octets());
        }
        _ => return Err(HeaderError::AddressMismatch),
    }
    buf.put_u16(src.port());
    buf.put_u16(dst.port());
    Ok(())
}

/// Source and destination as IP socket addresses of the header's family.
fn ip_pair(header: &Header) -> Result<(SocketAddr, SocketAddr), HeaderError> {
    let (src, dst) = match (&header.source, &header.destination) {
        (Some(Address::Inet(src)), Some(Address::Inet(dst))) => (*src, *dst),
        (Some(_), Some(_)) => return Err(HeaderError::AddressMismatch),
        _ => return Err(HeaderError::MissingAddress),
    };
    let family_ok = if header.transport_protocol.is_ipv4() {
        src.is_ipv4() && dst.is_ipv4()
    } else {
        src.is_ipv6() && dst.is_ipv6()
    };
    if !family_ok {
        return Err(HeaderError::AddressMismatch);
    }
    Ok((src, dst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::header::Command;
    use crate::proxy::parser::{parse, Parsed};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn decode(bytes: &[u8]) -> Header {
        match parse(bytes).unwrap() {
            Parsed::Header { header, len } => {
                assert_eq!(len, bytes.len());
                header
            }
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_v1() {
        let h = Header::from_addrs(1, sock("10.1.1.1:1000"), sock("20.2.2.2:2000"));
        assert_eq!(
            h.encode().unwrap().as_ref(),
            b"PROXY TCP4 10.1.1.1 20.2.2.2 1000 2000\r\n"
        );

        let h = Header::from_addrs(1, sock("[2001:db8::1]:1"), sock("[::1]:443"));
        assert_eq!(
            h.encode().unwrap().as_ref(),
            b"PROXY TCP6 2001:db8::1 ::1 1 443\r\n"
        );

        assert_eq!(
            Header::local(1).encode().unwrap().as_ref(),
            b"PROXY UNKNOWN\r\n"
        );
    }

    #[test]
    fn test_encode_v1_unknown_forms_roundtrip() {
        let forms = [
            Header::local(1),
            Header::new(1, Command::Proxy, TransportProtocol::Unspec),
            Header::new(1, Command::Local, TransportProtocol::TcpV4)
                .with_addresses(sock("10.1.1.1:1000"), sock("20.2.2.2:2000")),
        ];
        for h in forms {
            let bytes = h.encode().unwrap();
            assert_eq!(bytes.as_ref(), b"PROXY UNKNOWN\r\n");
            let decoded = decode(&bytes);
            assert_eq!(decoded.command, Command::Local);
            assert_eq!(decoded, h);
        }

        // v2 keeps the command, so the forms stay distinct there
        assert_ne!(
            Header::local(2),
            Header::new(2, Command::Proxy, TransportProtocol::Unspec)
        );
    }

    #[test]
    fn test_encode_v1_rejects_udp() {
        let h = Header::new(1, Command::Proxy, TransportProtocol::UdpV4)
            .with_addresses(sock("1.1.1.1:1"), sock("2.2.2.2:2"));
        assert_eq!(h.encode(), Err(HeaderError::NotRepresentable));
    }

    #[test]
    fn test_encode_v2_tcp4_layout() {
        let h = Header::from_addrs(2, sock("10.1.1.1:1000"), sock("20.2.2.2:2000"));
        let bytes = h.encode().unwrap();
        let mut expected = PROXY_V2_SIGNATURE.to_vec();
        expected.extend_from_slice(&[0x21, 0x11, 0x00, 0x0C]);
        expected.extend_from_slice(&[10, 1, 1, 1, 20, 2, 2, 2, 0x03, 0xE8, 0x07, 0xD0]);
        assert_eq!(bytes.as_ref(), &expected[..]);
    }

    #[test]
    fn test_encode_v2_errors() {
        let mismatched = Header::new(2, Command::Proxy, TransportProtocol::TcpV4)
            .with_addresses(sock("[::1]:1"), sock("[::2]:2"));
        assert_eq!(mismatched.encode(), Err(HeaderError::AddressMismatch));

        let missing = Header::new(2, Command::Proxy, TransportProtocol::TcpV6);
        assert_eq!(missing.encode(), Err(HeaderError::MissingAddress));

        let long_path = Header::new(2, Command::Proxy, TransportProtocol::UnixStream)
            .with_addresses(Address::unix(vec![b'a'; 109]), Address::unix("/b"));
        assert_eq!(long_path.encode(), Err(HeaderError::UnixPathTooLong(109)));

        let huge = Header::local(2).with_tlv(tlv::PP2_TYPE_NOOP, vec![0u8; 70_000]);
        assert_eq!(huge.encode(), Err(HeaderError::TooLong));

        let mut bad_version = Header::local(2);
        bad_version.version = 3;
        assert_eq!(bad_version.encode(), Err(HeaderError::UnsupportedVersion(3)));
    }

    #[test]
    fn test_encode_v2_fills_checksum() {
        let h = Header::from_addrs(2, sock("10.1.1.1:1000"), sock("20.2.2.2:2000"))
            .with_tlv(tlv::PP2_TYPE_AUTHORITY, "example.com")
            .with_checksum();
        let bytes = h.encode().unwrap();
        let decoded = decode(&bytes);
        assert_eq!(decoded, h);
        assert_ne!(decoded.crc32c(), Some(0));

        // Flipping any byte outside the signature breaks the checksum or the framing
        let mut corrupted = bytes.to_vec();
        corrupted[20] ^= 0x01;
        assert!(parse(&corrupted).is_err());
    }

    #[test]
    fn test_encode_v2_local_with_family() {
        let h = Header::new(2, Command::Local, TransportProtocol::TcpV6);
        let bytes = h.encode().unwrap();
        assert_eq!(bytes.len(), 16 + 36);
        assert_eq!(decode(&bytes), h);
    }

    #[test]
    fn test_encode_v2_unix_roundtrip() {
        let h = Header::new(2, Command::Proxy, TransportProtocol::UnixDatagram)
            .with_addresses(Address::unix("/run/a.sock"), Address::unix("/run/b.sock"));
        assert_eq!(decode(&h.encode().unwrap()), h);
    }

    #[tokio::test]
    async fn test_write_to() {
        let h = Header::from_addrs(2, sock("10.1.1.1:1000"), sock("20.2.2.2:2000"));
        let mut sink = Vec::new();
        let n = h.write_to(&mut sink).await.unwrap();
        assert_eq!(n, 28);
        assert_eq!(decode(&sink), h);
    }

    #[test]
    fn test_interop_ppp_parses_our_output() {
        let h = Header::from_addrs(2, sock("10.1.1.1:1000"), sock("20.2.2.2:2000"))
            .with_tlv(tlv::PP2_TYPE_NOOP, "hi");
        let bytes = h.encode().unwrap();
        let parsed = ppp::v2::Header::try_from(&bytes[..]).unwrap();
        match &parsed.addresses {
            ppp::v2::Addresses::IPv4(addrs) => {
                assert_eq!(addrs.source_address.to_string(), "10.1.1.1");
                assert_eq!(addrs.source_port, 1000);
                assert_eq!(addrs.destination_port, 2000);
            }
            other => panic!("unexpected addresses {:?}", other),
        }
        let kinds: Vec<u8> = parsed.tlvs().map(|t| t.unwrap().kind).collect();
        assert_eq!(kinds, vec![tlv::PP2_TYPE_NOOP]);

        let v1 = Header::from_addrs(1, sock("10.1.1.1:1000"), sock("20.2.2.2:2000"))
            .encode()
            .unwrap();
        let line = std::str::from_utf8(&v1).unwrap();
        assert!(ppp::v1::Header::try_from(line).is_ok());
    }

    fn arb_tlvs() -> impl Strategy<Value = Vec<tlv::Tlv>> {
        prop::collection::vec(
            (
                any::<u8>().prop_filter("checksum TLVs are derived", |k| {
                    *k != tlv::PP2_TYPE_CRC32C
                }),
                prop::collection::vec(any::<u8>(), 0..32),
            )
                .prop_map(|(kind, value)| tlv::Tlv::new(kind, value)),
            0..4,
        )
    }

    fn arb_header() -> impl Strategy<Value = Header> {
        let v4 = (any::<[u8; 4]>(), any::<u16>(), any::<[u8; 4]>(), any::<u16>()).prop_map(
            |(s, sp, d, dp)| {
                (
                    TransportProtocol::TcpV4,
                    SocketAddr::from((s, sp)),
                    SocketAddr::from((d, dp)),
                )
            },
        );
        let v6 = (any::<[u8; 16]>(), any::<u16>(), any::<[u8; 16]>(), any::<u16>()).prop_map(
            |(s, sp, d, dp)| {
                (
                    TransportProtocol::UdpV6,
                    SocketAddr::from((s, sp)),
                    SocketAddr::from((d, dp)),
                )
            },
        );
        (prop_oneof![v4, v6], arb_tlvs(), any::<bool>()).prop_map(
            |((transport, src, dst), tlvs, checksum)| {
                let mut h = Header::new(2, Command::Proxy, transport).with_addresses(src, dst);
                h.tlvs = tlvs;
                if checksum {
                    h = h.with_checksum();
                }
                h
            },
        )
    }

    proptest! {
        #[test]
        fn prop_v2_roundtrip(header in arb_header()) {
            let bytes = header.encode().unwrap();
            prop_assert_eq!(decode(&bytes), header);
        }

        #[test]
        fn prop_v1_roundtrip(src in any::<[u8; 4]>(), sp in any::<u16>(), dst in any::<[u8; 4]>(), dp in any::<u16>()) {
            let header = Header::from_addrs(1, SocketAddr::from((src, sp)), SocketAddr::from((dst, dp)));
            let bytes = header.encode().unwrap();
            prop_assert_eq!(decode(&bytes), header);
        }
    }
}
