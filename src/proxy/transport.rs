//! Transport Contract
//!
//! What a decorated connection needs from the byte stream underneath it:
//! tokio read/write, native peer and local addresses, and an optional bulk
//! copy primitive.

use std::any::Any;
use std::io;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use super::header::Address;

/// Bulk byte transfer into a writer.
///
/// The default is a buffered `tokio::io::copy`. Transports with a cheaper
/// path (splice, sendfile, an in-process pipe) override `copy_from`.
#[async_trait]
pub trait BulkCopy: AsyncWrite + Unpin + Send {
    /// Copy everything `src` yields until EOF into `self`.
    async fn copy_from(&mut self, src: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<u64> {
        tokio::io::copy(src, self).await
    }
}

/// Duplex byte stream a [`ProxyStream`](super::ProxyStream) can decorate.
pub trait Transport: AsyncRead + AsyncWrite + BulkCopy + Unpin + Send + Any {
    /// Address of the remote end as seen by the socket.
    fn peer_address(&self) -> io::Result<Address>;

    /// Address of the local end as seen by the socket.
    fn local_address(&self) -> io::Result<Address>;
}

impl BulkCopy for TcpStream {}

impl Transport for TcpStream {
    fn peer_address(&self) -> io::Result<Address> {
        self.peer_addr().map(Address::Inet)
    }

    fn local_address(&self) -> io::Result<Address> {
        self.local_addr().map(Address::Inet)
    }
}

#[cfg(unix)]
impl BulkCopy for UnixStream {}

#[cfg(unix)]
impl Transport for UnixStream {
    fn peer_address(&self) -> io::Result<Address> {
        self.peer_addr().map(|addr| unix_address(&addr))
    }

    fn local_address(&self) -> io::Result<Address> {
        self.local_addr().map(|addr| unix_address(&addr))
    }
}

#[cfg(unix)]
pub(crate) fn unix_address(addr: &tokio::net::unix::SocketAddr) -> Address {
    match addr.as_pathname() {
        Some(path) => Address::Unix(Bytes::copy_from_slice(path.as_os_str().as_bytes())),
        None => Address::Unix(Bytes::new()),
    }
}
