//! PROXY Protocol Aware Connection
//!
//! [`ProxyStream`] decorates an accepted transport. The first read, address
//! query or bulk transfer consumes the PROXY header (if any) exactly once,
//! applies the connection's [`Policy`] and memoizes the outcome. Afterwards
//! I/O goes straight to the transport, after replaying any bytes that were
//! read while probing for the header.
//!
//! Header resolution runs under the header-read timeout when one is set.
//! The caller's own read deadline is saved before and restored after that
//! phase on every exit path.

use std::any::Any;
use std::fmt;
use std::future::poll_fn;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::deadline::Deadline;
use super::error::{BoxError, HeaderError, ProxyError};
use super::header::{Address, Header};
use super::parser::{parse, signature_recognized, Parsed, READ_CHUNK};
use super::policy::{ConnPolicyOptions, Policy, PolicyResolver};
use super::transport::{BulkCopy, Transport};

/// Header-validation hook. An error becomes the connection's terminal error.
pub type ValidateHeader = Arc<dyn Fn(&Header) -> Result<(), BoxError> + Send + Sync>;

enum State {
    Unresolved,
    /// Header phase in progress; `bounded` is set when the active read
    /// deadline is the header-read timeout rather than the caller's own.
    Reading {
        policy: Policy,
        saved_read_deadline: Option<Instant>,
        bounded: bool,
    },
    Resolved {
        header: Option<Header>,
    },
    Failed(ProxyError),
}

/// A transport decorated with PROXY protocol handling.
pub struct ProxyStream<T> {
    inner: T,
    policy: Option<Policy>,
    resolver: Option<PolicyResolver>,
    header_timeout: Option<Duration>,
    validator: Option<ValidateHeader>,
    /// Bytes read past the header, replayed before the next transport read
    buffer: BytesMut,
    state: State,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl<T> ProxyStream<T> {
    /// Decorate `inner` with policy USE, no header timeout and no validator.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            policy: Some(Policy::Use),
            resolver: None,
            header_timeout: None,
            validator: None,
            buffer: BytesMut::new(),
            state: State::Unresolved,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }

    /// Use an already resolved policy.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self.resolver = None;
        self
    }

    /// Resolve the policy at the first trigger instead.
    pub fn with_resolver(mut self, resolver: PolicyResolver) -> Self {
        self.policy = None;
        self.resolver = Some(resolver);
        self
    }

    /// Bound the header phase. `None` leaves the caller's read deadline in charge.
    pub fn with_header_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.header_timeout = timeout;
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Header) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub(crate) fn with_shared_validator(mut self, validator: Option<ValidateHeader>) -> Self {
        self.validator = validator;
        self
    }

    /// Policy in effect, once known.
    pub fn policy(&self) -> Option<Policy> {
        self.policy
    }

    /// Header of a resolved connection, without triggering resolution.
    pub fn header(&self) -> Option<&Header> {
        match &self.state {
            State::Resolved { header } => header.as_ref(),
            _ => None,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Raw transport. Reading from it directly skips the replay buffer.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Raw transport plus bytes already read from it but not yet delivered.
    pub fn into_parts(self) -> (T, Bytes) {
        (self.inner, self.buffer.freeze())
    }

    /// Set both read and write deadlines.
    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }

    /// Reads after `at` fail with `TimedOut`. During the header phase this
    /// replaces the deadline that is restored once the phase ends.
    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        if let State::Reading {
            saved_read_deadline,
            bounded,
            ..
        } = &mut self.state
        {
            *saved_read_deadline = at;
            if *bounded {
                return;
            }
        }
        self.read_deadline.set(at);
    }

    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Reading {
                saved_read_deadline,
                ..
            } => *saved_read_deadline,
            _ => self.read_deadline.get(),
        }
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline.get()
    }
}

impl<T: Transport> ProxyStream<T> {
    /// Reported remote address: the header's source under USE/REQUIRE,
    /// the transport's peer otherwise.
    pub async fn peer_addr(&mut self) -> Result<Address, ProxyError> {
        poll_fn(|cx| self.poll_resolve(cx)).await?;
        match self.header().and_then(Header::proxied_source) {
            Some(addr) => Ok(addr.clone()),
            None => Ok(self.inner.peer_address()?),
        }
    }

    /// Reported local address: the header's destination under USE/REQUIRE,
    /// the transport's local address otherwise.
    pub async fn local_addr(&mut self) -> Result<Address, ProxyError> {
        poll_fn(|cx| self.poll_resolve(cx)).await?;
        match self.header().and_then(Header::proxied_destination) {
            Some(addr) => Ok(addr.clone()),
            None => Ok(self.inner.local_address()?),
        }
    }

    /// The header this connection carried, if it was used.
    pub async fn proxy_header(&mut self) -> Result<Option<&Header>, ProxyError> {
        poll_fn(|cx| self.poll_resolve(cx)).await?;
        Ok(self.header())
    }

    pub fn tcp_stream(&self) -> Option<&TcpStream> {
        (&self.inner as &dyn Any).downcast_ref::<TcpStream>()
    }

    #[cfg(unix)]
    pub fn unix_stream(&self) -> Option<&UnixStream> {
        (&self.inner as &dyn Any).downcast_ref::<UnixStream>()
    }

    /// Resolve the header, then move everything left in this stream into `dst`
    /// using `dst`'s bulk copy primitive.
    pub async fn write_to<D>(&mut self, dst: &mut D) -> io::Result<u64>
    where
        D: BulkCopy + ?Sized,
    {
        poll_fn(|cx| self.poll_resolve(cx)).await?;

        let replay = self.buffer.split().freeze();
        if !replay.is_empty() {
            dst.write_all(&replay).await?;
        }
        let copied = dst.copy_from(&mut self.inner).await?;
        Ok(replay.len() as u64 + copied)
    }

    fn poll_resolve(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), ProxyError>> {
        loop {
            match self.state {
                State::Resolved { .. } => return Poll::Ready(Ok(())),
                State::Failed(ref err) => return Poll::Ready(Err(err.clone())),
                State::Unresolved => {
                    self.state = match self.begin() {
                        Ok(state) => state,
                        Err(err) => State::Failed(err),
                    };
                }
                State::Reading {
                    policy,
                    saved_read_deadline,
                    bounded,
                } => {
                    let outcome = ready!(self.poll_header(cx, bounded));
                    self.read_deadline.set(saved_read_deadline);
                    self.state = match self.apply(policy, outcome) {
                        Ok(header) => State::Resolved { header },
                        Err(err) => {
                            debug!(policy = ?policy, error = %err, "PROXY header resolution failed");
                            State::Failed(err)
                        }
                    };
                }
            }
        }
    }

    fn begin(&mut self) -> Result<State, ProxyError> {
        let policy = match (self.policy, &self.resolver) {
            (Some(policy), _) => policy,
            (None, Some(resolver)) => {
                let opts = ConnPolicyOptions {
                    upstream: self.inner.peer_address()?,
                    downstream: self.inner.local_address()?,
                };
                resolver.resolve(&opts)?
            }
            (None, None) => Policy::Use,
        };
        self.policy = Some(policy);

        if policy == Policy::Skip {
            return Ok(State::Resolved { header: None });
        }

        let saved_read_deadline = self.read_deadline.get();
        let bounded = match self.header_timeout {
            Some(timeout) => {
                self.read_deadline.set(Some(Instant::now() + timeout));
                true
            }
            None => false,
        };
        Ok(State::Reading {
            policy,
            saved_read_deadline,
            bounded,
        })
    }

    fn poll_header(
        &mut self,
        cx: &mut Context<'_>,
        bounded: bool,
    ) -> Poll<Result<Option<Header>, ProxyError>> {
        loop {
            match parse(&self.buffer)? {
                Parsed::Header { header, len } => {
                    self.buffer.advance(len);
                    return Poll::Ready(Ok(Some(header)));
                }
                Parsed::NotProxy => return Poll::Ready(Ok(None)),
                Parsed::Incomplete => {}
            }

            if self.read_deadline.poll_elapsed(cx) {
                if bounded && !signature_recognized(&self.buffer) {
                    trace!(buffered = self.buffer.len(), "header timeout before signature");
                    return Poll::Ready(Ok(None));
                }
                return Poll::Ready(Err(timed_out().into()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                if signature_recognized(&self.buffer) {
                    return Poll::Ready(Err(HeaderError::Truncated.into()));
                }
                return Poll::Ready(Ok(None));
            }
            trace!(bytes = filled.len(), "probing for PROXY header");
            self.buffer.extend_from_slice(filled);
        }
    }

    fn apply(
        &self,
        policy: Policy,
        outcome: Result<Option<Header>, ProxyError>,
    ) -> Result<Option<Header>, ProxyError> {
        match (outcome?, policy) {
            (None, Policy::Require) => Err(ProxyError::NoProxyProtocol),
            (None, _) => {
                trace!(policy = ?policy, "no PROXY header");
                Ok(None)
            }
            (Some(_), Policy::Reject) => Err(ProxyError::SuperfluousProxyHeader),
            (Some(header), Policy::Ignore) => {
                trace!(header = %header, "PROXY header ignored");
                Ok(None)
            }
            (Some(header), _) => {
                if let Some(validate) = &self.validator {
                    validate(&header).map_err(ProxyError::validation)?;
                }
                debug!(header = %header, "PROXY header accepted");
                Ok(Some(header))
            }
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::from(io::ErrorKind::TimedOut)
}

impl<T: Transport> AsyncRead for ProxyStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_resolve(cx))?;

        if !this.buffer.is_empty() {
            let n = buf.remaining().min(this.buffer.len());
            buf.put_slice(&this.buffer[..n]);
            this.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }

        if this.read_deadline.poll_elapsed(cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: Transport> AsyncWrite for ProxyStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_deadline.poll_elapsed(cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_deadline.poll_elapsed(cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl<T: Transport> BulkCopy for ProxyStream<T> {
    async fn copy_from(&mut self, src: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<u64> {
        self.inner.copy_from(src).await
    }
}

impl<T: fmt::Debug> fmt::Debug for ProxyStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Unresolved => "unresolved",
            State::Reading { .. } => "reading",
            State::Resolved { .. } => "resolved",
            State::Failed(_) => "failed",
        };
        f.debug_struct("ProxyStream")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .field("state", &state)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::error::Rejection;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Duplex pipe with fixed addresses and a counting bulk copy.
    #[derive(Debug)]
    struct MockConn {
        io: DuplexStream,
        peer: Address,
        local: Address,
        bulk_copies: Arc<AtomicUsize>,
    }

    impl AsyncRead for MockConn {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for MockConn {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.io).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_shutdown(cx)
        }
    }

    #[async_trait]
    impl BulkCopy for MockConn {
        async fn copy_from(
            &mut self,
            src: &mut (dyn AsyncRead + Unpin + Send),
        ) -> io::Result<u64> {
            self.bulk_copies.fetch_add(1, Ordering::SeqCst);
            tokio::io::copy(src, &mut self.io).await
        }
    }

    impl Transport for MockConn {
        fn peer_address(&self) -> io::Result<Address> {
            Ok(self.peer.clone())
        }

        fn local_address(&self) -> io::Result<Address> {
            Ok(self.local.clone())
        }
    }

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    const PEER: &str = "127.0.0.1:50000";
    const LOCAL: &str = "127.0.0.1:8080";

    fn conn() -> (MockConn, DuplexStream) {
        let (server, client) = tokio::io::duplex(4096);
        let conn = MockConn {
            io: server,
            peer: Address::Inet(sock(PEER)),
            local: Address::Inet(sock(LOCAL)),
            bulk_copies: Arc::new(AtomicUsize::new(0)),
        };
        (conn, client)
    }

    fn v2_header() -> Header {
        Header::from_addrs(2, sock("10.1.1.1:1000"), sock("20.2.2.2:2000"))
    }

    async fn send(client: &mut DuplexStream, header: &Header, payload: &[u8]) {
        client.write_all(&header.encode().unwrap()).await.unwrap();
        client.write_all(payload).await.unwrap();
    }

    fn proxy_error(err: &io::Error) -> ProxyError {
        ProxyError::from_io(err).cloned().unwrap()
    }

    #[tokio::test]
    async fn test_use_reports_header_addresses() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"hello").await;

        let mut stream = ProxyStream::new(raw);
        assert_eq!(stream.header(), None);
        assert_eq!(
            stream.peer_addr().await.unwrap(),
            Address::Inet(sock("10.1.1.1:1000"))
        );
        assert_eq!(
            stream.local_addr().await.unwrap(),
            Address::Inet(sock("20.2.2.2:2000"))
        );

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(stream.proxy_header().await.unwrap(), Some(&v2_header()));
    }

    #[tokio::test]
    async fn test_use_without_header_replays_probe() {
        let (raw, mut client) = conn();
        client.write_all(b"ping").await.unwrap();

        let mut stream = ProxyStream::new(raw);
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(stream.peer_addr().await.unwrap(), Address::Inet(sock(PEER)));
        assert_eq!(stream.proxy_header().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_require_without_header_is_sticky() {
        let (raw, mut client) = conn();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut stream = ProxyStream::new(raw).with_policy(Policy::Require);
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(proxy_error(&err), ProxyError::NoProxyProtocol);

        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(proxy_error(&err), ProxyError::NoProxyProtocol);
        assert_eq!(stream.peer_addr().await, Err(ProxyError::NoProxyProtocol));
    }

    #[tokio::test]
    async fn test_reject_with_header_withholds_payload() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"secret").await;

        let mut stream = ProxyStream::new(raw).with_policy(Policy::Reject);
        assert_eq!(
            stream.local_addr().await,
            Err(ProxyError::SuperfluousProxyHeader)
        );
        let mut buf = Vec::new();
        let err = stream.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(proxy_error(&err), ProxyError::SuperfluousProxyHeader);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_ignore_consumes_header_keeps_native_addresses() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"data").await;

        let mut stream = ProxyStream::new(raw).with_policy(Policy::Ignore);
        assert_eq!(stream.peer_addr().await.unwrap(), Address::Inet(sock(PEER)));
        assert_eq!(stream.proxy_header().await.unwrap(), None);

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn test_skip_passes_header_bytes_through() {
        let (raw, mut client) = conn();
        let line = b"PROXY TCP4 10.1.1.1 20.2.2.2 1000 2000\r\n";
        client.write_all(line).await.unwrap();
        drop(client);

        let mut stream = ProxyStream::new(raw).with_policy(Policy::Skip);
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, line);
        assert_eq!(stream.peer_addr().await.unwrap(), Address::Inet(sock(PEER)));
    }

    #[tokio::test]
    async fn test_local_header_keeps_native_addresses() {
        let (raw, mut client) = conn();
        send(&mut client, &Header::local(2), b"").await;

        let mut stream = ProxyStream::new(raw).with_policy(Policy::Require);
        assert_eq!(stream.peer_addr().await.unwrap(), Address::Inet(sock(PEER)));
        assert_eq!(stream.proxy_header().await.unwrap(), Some(&Header::local(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_timeout_before_signature_means_no_header() {
        let (raw, _client) = conn();
        let mut stream = ProxyStream::new(raw).with_header_timeout(Some(Duration::from_millis(200)));
        let start = Instant::now();
        assert_eq!(stream.peer_addr().await.unwrap(), Address::Inet(sock(PEER)));
        assert!(start.elapsed() >= Duration::from_millis(200));

        let (raw, _client) = conn();
        let mut stream = ProxyStream::new(raw)
            .with_policy(Policy::Require)
            .with_header_timeout(Some(Duration::from_millis(200)));
        assert_eq!(stream.peer_addr().await, Err(ProxyError::NoProxyProtocol));
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_timeout_after_signature_is_timed_out() {
        let (raw, mut client) = conn();
        client.write_all(b"PROXY TCP4 10.1.").await.unwrap();

        let mut stream = ProxyStream::new(raw).with_header_timeout(Some(Duration::from_millis(200)));
        let err = stream.peer_addr().await.unwrap_err();
        assert!(err.is_timeout());

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_read_deadline_restored_after_header() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"").await;

        let mut stream = ProxyStream::new(raw).with_header_timeout(Some(Duration::from_millis(100)));
        let start = Instant::now();
        let deadline = start + Duration::from_secs(5);
        stream.set_read_deadline(Some(deadline));

        stream.peer_addr().await.unwrap();
        assert_eq!(stream.read_deadline(), Some(deadline));

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_without_header_timeout() {
        let (raw, _client) = conn();
        let mut stream = ProxyStream::new(raw);
        stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

        let err = stream.peer_addr().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_validator_veto_is_terminal() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"payload").await;

        let mut stream = ProxyStream::new(raw).with_validator(|header| {
            match header.source.as_ref().and_then(Address::port) {
                Some(1000) => Err(Rejection("source port blocked".into()).into()),
                _ => Ok(()),
            }
        });

        let mut buf = [0u8; 7];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let first = proxy_error(&err);
        assert!(matches!(first, ProxyError::Validation(_)));
        assert_eq!(stream.peer_addr().await, Err(first));
    }

    #[tokio::test]
    async fn test_malformed_header_is_terminal() {
        let (raw, mut client) = conn();
        let mut bytes = v2_header().encode().unwrap().to_vec();
        bytes[12] = 0x31;
        client.write_all(&bytes).await.unwrap();

        let mut stream = ProxyStream::new(raw);
        assert_eq!(
            stream.peer_addr().await,
            Err(ProxyError::Header(HeaderError::UnsupportedVersion(3)))
        );
        let mut buf = [0u8; 1];
        assert!(stream.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let (raw, mut client) = conn();
        client.write_all(b"PROXY TCP6 ::1").await.unwrap();
        drop(client);

        let mut stream = ProxyStream::new(raw);
        assert_eq!(
            stream.peer_addr().await,
            Err(ProxyError::Header(HeaderError::Truncated))
        );
    }

    #[tokio::test]
    async fn test_deferred_resolver_sees_native_addresses() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"").await;

        let resolver = PolicyResolver::connection(|opts| {
            assert_eq!(opts.upstream, Address::Inet(sock(PEER)));
            assert_eq!(opts.downstream, Address::Inet(sock(LOCAL)));
            Ok(Policy::Reject)
        });
        let mut stream = ProxyStream::new(raw).with_resolver(resolver);
        assert_eq!(stream.policy(), None);
        assert_eq!(
            stream.proxy_header().await,
            Err(ProxyError::SuperfluousProxyHeader)
        );
        assert_eq!(stream.policy(), Some(Policy::Reject));
    }

    #[tokio::test]
    async fn test_shared_connection_resolves_once() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"abc").await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let resolver = PolicyResolver::upstream(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Policy::Use)
        });
        let stream = Arc::new(tokio::sync::Mutex::new(
            ProxyStream::new(raw).with_resolver(resolver),
        ));

        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 3];
                stream.lock().await.read_exact(&mut buf).await.map(|_| buf)
            })
        };
        let addr = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.lock().await.peer_addr().await })
        };

        assert_eq!(&reader.await.unwrap().unwrap(), b"abc");
        assert_eq!(
            addr.await.unwrap().unwrap(),
            Address::Inet(sock("10.1.1.1:1000"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_to_uses_destination_bulk_copy() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"payload").await;
        drop(client);

        let (mut dst, mut dst_peer) = conn();
        let copies = dst.bulk_copies.clone();

        let mut stream = ProxyStream::new(raw);
        let n = stream.write_to(&mut dst).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(copies.load(Ordering::SeqCst), 1);
        drop(dst);

        let mut out = Vec::new();
        dst_peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
        assert_eq!(stream.header(), Some(&v2_header()));
    }

    #[tokio::test]
    async fn test_copy_from_reaches_inner_transport() {
        let (raw, mut peer) = conn();
        let copies = raw.bulk_copies.clone();
        let mut stream = ProxyStream::new(raw);

        let mut src: &[u8] = b"to the wire";
        assert_eq!(stream.copy_from(&mut src).await.unwrap(), 11);
        assert_eq!(copies.load(Ordering::SeqCst), 1);
        // writes never trigger header resolution
        assert_eq!(stream.header(), None);
        drop(stream);

        let mut out = Vec::new();
        peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"to the wire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_deadline() {
        let (raw, _client) = conn();
        let mut stream = ProxyStream::new(raw);
        stream.write_all(b"ok").await.unwrap();

        stream.set_write_deadline(Some(Instant::now() + Duration::from_millis(10)));
        tokio::time::advance(Duration::from_millis(20)).await;
        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        stream.set_deadline(None);
        stream.write_all(b"again").await.unwrap();
    }

    #[tokio::test]
    async fn test_into_parts_returns_unread_bytes() {
        let (raw, mut client) = conn();
        send(&mut client, &v2_header(), b"rest").await;

        let mut stream = ProxyStream::new(raw);
        stream.proxy_header().await.unwrap();
        assert!(stream.tcp_stream().is_none());

        let (_inner, replay) = stream.into_parts();
        assert_eq!(&replay[..], b"rest");
    }
}
