//! PROXY Protocol Aware Listener
//!
//! Wraps a raw listener. Every accepted connection gets its policy resolved
//! right away; connections whose policy is SKIP are handed out untouched,
//! all others are wrapped in a [`ProxyStream`] that reads the header lazily.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use super::error::{BoxError, ProxyError};
use super::header::{Address, Header};
use super::policy::{ConnPolicyOptions, Policy, PolicyResolver};
use super::stream::{ProxyStream, ValidateHeader};
use super::transport::{BulkCopy, Transport};
use crate::config::{ProxyProtocolConfig, ReadHeaderTimeout};

/// Header-read timeout used when a listener is not told otherwise.
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// A raw listener producing [`Transport`] streams.
#[async_trait]
pub trait Accept: Send + Sync {
    type Stream: Transport;

    /// Accept the next connection.
    async fn accept_stream(&self) -> io::Result<Self::Stream>;

    /// Address this listener is bound to.
    fn local_address(&self) -> io::Result<Address>;
}

#[async_trait]
impl Accept for TcpListener {
    type Stream = TcpStream;

    async fn accept_stream(&self) -> io::Result<TcpStream> {
        let (stream, _) = self.accept().await?;
        Ok(stream)
    }

    fn local_address(&self) -> io::Result<Address> {
        Ok(Address::Inet(self.local_addr()?))
    }
}

#[cfg(unix)]
#[async_trait]
impl Accept for UnixListener {
    type Stream = UnixStream;

    async fn accept_stream(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.accept().await?;
        Ok(stream)
    }

    fn local_address(&self) -> io::Result<Address> {
        Ok(super::transport::unix_address(&self.local_addr()?))
    }
}

/// Connection returned by [`ProxyListener::accept`].
#[derive(Debug)]
pub enum Accepted<T> {
    /// SKIP policy: the raw connection, nothing read from it
    Raw(T),
    Proxied(ProxyStream<T>),
}

impl<T: Transport> Accepted<T> {
    pub fn is_proxied(&self) -> bool {
        matches!(self, Accepted::Proxied(_))
    }

    pub fn get_ref(&self) -> &T {
        match self {
            Accepted::Raw(stream) => stream,
            Accepted::Proxied(stream) => stream.get_ref(),
        }
    }

    pub async fn peer_addr(&mut self) -> Result<Address, ProxyError> {
        match self {
            Accepted::Raw(stream) => Ok(stream.peer_address()?),
            Accepted::Proxied(stream) => stream.peer_addr().await,
        }
    }

    pub async fn local_addr(&mut self) -> Result<Address, ProxyError> {
        match self {
            Accepted::Raw(stream) => Ok(stream.local_address()?),
            Accepted::Proxied(stream) => stream.local_addr().await,
        }
    }

    pub async fn proxy_header(&mut self) -> Result<Option<&Header>, ProxyError> {
        match self {
            Accepted::Raw(_) => Ok(None),
            Accepted::Proxied(stream) => stream.proxy_header().await,
        }
    }
}

impl<T: Transport> AsyncRead for Accepted<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Accepted::Raw(stream) => Pin::new(stream).poll_read(cx, buf),
            Accepted::Proxied(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl<T: Transport> AsyncWrite for Accepted<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Accepted::Raw(stream) => Pin::new(stream).poll_write(cx, buf),
            Accepted::Proxied(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Accepted::Raw(stream) => Pin::new(stream).poll_flush(cx),
            Accepted::Proxied(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Accepted::Raw(stream) => Pin::new(stream).poll_shutdown(cx),
            Accepted::Proxied(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[async_trait]
impl<T: Transport> BulkCopy for Accepted<T> {
    async fn copy_from(&mut self, src: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<u64> {
        match self {
            Accepted::Raw(stream) => stream.copy_from(src).await,
            Accepted::Proxied(stream) => stream.copy_from(src).await,
        }
    }
}

/// Listener that resolves PROXY protocol policy per accepted connection.
pub struct ProxyListener<L> {
    inner: L,
    resolver: Option<PolicyResolver>,
    read_header_timeout: ReadHeaderTimeout,
    default_read_header_timeout: Duration,
    validator: Option<ValidateHeader>,
}

impl<L: Accept> ProxyListener<L> {
    /// Policy USE for every connection, default header timeout.
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            resolver: None,
            read_header_timeout: ReadHeaderTimeout::Default,
            default_read_header_timeout: DEFAULT_READ_HEADER_TIMEOUT,
            validator: None,
        }
    }

    pub fn from_config(inner: L, config: &ProxyProtocolConfig) -> Self {
        let listener = Self::new(inner)
            .with_read_header_timeout(config.read_header_timeout())
            .with_default_read_header_timeout(config.default_read_header_timeout());

        match (config.enabled, config.policy) {
            (false, _) => listener.with_resolver(PolicyResolver::fixed(Policy::Skip)),
            (true, Policy::Use) => listener,
            (true, policy) => listener.with_resolver(PolicyResolver::fixed(policy)),
        }
    }

    pub fn with_resolver(mut self, resolver: PolicyResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// A zero duration selects the default timeout.
    pub fn with_read_header_timeout(mut self, timeout: impl Into<ReadHeaderTimeout>) -> Self {
        self.read_header_timeout = timeout.into();
        self
    }

    pub fn with_default_read_header_timeout(mut self, timeout: Duration) -> Self {
        self.default_read_header_timeout = timeout;
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Header) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Header timeout handed to accepted connections.
    pub fn header_timeout(&self) -> Option<Duration> {
        self.read_header_timeout
            .resolve(self.default_read_header_timeout)
    }

    pub fn local_addr(&self) -> io::Result<Address> {
        self.inner.local_address()
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }

    /// Accept the next connection.
    ///
    /// Raw accept errors are returned as [`ProxyError::Io`]. Connections whose
    /// addresses cannot be read, or that the resolver answers with
    /// [`ProxyError::InvalidUpstream`], are closed and skipped. Any other
    /// resolver error, I/O errors included, is returned without a connection
    /// and leaves the listener usable.
    pub async fn accept(&self) -> Result<Accepted<L::Stream>, ProxyError> {
        loop {
            let stream = self.inner.accept_stream().await?;

            let policy = match &self.resolver {
                None => Policy::Use,
                Some(resolver) => {
                    let opts = match connection_options(&stream) {
                        Ok(opts) => opts,
                        Err(err) => {
                            debug!(error = %err, "dropping connection without addresses");
                            continue;
                        }
                    };
                    match resolver.resolve(&opts) {
                        Ok(policy) => policy,
                        Err(ProxyError::InvalidUpstream) => {
                            debug!(peer = %opts.upstream, "dropping connection from invalid upstream");
                            continue;
                        }
                        Err(err) => {
                            warn!(peer = %opts.upstream, error = %err, "PROXY policy resolution failed");
                            return Err(err);
                        }
                    }
                }
            };

            if policy == Policy::Skip {
                return Ok(Accepted::Raw(stream));
            }

            let stream = ProxyStream::new(stream)
                .with_policy(policy)
                .with_header_timeout(self.header_timeout())
                .with_shared_validator(self.validator.clone());
            return Ok(Accepted::Proxied(stream));
        }
    }
}

fn connection_options<T: Transport>(stream: &T) -> io::Result<ConnPolicyOptions> {
    Ok(ConnPolicyOptions {
        upstream: stream.peer_address()?,
        downstream: stream.local_address()?,
    })
}

impl<L: fmt::Debug> fmt::Debug for ProxyListener<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyListener")
            .field("inner", &self.inner)
            .field("resolver", &self.resolver)
            .field("read_header_timeout", &self.read_header_timeout)
            .field(
                "default_read_header_timeout",
                &self.default_read_header_timeout,
            )
            .field("validator", &self.validator.is_some())
            .finish()
    }
}
