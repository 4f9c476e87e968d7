//! PROXY protocol v1/v2 for tokio.
//!
//! ```no_run
//! use proxyproto::{ProxyListener, PolicyResolver};
//! use tokio::io::AsyncReadExt;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let raw = tokio::net::TcpListener::bind("0.0.0.0:7000").await?;
//! let listener = ProxyListener::new(raw)
//!     .with_resolver(PolicyResolver::strict_allow_list(["10.0.0.0/8"])?);
//!
//! let mut conn = listener.accept().await?;
//! let client = conn.peer_addr().await?;
//! let mut buf = Vec::new();
//! conn.read_to_end(&mut buf).await?;
//! println!("{} sent {} bytes", client, buf.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod proxy;

pub use proxy::{
    Accepted, Address, Header, Policy, PolicyResolver, ProxyError, ProxyListener, ProxyStream,
};
