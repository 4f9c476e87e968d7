//! proxyproto - PROXY protocol echo server
//!
//! Accepts connections behind a load balancer, logs the client address the
//! PROXY header reports and echoes everything back.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxyproto::config::Config;
use proxyproto::proxy::Accepted;
use proxyproto::{Policy, PolicyResolver, ProxyListener};

#[derive(Parser, Debug)]
#[command(name = "proxyproto")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Policy for every connection: use, require, reject, ignore or skip
    #[arg(short, long)]
    policy: Option<Policy>,

    /// Only trust PROXY headers from these addresses or networks (repeatable).
    /// Headers from anyone else are rejected.
    #[arg(long)]
    trust: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxyproto=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(policy) = cli.policy {
        config.proxy_protocol.enabled = true;
        config.proxy_protocol.policy = policy;
    }

    let raw = TcpListener::bind(&config.listen).await?;
    let mut listener = ProxyListener::from_config(raw, &config.proxy_protocol);
    if !cli.trust.is_empty() {
        listener = listener.with_resolver(PolicyResolver::strict_allow_list(&cli.trust)?);
    }

    info!(
        address = %listener.local_addr()?,
        enabled = config.proxy_protocol.enabled,
        policy = ?config.proxy_protocol.policy,
        header_timeout = ?listener.header_timeout(),
        "Listening"
    );

    let tls_termination = config.proxy_protocol.tls_termination;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(async move {
                        if let Err(e) = serve(conn, tls_termination).await {
                            debug!(error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

async fn serve(mut conn: Accepted<TcpStream>, tls_termination: bool) -> std::io::Result<()> {
    let client = match conn.peer_addr().await {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "Dropping connection");
            return Ok(());
        }
    };

    match conn.proxy_header().await {
        Ok(Some(header)) => {
            info!(client = %client, header = %header, "Connection accepted");
            if tls_termination {
                if let Some(ssl) = header.ssl() {
                    info!(
                        client = %client,
                        tls_version = ?ssl.version(),
                        client_cn = ?ssl.common_name(),
                        verified = ssl.verified(),
                        "TLS terminated upstream"
                    );
                }
            }
        }
        Ok(None) => info!(client = %client, "Connection accepted without PROXY header"),
        Err(e) => {
            error!(client = %client, error = %e, "Dropping connection");
            return Ok(());
        }
    }

    let mut buf = vec![0u8; 8192];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        conn.write_all(&buf[..n]).await?;
    }
}
