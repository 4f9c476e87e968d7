//! PROXY Protocol Configuration
//!
//! Configuration types for HAProxy PROXY protocol v1/v2 support.

use serde::Deserialize;
use std::time::Duration;

use crate::proxy::Policy;

/// PROXY protocol configuration for a listener
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyProtocolConfig {
    /// Enable PROXY protocol parsing on this listener.
    /// When false every connection is passed through untouched (SKIP).
    pub enabled: bool,

    /// Policy applied to every connection when no resolver is installed
    pub policy: Policy,

    /// Trust TLS termination info from PROXY v2 TLVs.
    /// When true, PP2_TYPE_SSL details are reported for each connection.
    pub tls_termination: bool,

    /// Timeout for reading the PROXY header in milliseconds.
    /// 0 uses `default_read_header_timeout_ms`, negative disables it.
    pub read_header_timeout_ms: i64,

    /// Fallback header timeout in milliseconds.
    /// Default: 10 seconds
    pub default_read_header_timeout_ms: u64,
}

impl Default for ProxyProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: Policy::Use,
            tls_termination: false,
            read_header_timeout_ms: 0,
            default_read_header_timeout_ms: 10_000,
        }
    }
}

impl ProxyProtocolConfig {
    pub fn read_header_timeout(&self) -> ReadHeaderTimeout {
        ReadHeaderTimeout::from_millis(self.read_header_timeout_ms)
    }

    /// Get the fallback timeout as Duration
    pub fn default_read_header_timeout(&self) -> Duration {
        Duration::from_millis(self.default_read_header_timeout_ms)
    }
}

/// Header-read timeout setting of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadHeaderTimeout {
    /// Use the listener's default timeout
    #[default]
    Default,
    /// Wait for the header without a time limit
    Disabled,
    After(Duration),
}

impl ReadHeaderTimeout {
    /// 0 means default, negative means disabled.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => ReadHeaderTimeout::Default,
            ms if ms < 0 => ReadHeaderTimeout::Disabled,
            ms => ReadHeaderTimeout::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    pub fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            ReadHeaderTimeout::Default => Some(default),
            ReadHeaderTimeout::Disabled => None,
            ReadHeaderTimeout::After(timeout) => Some(timeout),
        }
    }
}

impl From<Duration> for ReadHeaderTimeout {
    fn from(timeout: Duration) -> Self {
        if timeout.is_zero() {
            ReadHeaderTimeout::Default
        } else {
            ReadHeaderTimeout::After(timeout)
        }
    }
}
