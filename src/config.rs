//! Pool and proxy configuration (§6), gathered into builders the way
//! `hyper-util`'s legacy client groups dial/pool options onto its
//! `Builder` rather than taking a dozen loose constructor arguments.

use std::time::Duration;

/// Construction-time options for [`crate::pool::Pool`].
///
/// `ssl_context`, `uds`, `local_address` and `retries` from §6's option
/// table are not fields here: they govern how a socket for an origin gets
/// dialed, which is entirely the concern of whichever [`crate::connect::Connect`]
/// the pool's [`crate::conn::ConnectionFactory`] was built with (see
/// [`crate::connect::TcpConnect`]/`UdsConnect`). Duplicating them onto
/// `PoolConfig` as well would just be two places a caller could disagree
/// with themselves about the bind address or retry count.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Total concurrent connections across all origins. `None` is
    /// unbounded (SPEC_FULL §10's `NullSemaphore`-equivalent).
    pub max_connections: Option<usize>,
    /// Idle connections retained across all origins; connections beyond
    /// this count are closed as soon as they go idle (§4.3). Counts
    /// every tracked connection, not just idle ones — the over-counting
    /// behavior `original_source` exhibits is preserved deliberately,
    /// see `DESIGN.md`.
    pub max_keepalive_connections: Option<usize>,
    /// How long an idle connection may sit before the sweeper closes it.
    pub keepalive_expiry: Option<Duration>,
    /// Enables HTTP/2 negotiation (ALPN over TLS, or prior-knowledge
    /// when set for a plaintext origin).
    pub http2: bool,
    /// How long a caller waits for a semaphore permit before
    /// `Error::PoolTimeout` (§4.1, `ext.timeout.pool`).
    pub pool_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: None,
            max_keepalive_connections: None,
            keepalive_expiry: Some(Duration::from_secs(5)),
            http2: false,
            pool_timeout: None,
        }
    }
}

/// How a [`crate::proxy::ProxyPool`] routes a request (§4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// `https://` targets tunnel via CONNECT; `http://` targets forward.
    #[default]
    Default,
    /// Always forward, even `https://` targets (proxy must support it).
    ForwardOnly,
    /// Always tunnel, even `http://` targets.
    TunnelOnly,
}

/// Construction-time options for [`crate::proxy::ProxyPool`].
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub proxy_host: Box<str>,
    pub proxy_port: u16,
    /// Headers merged into every request sent to, or CONNECT issued
    /// against, the proxy (§4.8 `merge_headers`, override wins).
    pub proxy_headers: Vec<(http::HeaderName, http::HeaderValue)>,
    pub proxy_mode: ProxyMode,
}
