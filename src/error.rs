use std::error::Error as StdError;
use std::fmt;

/// A boxed, type-erased error from a downstream collaborator (connector,
/// TLS handshake, HTTP/1.1 or HTTP/2 framing).
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors produced at the pool boundary.
///
/// `NewConnectionRequired` is deliberately absent here: it is consumed
/// internally by the acquisition loop in [`crate::pool::Pool::request`] and
/// never escapes to a caller.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// `url.scheme` was neither `http` nor `https`.
    UnsupportedProtocol,
    /// `url.host` was empty.
    LocalProtocolError(&'static str),
    /// Admission to the pool's semaphore was not granted within
    /// `ext.timeout.pool`.
    PoolTimeout,
    /// The CONNECT handshake through a proxy failed, or raised while
    /// establishing the tunnel.
    ProxyError(BoxError),
    /// Dialing the origin (TCP/TLS/UDS) failed.
    Connect(BoxError),
    /// `Connection::request` failed for a reason other than
    /// `NewConnectionRequired`.
    Request(BoxError),
}

impl Error {
    /// Renders a CONNECT failure as `"<status> <reason>"` (§4.8), where the
    /// reason phrase comes off the wire rather than `http::StatusCode`'s
    /// canonical table — a proxy's own reason phrase is not guaranteed to
    /// match it.
    pub(crate) fn proxy_status_with_reason(code: u16, reason: &str) -> Error {
        Error::ProxyError(format!("{code} {reason}").into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedProtocol => write!(f, "unsupported URL scheme, expected http or https"),
            Error::LocalProtocolError(msg) => write!(f, "{msg}"),
            Error::PoolTimeout => write!(f, "timed out waiting for a pool connection slot"),
            Error::ProxyError(e) => write!(f, "proxy error: {e}"),
            Error::Connect(e) => write!(f, "connect error: {e}"),
            Error::Request(e) => write!(f, "request error: {e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::ProxyError(e) | Error::Connect(e) | Error::Request(e) => Some(e.as_ref()),
            Error::UnsupportedProtocol | Error::LocalProtocolError(_) | Error::PoolTimeout => None,
        }
    }
}
