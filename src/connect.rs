//! Dialing a fresh socket for an [`Origin`] (§6: DNS, socket I/O and TLS
//! contexts are external collaborators; this module is the crate's
//! default implementation of that collaborator, the way `hyper-util`'s
//! `client-legacy` feature ships `HttpConnector`).

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::conn::io::Io;
use crate::conn::BoxFuture;
use crate::error::BoxError;
use crate::origin::{Origin, Scheme};

/// Whether `origin` needs a TLS handshake layered over the dialed socket.
pub(crate) fn is_https(origin: &Origin) -> bool {
    origin.scheme == Scheme::Https
}

/// Dials the TCP (or UDS) socket for an origin. TLS, when needed, is
/// layered on top by [`crate::conn::HttpConnection`] calling
/// `start_tls` after a plain connector hands back a `Io::Tcp`.
pub trait Connect: Send + Sync + 'static {
    fn connect<'a>(&'a self, origin: &'a Origin) -> BoxFuture<'a, Result<Io, BoxError>>;
}

/// A plain TCP connector honoring `local_address` (bind address / address
/// family selection, §6) and `retries` (connect-level retry count, §6).
#[derive(Clone, Debug)]
pub struct TcpConnect {
    pub local_address: Option<IpAddr>,
    pub retries: u32,
}

impl Default for TcpConnect {
    fn default() -> Self {
        TcpConnect {
            local_address: None,
            retries: 0,
        }
    }
}

impl TcpConnect {
    async fn connect_once(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let addr = format!("{host}:{port}");
        let stream = if let Some(local) = self.local_address {
            let socket = match local {
                IpAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                IpAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
            };
            socket.bind((local, 0).into())?;
            let target = tokio::net::lookup_host(&addr)
                .await?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))?;
            socket.connect(target).await?
        } else {
            TcpStream::connect(&addr).await?
        };
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

impl Connect for TcpConnect {
    fn connect<'a>(&'a self, origin: &'a Origin) -> BoxFuture<'a, Result<Io, BoxError>> {
        Box::pin(async move {
            let mut attempt = 0u32;
            loop {
                match self.connect_once(&origin.host, origin.port).await {
                    Ok(stream) => return Ok(Io::Tcp(stream)),
                    Err(e) if attempt < self.retries => {
                        tracing::debug!(error = %e, attempt, %origin, "connect attempt failed, retrying");
                        attempt += 1;
                        sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    }
                    Err(e) => return Err(Box::new(e) as BoxError),
                }
            }
        })
    }
}

/// Unix-domain-socket transport, an alternative to TCP for the whole pool
/// (§6 `uds`).
#[cfg(feature = "uds")]
#[derive(Clone, Debug)]
pub struct UdsConnect {
    pub path: std::path::PathBuf,
}

#[cfg(feature = "uds")]
impl Connect for UdsConnect {
    fn connect<'a>(&'a self, _origin: &'a Origin) -> BoxFuture<'a, Result<Io, BoxError>> {
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(&self.path)
                .await
                .map_err(|e| Box::new(e) as BoxError)?;
            Ok(Io::Uds(stream))
        })
    }
}
