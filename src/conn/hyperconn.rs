//! [`HttpConnection`]: the `hyper`-backed implementation of
//! [`crate::conn::Connection`], built the way `tottoto-hyper-util`'s
//! legacy client builds `PoolClient` — a `SendRequest` wrapped with the
//! bookkeeping the pool needs (state, protocol, expiry) plus the
//! background task that drives the connection's I/O.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use http_body_util::BodyExt;
use tokio::sync::Mutex as AsyncMutex;

use crate::conn::io::Io;
use crate::conn::{BoxFuture, Connection, ConnectionFactory, ConnectionState, PoolBody, Request, RequestError, Response};
use crate::connect::Connect;
use crate::error::BoxError;
use crate::origin::Origin;
use crate::rt::{TokioExecutor, TokioIo};

const STATE_PENDING: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_IDLE: u8 = 3;
const STATE_CLOSED: u8 = 4;

/// A `rustls::ClientConfig` trusting the Mozilla root program via
/// `webpki-roots`, for callers that don't need to bring their own
/// `ssl_context` (§6). Grounded on `jitlabs-sg-mihomo-rust`'s
/// `HttpProxy::get_root_store`.
#[cfg(feature = "tls")]
pub fn default_tls_config() -> std::sync::Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    std::sync::Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// TLS-upgrades a plain TCP socket in place; used both by a handle's own
/// lazy handshake and by the CONNECT-tunnel path in [`crate::proxy`], which
/// needs the same upgrade applied to a socket that isn't wrapped in a
/// `HttpConnection` yet.
#[cfg(feature = "tls")]
pub(crate) async fn upgrade_tls(tls_config: &std::sync::Arc<rustls::ClientConfig>, io: Io, host: &str) -> Result<Io, BoxError> {
    let Io::Tcp(tcp) = io else {
        return Ok(io);
    };
    let server_name = rustls::pki_types::ServerName::try_from(host.to_owned()).map_err(|e| Box::new(e) as BoxError)?;
    let connector = tokio_rustls::TlsConnector::from(tls_config.clone());
    let stream = connector.connect(server_name, tcp).await.map_err(|e| Box::new(e) as BoxError)?;
    Ok(Io::Tls(Box::new(stream)))
}

fn state_from_u8(v: u8) -> ConnectionState {
    match v {
        STATE_PENDING => ConnectionState::Pending,
        STATE_ACTIVE => ConnectionState::Active,
        STATE_READY => ConnectionState::Ready,
        STATE_IDLE => ConnectionState::Idle,
        _ => ConnectionState::Closed,
    }
}

enum Tx {
    Http1(hyper::client::conn::http1::SendRequest<PoolBody>),
    #[cfg(feature = "http2")]
    Http2(hyper::client::conn::http2::SendRequest<PoolBody>),
}

/// Options the factory bakes into every handle it creates (§6).
#[derive(Clone)]
pub struct HttpConnectionFactory<C> {
    pub connector: C,
    #[cfg(feature = "tls")]
    pub tls_config: std::sync::Arc<rustls::ClientConfig>,
    pub prefer_http2: bool,
}

impl<C> ConnectionFactory for HttpConnectionFactory<C>
where
    C: Connect + Clone,
{
    type Connection = HttpConnection<C>;

    fn create(&self, origin: Origin) -> HttpConnection<C> {
        HttpConnection::new(origin, self.clone())
    }

    fn create_with_socket(&self, origin: Origin, socket: Io) -> HttpConnection<C> {
        HttpConnection::with_socket(origin, self.clone(), socket)
    }
}

/// A single TCP/TLS transport multiplexed as HTTP/1.1 or HTTP/2 (§3 C2).
///
/// Connects and handshakes lazily, on the first call to `request`; every
/// later caller observes the same in-flight handshake rather than racing
/// to dial twice (P4's "HTTP/2 coalescing" depends on this).
pub struct HttpConnection<C> {
    origin: Origin,
    factory: HttpConnectionFactory<C>,
    state: AtomicU8,
    http2: AtomicBool,
    closed: std::sync::Arc<AtomicBool>,
    expires_at: StdMutex<Option<Instant>>,
    tx: AsyncMutex<Option<Tx>>,
    inherited_socket: StdMutex<Option<Io>>,
}

impl<C> HttpConnection<C>
where
    C: Connect + Clone,
{
    fn new(origin: Origin, factory: HttpConnectionFactory<C>) -> HttpConnection<C> {
        HttpConnection {
            origin,
            factory,
            state: AtomicU8::new(STATE_PENDING),
            http2: AtomicBool::new(false),
            closed: std::sync::Arc::new(AtomicBool::new(false)),
            expires_at: StdMutex::new(None),
            tx: AsyncMutex::new(None),
            inherited_socket: StdMutex::new(None),
        }
    }

    fn with_socket(origin: Origin, factory: HttpConnectionFactory<C>, socket: Io) -> HttpConnection<C> {
        let conn = HttpConnection::new(origin, factory);
        *conn.inherited_socket.lock().unwrap() = Some(socket);
        conn
    }

    /// Dials (or reuses an inherited socket), optionally upgrades to TLS,
    /// and performs the HTTP/1.1 or HTTP/2 handshake, spawning the
    /// background task that drives the connection's I/O to completion.
    async fn connect_and_handshake(&self) -> Result<(), BoxError> {
        let mut io = match self.inherited_socket.lock().unwrap().take() {
            Some(io) => io,
            None => self.factory.connector.connect(&self.origin).await?,
        };

        #[cfg(feature = "tls")]
        if crate::connect::is_https(&self.origin) && !io.is_tls() {
            io = self.upgrade_tls(io, &self.origin.host.clone()).await?;
        }
        #[cfg(not(feature = "tls"))]
        if crate::connect::is_https(&self.origin) {
            return Err("https origin requires the `tls` feature".into());
        }

        let negotiated_h2 = io.negotiated_h2();
        let use_h2 = self.factory.prefer_http2 || negotiated_h2;

        #[cfg(feature = "http2")]
        if use_h2 {
            let io = TokioIo::new(io);
            let (sender, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor)
                .handshake(io)
                .await?;
            let closed = self.closed.clone();
            tokio::spawn(async move {
                let _ = conn.await;
                closed.store(true, Ordering::Release);
            });
            *self.tx.lock().await = Some(Tx::Http2(sender));
            self.http2.store(true, Ordering::Release);
            return Ok(());
        }
        #[cfg(not(feature = "http2"))]
        let _ = use_h2;

        let io = TokioIo::new(io);
        let (sender, conn) = hyper::client::conn::http1::Builder::new()
            .handshake(io)
            .await?;
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let _ = conn.with_upgrades().await;
            closed.store(true, Ordering::Release);
        });
        *self.tx.lock().await = Some(Tx::Http1(sender));
        Ok(())
    }

    #[cfg(feature = "tls")]
    async fn upgrade_tls(&self, io: Io, host: &str) -> Result<Io, BoxError> {
        upgrade_tls(&self.factory.tls_config, io, host).await
    }

    async fn ensure_connected(&self) -> Result<(), BoxError> {
        if self.tx.lock().await.is_some() {
            return Ok(());
        }
        self.connect_and_handshake().await?;
        self.state.store(STATE_ACTIVE, Ordering::Release);
        Ok(())
    }

    /// Shared tail of both the HTTP/1.1 and HTTP/2 dispatch paths: maps a
    /// successful `hyper` response onto the pool's erased [`Response`], or
    /// marks the handle `Closed` on failure.
    fn finish_request(
        &self,
        result: Result<::http::Response<hyper::body::Incoming>, hyper::Error>,
    ) -> Result<Response, RequestError> {
        match result {
            Ok(resp) => Ok(resp.map(|b| b.map_err(|e| Box::new(e) as BoxError).boxed())),
            Err(e) => {
                self.state.store(STATE_CLOSED, Ordering::Release);
                self.closed.store(true, Ordering::Release);
                Err(RequestError::Failed(Box::new(e)))
            }
        }
    }
}

impl<C> Connection for HttpConnection<C>
where
    C: Connect + Clone,
{
    fn origin(&self) -> &Origin {
        &self.origin
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_http11(&self) -> bool {
        !self.http2.load(Ordering::Acquire) && self.state() != ConnectionState::Pending
    }

    fn is_http2(&self) -> bool {
        self.http2.load(Ordering::Acquire)
    }

    fn expires_at(&self) -> Option<Instant> {
        *self.expires_at.lock().unwrap()
    }

    fn set_expires_at(&self, at: Option<Instant>) {
        *self.expires_at.lock().unwrap() = at;
    }

    fn is_socket_readable(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_as_ready(&self) {
        let _ = self
            .state
            .compare_exchange(STATE_IDLE, STATE_READY, Ordering::AcqRel, Ordering::Acquire);
    }

    fn request(&self, req: Request) -> BoxFuture<'_, Result<Response, RequestError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(RequestError::NewConnectionRequired(req));
            }
            self.state.store(STATE_ACTIVE, Ordering::Release);
            if let Err(error) = self.ensure_connected().await {
                tracing::debug!(%error, origin = %self.origin, "handshake failed");
                self.state.store(STATE_CLOSED, Ordering::Release);
                self.closed.store(true, Ordering::Release);
                return Err(RequestError::NewConnectionRequired(req));
            }

            // HTTP/2 senders are `Clone` (hyper dispatches concurrent
            // streams over one `SendRequest`); clone it out and drop the
            // lock before `ready`/`send_request` so concurrent requesters
            // sharing this `Active` handle don't serialize on `tx`'s
            // mutex. HTTP/1.1 senders are not `Clone` — but invariant I6
            // (§3) guarantees only one requester ever holds an HTTP/1.1
            // handle between `mark_as_ready` and the response body
            // closing, so holding the guard across its await is safe and
            // required.
            #[cfg(feature = "http2")]
            let h2_sender = {
                let mut guard = self.tx.lock().await;
                match guard.as_mut() {
                    Some(Tx::Http2(s)) => Some(s.clone()),
                    Some(Tx::Http1(_)) => None,
                    None => return Err(RequestError::NewConnectionRequired(req)),
                }
            };

            #[cfg(feature = "http2")]
            if let Some(mut sender) = h2_sender {
                if sender.ready().await.is_err() {
                    return Err(RequestError::NewConnectionRequired(req));
                }
                return self.finish_request(sender.send_request(req).await);
            }

            let mut guard = self.tx.lock().await;
            let result = match guard.as_mut() {
                Some(Tx::Http1(sender)) => {
                    if sender.ready().await.is_err() {
                        return Err(RequestError::NewConnectionRequired(req));
                    }
                    sender.send_request(req).await
                }
                #[cfg(feature = "http2")]
                Some(Tx::Http2(_)) => unreachable!("http2 sender handled above"),
                None => return Err(RequestError::NewConnectionRequired(req)),
            };
            self.finish_request(result)
        })
    }

    fn start_tls<'a>(&'a self, _server_name: &'a str) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            #[cfg(feature = "tls")]
            {
                let taken = self.inherited_socket.lock().unwrap().take();
                if let Some(io) = taken {
                    let upgraded = self.upgrade_tls(io, _server_name).await?;
                    *self.inherited_socket.lock().unwrap() = Some(upgraded);
                    return Ok(());
                }
            }
            Ok(())
        })
    }

    fn on_response_closed(&self) {
        if !self.is_http2()
            && self
                .state
                .compare_exchange(STATE_ACTIVE, STATE_IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::trace!(origin = %self.origin, "connection went idle");
        }
    }

    fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }

    fn info(&self) -> String {
        format!(
            "{} {} {:?}",
            self.origin,
            if self.is_http2() { "h2" } else { "http/1.1" },
            self.state()
        )
    }
}
