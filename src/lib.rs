//! A client-side HTTP connection pool multiplexing HTTP/1.1 and HTTP/2
//! over origin-keyed connections, with optional HTTP-proxy support.
//!
//! The pool ([`pool::Pool`]) maps each request to the origin derived from
//! its URI, reuses an idle or HTTP/2-active connection to that origin
//! when one exists, and otherwise dials a fresh one through a
//! [`conn::ConnectionFactory`] — [`conn::HttpConnectionFactory`] being the
//! `hyper`-backed implementation this crate ships. A caller that needs to
//! go through an upstream HTTP proxy uses [`proxy::ProxyPool`] instead,
//! which forwards plain requests in absolute-form and tunnels `https://`
//! ones through a CONNECT handshake.
//!
//! ```no_run
//! # async fn run() -> Result<(), conn_pool::error::Error> {
//! use conn_pool::config::PoolConfig;
//! use conn_pool::conn::HttpConnectionFactory;
//! use conn_pool::connect::TcpConnect;
//! use conn_pool::pool::Pool;
//! use http_body_util::BodyExt;
//!
//! let factory = HttpConnectionFactory {
//!     connector: TcpConnect::default(),
//!     #[cfg(feature = "tls")]
//!     tls_config: conn_pool::conn::hyperconn::default_tls_config(),
//!     prefer_http2: false,
//! };
//! let pool = Pool::with_default_backend(PoolConfig::default(), factory);
//!
//! let req = http::Request::builder()
//!     .uri("http://example.com/")
//!     .body(http_body_util::Empty::new().map_err(|never: std::convert::Infallible| match never {}).boxed())
//!     .unwrap();
//! let resp = pool.request(req).await?;
//! # let _ = resp;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod conn;
pub mod connect;
pub mod error;
pub mod origin;
pub mod pool;
#[cfg(feature = "proxy")]
pub mod proxy;
pub(crate) mod rt;
pub mod stream;

pub use crate::error::Error;
pub use crate::origin::{Origin, Scheme, Url};
pub use crate::pool::Pool;
#[cfg(feature = "proxy")]
pub use crate::proxy::ProxyPool;
