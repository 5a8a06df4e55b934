//! The connection handle contract (§3 C2).
//!
//! `Connection` is the pool's only view of a transport: an opaque,
//! shareable object with observable state, a protocol kind, an optional
//! keep-alive expiry, and a single `request` entrypoint. Everything about
//! how bytes get on the wire — TLS, HTTP/1.1 framing, HTTP/2 multiplexing
//! — is the concrete implementor's problem; [`HttpConnection`] is the one
//! this crate ships, built on `hyper`'s client-conn API the way
//! `tottoto-hyper-util`'s legacy client builds `PoolClient`.

pub mod hyperconn;
pub mod io;

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;

use crate::error::BoxError;
use crate::origin::Origin;

pub use self::hyperconn::{HttpConnection, HttpConnectionFactory};
pub use self::io::Io;

/// A body with all of its concrete type parameters erased, shared by both
/// requests and responses at the pool boundary.
pub type PoolBody = BoxBody<Bytes, BoxError>;

/// A request as carried across the pool boundary: method, URI and headers
/// from the `http` crate, with the body type erased to [`PoolBody`].
pub type Request = ::http::Request<PoolBody>;

/// A response as carried across the pool boundary.
pub type Response = ::http::Response<PoolBody>;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The five states a connection handle passes through (§3).
///
/// Transition summary: creation → `Pending` → `Active` → (`Idle` for
/// keep-alive, or `Closed` terminally). `Ready` is a short-lived
/// "reserved, not yet handed the next request" marker set by
/// `mark_as_ready` while still under the pool's acquiry lock (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Active,
    Ready,
    Idle,
    Closed,
}

/// Returned by [`Connection::request`] instead of being raised as an
/// exception (§9 REDESIGN FLAGS: "exception-as-signal should be a tagged
/// return").
pub enum RequestError {
    /// This handle can't service the request (HTTP/2 stream limit, a
    /// GOAWAY already in flight, …). The request is handed back unsent so
    /// the pool's acquisition loop can retry it against a fresh
    /// connection; the pool performs no mutation of its own on this path,
    /// the handle has already self-removed or transitioned to `Closed`.
    NewConnectionRequired(Request),
    /// Any other failure. The pool removes the handle from its map and
    /// propagates this to the caller.
    Failed(BoxError),
}

/// The pool's contract for a connection handle (§3 C2).
///
/// Implementors are shared (`Arc<Self>`) across concurrent requesters once
/// an HTTP/2 handle is `Active`, so every method takes `&self` and relies
/// on interior mutability for state transitions.
pub trait Connection: Send + Sync + 'static {
    /// Immutable after construction.
    fn origin(&self) -> &Origin;

    fn state(&self) -> ConnectionState;

    /// Mutually exclusive once the protocol has been negotiated; both are
    /// `false` while `Pending`.
    fn is_http11(&self) -> bool;
    fn is_http2(&self) -> bool;

    fn expires_at(&self) -> Option<Instant>;
    fn set_expires_at(&self, at: Option<Instant>);

    /// Non-blocking: true iff bytes are buffered on the socket or the peer
    /// has closed it. Used to evict dead idle connections (§4.2, P5).
    fn is_socket_readable(&self) -> bool;

    /// `Idle` → `Ready`. Must be callable while the pool's acquiry lock is
    /// held, synchronously, so the transition is visible to the next
    /// concurrent acquirer before the lock is released.
    fn mark_as_ready(&self);

    /// Issues a request, connecting and handshaking lazily on first use.
    fn request(&self, req: Request) -> BoxFuture<'_, Result<Response, RequestError>>;

    /// Called by the pool exactly once, when the caller's response body is
    /// dropped (§4.4). For an HTTP/1.1 handle this is the `Active` → `Idle`
    /// transition — the connection may not be reused while the response is
    /// still being read off the wire. An HTTP/2 handle stays `Active`
    /// forever once established (it never goes `Idle`; it is shared by
    /// `ACTIVE`+`is_http2()` reuse instead), so this is a no-op there.
    fn on_response_closed(&self);

    /// In-place TLS upgrade of the underlying socket (used by the
    /// CONNECT-tunnel path after a successful `200` response).
    fn start_tls<'a>(&'a self, server_name: &'a str) -> BoxFuture<'a, Result<(), BoxError>>;

    /// Terminal. Sets state to `Closed` and frees the socket. Calling
    /// `close` on an already-closed handle is a no-op.
    fn close(&self);

    /// A one-line summary for [`crate::pool::Pool::get_connection_info`].
    fn info(&self) -> String;
}

/// Builds connection handles for a [`crate::pool::Pool`] (§3 C2).
///
/// Separated from `Connection` itself so the pool can construct a handle
/// without already owning one — `create` returns a `Pending` handle with
/// no socket yet (dialing happens lazily, on first `request`), matching
/// the lazy-connect behavior of the original `SyncHTTPConnection`.
pub trait ConnectionFactory: Clone + Send + Sync + 'static {
    type Connection: Connection;

    /// A fresh, unconnected handle for `origin`.
    fn create(&self, origin: Origin) -> Self::Connection;

    /// A fresh handle for `origin` that inherits an already-open socket
    /// (§4.8: the CONNECT-tunnel case, where the auxiliary connection's
    /// transport is handed to the tunneled target's handle instead of
    /// dialing a new one).
    fn create_with_socket(&self, origin: Origin, socket: Io) -> Self::Connection;
}
