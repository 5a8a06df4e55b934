//! The response body wrapper, and the RAII redesign flag from
//! `SPEC_FULL.md` §9: instead of a manual `.close()` call the caller
//! might forget, dropping the body is what notifies the pool, the same
//! way `tottoto-hyper-util`'s `Pooled<T, K>` reinserts into the idle
//! list from its own `Drop` impl.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame};

use crate::error::BoxError;

/// A callback invoked exactly once, when the wrapped body is dropped.
pub(crate) type OnClose = Box<dyn FnOnce() + Send>;

/// Wraps a connection's response body so that the pool is told when the
/// caller is done with it, however that happens — full read, partial
/// read then drop, or an error partway through.
pub struct PooledBody<B> {
    inner: B,
    on_close: Option<OnClose>,
}

impl<B> PooledBody<B> {
    pub(crate) fn new(inner: B, on_close: OnClose) -> PooledBody<B> {
        PooledBody {
            inner,
            on_close: Some(on_close),
        }
    }
}

impl<B> Body for PooledBody<B>
where
    B: Body<Data = Bytes, Error = BoxError> + Unpin,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for PooledBody<B> {
    fn drop(&mut self) {
        if let Some(cb) = self.on_close.take() {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn boxed_full(data: &'static str) -> http_body_util::combinators::BoxBody<Bytes, BoxError> {
        Full::new(Bytes::from_static(data.as_bytes()))
            .map_err(|never: std::convert::Infallible| match never {})
            .boxed()
    }

    #[tokio::test]
    async fn drop_invokes_callback_exactly_once() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let body = PooledBody::new(boxed_full("hello"), Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!called.load(Ordering::SeqCst));
        drop(body);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn callback_runs_even_without_fully_draining() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let mut body = PooledBody::new(boxed_full("partial read then dropped"), Box::new(move || flag.store(true, Ordering::SeqCst)));
        let _ = body.frame().await;
        drop(body);
        assert!(called.load(Ordering::SeqCst));
    }
}
