//! Pluggable concurrency primitives (§3 C3, §6, §9 REDESIGN FLAGS).
//!
//! httpcore resolves its semaphore lazily, on first use, "to make sure
//! backend autodetection always runs within an async context". The
//! redesign flag in spec §9 asks for the opposite: the backend is a value,
//! supplied once at construction, and the semaphore is built eagerly.
//! [`Backend`] is that value; [`TokioBackend`] is the only implementation
//! this crate ships, matching the async/cooperative-task runtime chosen in
//! SPEC_FULL §5.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;

/// A source of monotonic time and semaphore construction, supplied once
/// when a [`crate::pool::Pool`] is built.
pub trait Backend: Clone + Send + Sync + 'static {
    /// Monotonic time, in the same clock the pool uses for keep-alive
    /// expiry bookkeeping. Only differences between calls are meaningful.
    fn now(&self) -> Instant;

    /// Builds the pool's global concurrency semaphore. `None` means
    /// unbounded.
    fn create_semaphore(&self, capacity: Option<usize>) -> PoolSemaphore;
}

/// The default backend: `tokio::time::Instant`-compatible clock plus a
/// `tokio::sync::Semaphore`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioBackend;

impl Backend for TokioBackend {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn create_semaphore(&self, capacity: Option<usize>) -> PoolSemaphore {
        PoolSemaphore::new(capacity)
    }
}

/// A counting semaphore with an optional cap; `None` behaves as an
/// always-available admission path (the "unbounded" `max_connections`
/// case — see SPEC_FULL §10 for why this replaces httpcore's
/// `NullSemaphore` object).
pub struct PoolSemaphore(Option<Arc<Semaphore>>);

impl PoolSemaphore {
    fn new(capacity: Option<usize>) -> PoolSemaphore {
        PoolSemaphore(capacity.map(|c| Arc::new(Semaphore::new(c))))
    }

    /// Acquires a permit, waiting up to `timeout` (`None` waits forever).
    /// The returned permit releases the slot when dropped — this is how
    /// `add_to_pool`/`remove_from_pool` net exactly one acquire and one
    /// release per handle (P2) without any manual bookkeeping.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Option<OwnedSemaphorePermit>, Error> {
        let Some(sem) = &self.0 else {
            return Ok(None);
        };
        let sem = sem.clone();
        let acquire = sem.acquire_owned();
        let permit = match timeout {
            Some(d) => tokio::time::timeout(d, acquire)
                .await
                .map_err(|_| Error::PoolTimeout)?,
            None => acquire.await,
        };
        Ok(Some(permit.expect("pool semaphore is never closed")))
    }
}
