//! Request coalescing: at most one in-flight load per key.
//!
//! Concurrent loads for the same key attach to a single execution and all
//! observe its result. The execution runs on a detached task, so it completes
//! (and can populate a cache) even if every interested caller has gone away;
//! a caller that drops its future simply stops waiting.

use std::any::Any;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::DynError;

/// Handle to an in-flight (or completed) coalesced load.
///
/// Cloneable; every clone resolves to the same result. A panic inside the
/// load surfaces as a [`DynError`] to all holders.
pub type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, DynError>>>;

/// Coalesces concurrent loads by key.
///
/// [`load`](Self::load) hands out a [`FlightFuture`] per key; the work
/// closure of the first caller is the only one that runs. The flight record
/// is removed before any waiter observes the result, so a later call for the
/// same key starts a fresh execution. Failed executions are not retried here;
/// retrying is the caller's decision.
pub struct Coalescer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Distinguishes a flight from its successors for the same key.
    generation: AtomicU64,
    flights: Arc<DashMap<K, Flight<T>>>,
}

struct Flight<T> {
    generation: u64,
    fut: FlightFuture<T>,
}

impl<K, T> Coalescer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Attach to the in-flight load for `key`, starting one if none exists.
    ///
    /// `f` is only invoked when this call starts the execution. The returned
    /// future may be dropped freely; the execution keeps running on its own
    /// task until completion.
    pub fn load<F, Fut>(&self, key: K, f: F) -> FlightFuture<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        // fast path
        if let Some(flight) = self.flights.get(&key) {
            return flight.fut.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let key_captured = key.clone();

        match self.flights.entry(key) {
            dashmap::Entry::Occupied(o) => {
                // race: another caller registered a flight in the meantime
                o.get().fut.clone()
            }
            dashmap::Entry::Vacant(v) => {
                let flights = Arc::downgrade(&self.flights);
                let fut = f();
                let task = tokio::spawn(async move {
                    let res = AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_err);
                    // unregister before any waiter observes the result, so a
                    // subsequent call for this key starts a fresh execution
                    if let Some(flights) = flights.upgrade() {
                        flights
                            .remove_if(&key_captured, |_, flight| flight.generation == generation);
                    }
                    res
                });
                let fut = async move {
                    match task.await {
                        Ok(res) => res,
                        Err(e) if e.is_cancelled() => Err(str_err("runtime was shut down")),
                        Err(e) => std::panic::resume_unwind(e.into_panic()),
                    }
                }
                .boxed()
                .shared();
                v.insert(Flight {
                    generation,
                    fut: fut.clone(),
                });
                fut
            }
        }
    }

    /// Number of loads currently in flight.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// Returns `true` if no load is in flight.
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

impl<K, T> Default for Coalescer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            generation: Default::default(),
            flights: Default::default(),
        }
    }
}

impl<K, T> std::fmt::Debug for Coalescer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("in_flight", &self.flights.len())
            .finish_non_exhaustive()
    }
}

/// Create a [`DynError`] from a message.
pub fn str_err(s: &str) -> DynError {
    Arc::new(StringError(s.to_owned()))
}

/// Error produced by [`str_err`].
#[derive(Debug)]
pub struct StringError(String);

impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {}

/// Convert a panic payload into a [`DynError`].
fn panic_err(payload: Box<dyn Any + Send>) -> DynError {
    let message = if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else {
        "<unknown>".to_owned()
    };

    Arc::new(PanicError { message })
}

/// A caught panic from a coalesced load.
#[derive(Debug)]
pub struct PanicError {
    message: String,
}

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

impl std::error::Error for PanicError {}
