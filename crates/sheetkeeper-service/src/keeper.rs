//! A deduplicating cache cell for a single asynchronous computation.
//!
//! A [`Keeper`] owns one fallible producer and remembers its last successful result. Concurrent
//! callers share one in-flight computation, failures are never remembered, and the value can be
//! invalidated manually or refreshed on a timer.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};

type Producer<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
type ComputationChannel<T> = Shared<oneshot::Receiver<Result<Arc<T>>>>;

enum State<T> {
    Empty,
    Pending(ComputationChannel<T>),
    Settled { value: Arc<T>, settled_at: Instant },
}

impl<T> State<T> {
    fn as_str(&self) -> &'static str {
        match self {
            State::Empty => "empty",
            State::Pending(_) => "pending",
            State::Settled { .. } => "settled",
        }
    }
}

/// The mutable part of a [`Keeper`].
///
/// Every transition that makes an in-flight computation obsolete bumps `generation`. A
/// computation only commits its result if the generation it started with is still current.
struct Slot<T> {
    generation: u64,
    state: State<T>,
}

struct KeeperInner<T> {
    name: &'static str,
    max_age: Option<Duration>,
    producer: Producer<T>,
    slot: Mutex<Slot<T>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Drop for KeeperInner<T> {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Resets a pending slot to empty if its computation goes away without committing.
///
/// This only happens when the producer panics. Committing first turns this into a no-op.
struct PendingGuard<T> {
    inner: Arc<KeeperInner<T>>,
    generation: u64,
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock();
        if slot.generation == self.generation && matches!(slot.state, State::Pending(_)) {
            slot.state = State::Empty;
        }
    }
}

/// Deduplicating, staleness-aware cache cell.
///
/// - [`get`](Self::get) returns the settled value, attaches to the in-flight computation, or
///   starts exactly one new computation.
/// - [`stale`](Self::stale) returns the settled value without waiting, or fails.
/// - [`fresh`](Self::fresh) forgets the settled value so the next `get` computes again.
/// - [`start`](Self::start) refreshes the value in the background on an interval.
///
/// Cloning a `Keeper` is cheap and yields a handle to the same cell. The background refresh
/// stops once the last handle is dropped.
pub struct Keeper<T> {
    inner: Arc<KeeperInner<T>>,
}

impl<T> Clone for Keeper<T> {
    fn clone(&self) -> Self {
        Keeper {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Keeper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, generation) = match self.inner.slot.try_lock() {
            Some(slot) => (slot.state.as_str(), slot.generation),
            None => ("locked", 0),
        };
        let refreshing = self
            .inner
            .refresh_task
            .try_lock()
            .is_some_and(|task| task.is_some());
        f.debug_struct("Keeper")
            .field("name", &self.inner.name)
            .field("state", &state)
            .field("generation", &generation)
            .field("max_age", &self.inner.max_age)
            .field("refreshing", &refreshing)
            .finish()
    }
}

impl<T> Keeper<T>
where
    T: Send + Sync + 'static,
{
    /// Creates an empty keeper around `producer`.
    ///
    /// `name` is used in logs and metrics. With `max_age` set, a settled value older than that
    /// is recomputed by the next [`get`](Self::get).
    pub fn new<F, Fut>(name: &'static str, max_age: Option<Duration>, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let producer: Producer<T> = Arc::new(move || producer().boxed());
        Keeper {
            inner: Arc::new(KeeperInner {
                name,
                max_age,
                producer,
                slot: Mutex::new(Slot {
                    generation: 0,
                    state: State::Empty,
                }),
                refresh_task: Mutex::new(None),
            }),
        }
    }

    /// Returns the cached value, computing it if necessary.
    ///
    /// Concurrent callers attach to the same computation and all observe its result, including
    /// its failure. A failed computation leaves the keeper empty, so the next call retries.
    pub async fn get(&self) -> Result<Arc<T>> {
        let channel = {
            let mut slot = self.inner.slot.lock();
            let attached = match &slot.state {
                State::Settled { value, settled_at } if !self.inner.is_expired(*settled_at) => {
                    metric!(counter("keeper.hit") += 1, "keeper" => self.inner.name);
                    return Ok(Arc::clone(value));
                }
                State::Pending(channel) => Some(channel.clone()),
                State::Settled { .. } | State::Empty => None,
            };

            match attached {
                Some(channel) => {
                    tracing::trace!(keeper = self.inner.name, "attaching to pending computation");
                    metric!(counter("keeper.dedup") += 1, "keeper" => self.inner.name);
                    channel
                }
                None => KeeperInner::spawn_computation(&self.inner, &mut slot),
            }
        };

        channel.await.unwrap_or(Err(Error::Interrupted))
    }

    /// Returns the last settled value without waiting.
    ///
    /// Fails with [`Error::NotSettled`] if nothing has settled yet, including while the very
    /// first computation is still running. Never invokes the producer and ignores `max_age`.
    pub fn stale(&self) -> Result<Arc<T>> {
        match &self.inner.slot.lock().state {
            State::Settled { value, .. } => Ok(Arc::clone(value)),
            State::Empty | State::Pending(_) => Err(Error::NotSettled),
        }
    }

    /// Forgets the settled value so the next [`get`](Self::get) computes a new one.
    ///
    /// A computation that is already running keeps serving the callers attached to it, but its
    /// result is discarded instead of becoming the settled value.
    pub fn fresh(&self) {
        let mut slot = self.inner.slot.lock();
        slot.generation += 1;
        slot.state = State::Empty;
        tracing::trace!(keeper = self.inner.name, "invalidated");
    }

    /// Refreshes the value every `interval` in the background.
    ///
    /// The first refresh happens one `interval` from now. A successful refresh replaces the
    /// settled value, a failed one is logged and keeps the previous value. Calling `start` again
    /// replaces the previous schedule. A zero `interval` stops refreshing.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(&self, interval: Duration) {
        if interval.is_zero() {
            tracing::warn!(keeper = self.inner.name, "ignoring zero refresh interval");
            self.stop();
            return;
        }

        let task = tokio::spawn(refresh_periodically(Arc::downgrade(&self.inner), interval));
        let previous = self.inner.refresh_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::debug!(keeper = self.inner.name, ?interval, "background refresh scheduled");
    }

    /// Stops the background refresh started by [`start`](Self::start), if any.
    pub fn stop(&self) {
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.abort();
            tracing::debug!(keeper = self.inner.name, "background refresh stopped");
        }
    }

    /// Returns how long ago the current value settled, if there is one.
    pub fn age(&self) -> Option<Duration> {
        match &self.inner.slot.lock().state {
            State::Settled { settled_at, .. } => Some(settled_at.elapsed()),
            State::Empty | State::Pending(_) => None,
        }
    }
}

impl<T> KeeperInner<T>
where
    T: Send + Sync + 'static,
{
    fn is_expired(&self, settled_at: Instant) -> bool {
        self.max_age
            .is_some_and(|max_age| settled_at.elapsed() >= max_age)
    }

    /// Moves `slot` into the pending state and spawns the producer.
    ///
    /// The caller holds the slot lock, so no other caller can observe the slot between the
    /// check and this transition. The computation runs as its own task: dropping every waiter
    /// does not cancel it.
    fn spawn_computation(this: &Arc<Self>, slot: &mut Slot<T>) -> ComputationChannel<T> {
        slot.generation += 1;
        let generation = slot.generation;

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        slot.state = State::Pending(channel.clone());

        let guard = PendingGuard {
            inner: Arc::clone(this),
            generation,
        };
        tracing::debug!(keeper = this.name, generation, "starting computation");

        tokio::spawn(async move {
            let inner = Arc::clone(&guard.inner);
            let result = (inner.producer)().await.map(Arc::new);
            inner.commit(generation, &result);
            // Commit before releasing the waiters. New callers either see the committed state
            // or attach to this channel, never a dead one.
            drop(guard);
            sender.send(result).ok();
        });

        channel
    }

    fn commit(&self, generation: u64, result: &Result<Arc<T>>) {
        let status = if result.is_ok() { "ok" } else { "error" };
        metric!(counter("keeper.compute") += 1, "keeper" => self.name, "status" => status);

        let mut slot = self.slot.lock();
        if slot.generation != generation {
            tracing::debug!(keeper = self.name, generation, "discarding superseded result");
            metric!(counter("keeper.discarded") += 1, "keeper" => self.name);
            return;
        }

        slot.state = match result {
            Ok(value) => State::Settled {
                value: Arc::clone(value),
                settled_at: Instant::now(),
            },
            Err(err) => {
                tracing::debug!(keeper = self.name, error = %err, "computation failed");
                State::Empty
            }
        };
    }

    /// Runs the producer once on behalf of the background schedule.
    async fn refresh(&self) {
        let generation = self.slot.lock().generation;

        match (self.producer)().await {
            Ok(value) => {
                let mut slot = self.slot.lock();
                if slot.generation != generation {
                    tracing::debug!(keeper = self.name, "discarding superseded refresh");
                    metric!(counter("keeper.discarded") += 1, "keeper" => self.name);
                    return;
                }
                // A computation that is still pending from before this refresh must not
                // overwrite the newer value.
                slot.generation += 1;
                slot.state = State::Settled {
                    value: Arc::new(value),
                    settled_at: Instant::now(),
                };
                tracing::trace!(keeper = self.name, "background refresh settled");
                metric!(counter("keeper.refresh") += 1, "keeper" => self.name, "status" => "ok");
            }
            Err(err) => {
                tracing::warn!(
                    keeper = self.name,
                    error = %err,
                    "background refresh failed, keeping previous value"
                );
                metric!(counter("keeper.refresh") += 1, "keeper" => self.name, "status" => "error");
            }
        }
    }
}

async fn refresh_periodically<T>(inner: Weak<KeeperInner<T>>, interval: Duration)
where
    T: Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.refresh().await;
    }
}
