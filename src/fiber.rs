//! In-flight request tracking and graceful drain.
//!
//! Every request registers in a process-wide [`FiberSet`] when it starts and
//! deregisters when its last piece of work finishes. Registration hands back a
//! [`FiberGuard`]; dropping the guard is the only way to deregister, so every
//! registration is matched by exactly one deregistration whatever the outcome:
//! success, error, panic, interruption, or the connection going away.
//!
//! # Uninterruptible business logic
//!
//! [`fork_join`] runs business logic as its own tokio task. Once forked, the
//! task is never aborted: it completes or fails on its own terms, and the
//! caller always waits for it. Interruption is observed at the join point:
//!
//! ```text
//! Joined::Completed(value)   the task returned Ok
//! Joined::Failed(error)      the task returned Err, or panicked
//! Joined::Cancelled          the fiber was interrupted before or while it ran
//! ```
//!
//! The task owns the guard, so the fiber deregisters before the join returns.
//! If the caller goes away mid-join, the task keeps the fiber registered
//! until the work really stops.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, info, warn};

use crate::classify::Fault;

/// Opaque handle of one registered execution.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FiberId(u64);

#[derive(Debug)]
struct Entry {
    name: String,
    started: Instant,
}

#[derive(Debug)]
struct Inner {
    next: AtomicU64,
    live: Mutex<HashMap<FiberId, Entry>>,
    idle: Notify,
    token: CancellationToken,
    draining: AtomicBool,
}

/// The set of in-flight request executions. Cheap to clone; clones share state.
#[derive(Clone, Debug)]
pub struct FiberSet {
    inner: Arc<Inner>,
}

impl Default for FiberSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next: AtomicU64::new(1),
                live: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                token: CancellationToken::new(),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Registers an execution. It stays registered until the guard drops.
    ///
    /// After [`interrupt_all`](Self::interrupt_all) new fibers start out
    /// interrupted.
    pub fn register(&self, name: &str) -> FiberGuard {
        let id = FiberId(self.inner.next.fetch_add(1, Ordering::Relaxed));
        self.inner.live.lock().insert(id, Entry { name: name.to_owned(), started: Instant::now() });
        FiberGuard {
            set: self.clone(),
            id,
            token: self.inner.token.child_token(),
        }
    }

    fn deregister(&self, id: FiberId) {
        let mut live = self.inner.live.lock();
        live.remove(&id);
        if live.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.inner.live.lock().contains_key(&id)
    }

    /// Whether [`drain`](Self::drain) has been called.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Resolves once no execution is registered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Interrupts every registered execution and every future one.
    pub fn interrupt_all(&self) {
        self.inner.token.cancel();
    }

    /// Waits up to `grace` for in-flight executions to finish, then interrupts
    /// whatever is left. Returns how many were still registered at that point.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.inner.draining.store(true, Ordering::Release);
        info!(in_flight = self.len(), "draining in-flight requests");

        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return 0;
        }

        let stragglers: Vec<(String, Duration)> = self
            .inner
            .live
            .lock()
            .values()
            .map(|e| (e.name.clone(), e.started.elapsed()))
            .collect();
        for (name, age) in &stragglers {
            warn!(endpoint = %name, age_ms = age.as_millis() as u64, "interrupting request after drain timeout");
        }
        self.interrupt_all();
        stragglers.len()
    }
}

/// Registration of one execution. Deregisters on drop.
#[derive(Debug)]
pub struct FiberGuard {
    set: FiberSet,
    id: FiberId,
    token: CancellationToken,
}

impl FiberGuard {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Interrupts this execution only.
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for FiberGuard {
    fn drop(&mut self) {
        self.set.deregister(self.id);
    }
}

/// Result of joining forked business logic.
#[derive(Debug)]
pub enum Joined<T, E> {
    Completed(T),
    Failed(E),
    Cancelled,
}

/// Forks `work` as an uninterruptible task and joins it.
///
/// `work` does not start if the fiber is already interrupted. Otherwise the
/// join waits for `work` to finish even when the fiber is interrupted
/// meanwhile, and then answers [`Joined::Cancelled`]. A panic inside `work` is
/// reported as a failure carrying a [`Fault`].
pub async fn fork_join<F, T, E>(guard: Arc<FiberGuard>, work: F) -> Joined<T, E>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<Fault> + Send + 'static,
{
    let token = guard.token().clone();
    if token.is_cancelled() {
        return Joined::Cancelled;
    }

    let joined = tokio::spawn(
        async move {
            let _guard = guard;
            work.await
        }
        .in_current_span()
        .with_current_subscriber(),
    )
    .await;

    if token.is_cancelled() {
        return Joined::Cancelled;
    }
    match joined {
        Ok(Ok(value)) => Joined::Completed(value),
        Ok(Err(e)) => Joined::Failed(e),
        Err(e) if e.is_panic() => Joined::Failed(Fault::from_panic(e.into_panic()).into()),
        Err(_) => Joined::Cancelled,
    }
}
