//! Re-entrant read/write mutex with scheduling policies and deadlock
//! detection.
//!
//! The lock hands out RAII guards; dropping the guard releases. Waiters are
//! parked on oneshot channels and woken by the releasing task, which picks
//! the next holder according to the configured [`SchedulingPolicy`]. Grants
//! happen inside the internal state lock, so a waiter that is removed from
//! the queue (timeout, cancellation) can never also be granted.
//!
//! Read grants are batched: when a reader is selected, every queued reader
//! is admitted with it.
//!
//! Named owners participate in a process-wide waiter/holder graph; before a
//! named waiter parks, a DFS over that graph rejects acquisitions that would
//! close a cycle (see [`DependencyGraph`]).

use crate::error::{Result, SyncError};
use parking_lot::Mutex as PlMutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL_REGISTRY: LazyLock<Arc<DependencyGraph>> =
    LazyLock::new(|| Arc::new(DependencyGraph::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Serve waiters strictly in arrival order (the default).
    #[default]
    Fifo,
    /// Rotate across distinct owner keys; within an owner, arrival order.
    RoundRobin,
    /// Highest priority first; ties broken by arrival order.
    Priority,
    /// Priority with aging: waiting raises effective priority over time.
    Weighted,
}

/// Aging parameters for [`SchedulingPolicy::Weighted`].
///
/// Every `adjustment_interval` of waiting adds
/// `min(max_increment, factor * waiting_secs ^ exponent)` (scaled by the
/// waiter's weight) to the effective priority. The bump is computed lazily
/// when a successor is selected; there is no timer task.
#[derive(Debug, Clone)]
pub struct WeightedAging {
    pub adjustment_interval: Duration,
    pub factor: f64,
    pub exponent: f64,
    pub max_increment: f64,
}

impl Default for WeightedAging {
    fn default() -> Self {
        Self {
            adjustment_interval: Duration::from_secs(1),
            factor: 1.0,
            exponent: 1.0,
            max_increment: 10.0,
        }
    }
}

/// What to do when an acquisition would close a cycle in the waiter graph.
///
/// Every strategy fails the offending `acquire` with `DEADLOCK`; they differ
/// in what else happens to the contended mutex.
#[derive(Clone)]
pub enum DeadlockStrategy {
    /// After `grace_period`, reject all queued waiters with `FORCE_RELEASE`,
    /// clear the hold, and re-emit `released`.
    ForceRelease { grace_period: Duration },
    /// Raise the priority of every queued waiter by `boost`.
    PriorityElevation { boost: i64 },
    /// Invoke a user callback with the offending owner and mutex.
    Custom(Arc<dyn Fn(&DeadlockInfo) + Send + Sync>),
}

impl Default for DeadlockStrategy {
    fn default() -> Self {
        DeadlockStrategy::ForceRelease {
            grace_period: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for DeadlockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlockStrategy::ForceRelease { grace_period } => f
                .debug_struct("ForceRelease")
                .field("grace_period", grace_period)
                .finish(),
            DeadlockStrategy::PriorityElevation { boost } => f
                .debug_struct("PriorityElevation")
                .field("boost", boost)
                .finish(),
            DeadlockStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadlockInfo {
    pub mutex: String,
    pub owner: String,
}

#[derive(Debug, Clone)]
pub struct MutexOptions {
    /// Display name used in errors, events, and log lines.
    pub name: Option<String>,
    pub policy: SchedulingPolicy,
    pub aging: WeightedAging,
    pub deadlock: DeadlockStrategy,
    /// Whether a named owner that already holds the lock is granted again
    /// immediately (counted; the final release unlocks).
    pub reentrant: bool,
    /// Waiter/holder graph to register against. Defaults to the process-wide
    /// registry; hosts needing per-tenant isolation pass their own.
    pub registry: Option<Arc<DependencyGraph>>,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            name: None,
            policy: SchedulingPolicy::default(),
            aging: WeightedAging::default(),
            deadlock: DeadlockStrategy::default(),
            reentrant: true,
            registry: None,
        }
    }
}

/// Per-call acquisition parameters.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// `None` waits forever. `Some(0)` fails immediately if the lock is
    /// contended.
    pub timeout: Option<Duration>,
    /// Identity for reentrancy and deadlock tracking. Anonymous acquisitions
    /// skip both.
    pub owner: Option<String>,
    pub priority: i64,
    /// Scales the aging bump under [`SchedulingPolicy::Weighted`]. Zero means
    /// the default of 1.0.
    pub weight: f64,
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    #[must_use]
    pub fn owned(owner: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            ..Self::default()
        }
    }
}

/// Retry envelope for `acquire_with_backoff`.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MutexEvent {
    AcquireAttempt { mutex: String, owner: Option<String> },
    Acquired { mutex: String, owner: Option<String> },
    ReentrantAcquired { mutex: String, owner: Option<String> },
    Released { mutex: String, owner: Option<String> },
    ReentrantReleased { mutex: String, owner: Option<String> },
    Timeout { mutex: String, owner: Option<String> },
    ForceReleased { mutex: String },
}

type EventHook = Arc<dyn Fn(&MutexEvent) + Send + Sync>;

/// Process-wide waiter/holder graph used for deadlock detection.
///
/// Two directions are kept for both relations so lookups stay O(1):
/// owner → held mutexes / mutex → holders, and owner → awaited mutexes /
/// mutex → waiters. Created on first use, never torn down.
#[derive(Debug)]
pub struct DependencyGraph {
    inner: PlMutex<GraphState>,
}

#[derive(Default, Debug)]
struct GraphState {
    holds: HashMap<String, HashSet<u64>>,
    holders: HashMap<u64, HashSet<String>>,
    waits: HashMap<String, HashSet<u64>>,
    waiters: HashMap<u64, HashSet<String>>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: PlMutex::new(GraphState::default()),
        }
    }

    /// The process-wide registry mutexes use by default.
    #[must_use]
    pub fn global() -> Arc<DependencyGraph> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    fn register_hold(&self, owner: &str, mutex: u64) {
        let mut g = self.inner.lock();
        g.holds.entry(owner.to_string()).or_default().insert(mutex);
        g.holders.entry(mutex).or_default().insert(owner.to_string());
    }

    fn unregister_hold(&self, owner: &str, mutex: u64) {
        let mut g = self.inner.lock();
        if let Some(set) = g.holds.get_mut(owner) {
            set.remove(&mutex);
            if set.is_empty() {
                g.holds.remove(owner);
            }
        }
        if let Some(set) = g.holders.get_mut(&mutex) {
            set.remove(owner);
            if set.is_empty() {
                g.holders.remove(&mutex);
            }
        }
    }

    fn register_wait(&self, owner: &str, mutex: u64) {
        let mut g = self.inner.lock();
        g.waits.entry(owner.to_string()).or_default().insert(mutex);
        g.waiters.entry(mutex).or_default().insert(owner.to_string());
    }

    fn unregister_wait(&self, owner: &str, mutex: u64) {
        let mut g = self.inner.lock();
        if let Some(set) = g.waits.get_mut(owner) {
            set.remove(&mutex);
            if set.is_empty() {
                g.waits.remove(owner);
            }
        }
        if let Some(set) = g.waiters.get_mut(&mutex) {
            set.remove(owner);
            if set.is_empty() {
                g.waiters.remove(&mutex);
            }
        }
    }

    /// Would `owner` waiting on `mutex` close a cycle?
    ///
    /// DFS from the current holders of `mutex` along
    /// "holder waits on m → m's holders"; reaching `owner` means the chain of
    /// waits comes back around to something `owner` would block.
    fn would_deadlock(&self, owner: &str, mutex: u64) -> bool {
        let g = self.inner.lock();
        let Some(start) = g.holders.get(&mutex) else {
            return false;
        };
        let mut stack: Vec<&String> = start.iter().collect();
        let mut seen: HashSet<&String> = HashSet::new();
        while let Some(holder) = stack.pop() {
            if holder == owner {
                return true;
            }
            if !seen.insert(holder) {
                continue;
            }
            if let Some(awaited) = g.waits.get(holder) {
                for m in awaited {
                    if let Some(next) = g.holders.get(m) {
                        stack.extend(next.iter());
                    }
                }
            }
        }
        false
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

enum Grant {
    Granted { epoch: u64 },
    ForceReleased,
}

struct Waiter {
    ticket: u64,
    kind: LockKind,
    owner: Option<String>,
    priority: i64,
    weight: f64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Grant>,
}

enum Hold {
    Free,
    Exclusive { owner: Option<String>, count: u32 },
    Shared { readers: HashMap<Option<String>, u32> },
}

struct State {
    hold: Hold,
    queue: Vec<Waiter>,
    next_ticket: u64,
    /// Bumped on force release so stale guards cannot unlock a newer hold.
    epoch: u64,
    rr_last: Option<Option<String>>,
    force_release_pending: bool,
}

struct Inner {
    id: u64,
    name: String,
    opts: MutexOptions,
    registry: Arc<DependencyGraph>,
    state: PlMutex<State>,
    hook: PlMutex<Option<EventHook>>,
}

/// The mutex. Cheap to clone; clones share the same lock.
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// RAII guard; dropping it releases the hold (or one level of reentrancy).
pub struct MutexGuard {
    inner: Arc<Inner>,
    kind: LockKind,
    owner: Option<String>,
    epoch: u64,
}

impl MutexGuard {
    /// Explicit release, equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.inner
            .unlock(self.kind, self.owner.as_deref(), self.epoch);
    }
}

impl fmt::Debug for MutexGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard")
            .field("mutex", &self.inner.name)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new(MutexOptions::default())
    }
}

impl Mutex {
    #[must_use]
    pub fn new(opts: MutexOptions) -> Self {
        let id = NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed);
        let name = opts.name.clone().unwrap_or_else(|| format!("mutex-{id}"));
        let registry = opts
            .registry
            .clone()
            .unwrap_or_else(DependencyGraph::global);
        Self {
            inner: Arc::new(Inner {
                id,
                name,
                opts,
                registry,
                state: PlMutex::new(State {
                    hold: Hold::Free,
                    queue: Vec::new(),
                    next_ticket: 0,
                    epoch: 0,
                    rr_last: None,
                    force_release_pending: false,
                }),
                hook: PlMutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn with_name(name: &str) -> Self {
        Self::new(MutexOptions {
            name: Some(name.to_string()),
            ..MutexOptions::default()
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Install an observer for lifecycle events. The callback runs inline on
    /// lock/unlock paths and must not re-enter this mutex.
    pub fn set_event_hook(&self, hook: impl Fn(&MutexEvent) + Send + Sync + 'static) {
        *self.inner.hook.lock() = Some(Arc::new(hook));
    }

    /// Exclusive acquisition.
    pub async fn acquire(&self, opts: AcquireOptions) -> Result<MutexGuard> {
        self.lock(LockKind::Write, opts).await
    }

    /// Shared acquisition.
    pub async fn read_lock(&self, opts: AcquireOptions) -> Result<MutexGuard> {
        self.lock(LockKind::Read, opts).await
    }

    /// Exclusive acquisition (alias of [`Mutex::acquire`]).
    pub async fn write_lock(&self, opts: AcquireOptions) -> Result<MutexGuard> {
        self.lock(LockKind::Write, opts).await
    }

    /// Non-blocking exclusive acquisition.
    #[must_use]
    pub fn try_acquire(&self, owner: Option<&str>) -> Option<MutexGuard> {
        let granted = {
            let mut st = self.inner.state.lock();
            self.inner.try_grant_now(&mut st, LockKind::Write, owner)
        };
        granted.map(|(epoch, reentrant)| {
            self.inner.emit_grant(owner, reentrant);
            MutexGuard {
                inner: Arc::clone(&self.inner),
                kind: LockKind::Write,
                owner: owner.map(str::to_string),
                epoch,
            }
        })
    }

    /// Acquire with an outer retry loop. `ABORTED` is never retried.
    pub async fn acquire_with_backoff(
        &self,
        opts: AcquireOptions,
        backoff: Backoff,
    ) -> Result<MutexGuard> {
        let attempts = backoff.max_attempts.max(1);
        let mut delay = backoff.initial_delay;
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.lock(LockKind::Write, opts.clone()).await {
                Ok(guard) => return Ok(guard),
                Err(err @ SyncError::Aborted { .. }) => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        mutex = %self.inner.name,
                        attempt,
                        error = %err,
                        "acquire attempt failed; backing off"
                    );
                    last_err = Some(err);
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay.min(backoff.max_delay)).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * backoff.factor).min(backoff.max_delay.as_secs_f64()),
                );
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::AcquireFailed {
            mutex: self.inner.name.clone(),
            reason: "no acquisition attempts were made".to_string(),
        }))
    }

    /// Run `f` under the exclusive lock and return its output.
    pub async fn run_exclusive<T, F, Fut>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self
            .lock(
                LockKind::Write,
                AcquireOptions {
                    timeout,
                    ..AcquireOptions::default()
                },
            )
            .await?;
        let out = f().await;
        drop(guard);
        Ok(out)
    }

    /// Like [`Mutex::run_exclusive`] for fallible sections; an `Err` from `f`
    /// is wrapped as `EXECUTION_FAILED` with the cause preserved.
    pub async fn try_run_exclusive<T, E, F, Fut>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let guard = self
            .lock(
                LockKind::Write,
                AcquireOptions {
                    timeout,
                    ..AcquireOptions::default()
                },
            )
            .await?;
        let out = f().await;
        drop(guard);
        out.map_err(|e| SyncError::ExecutionFailed { source: Box::new(e) })
    }

    async fn lock(&self, kind: LockKind, opts: AcquireOptions) -> Result<MutexGuard> {
        let inner = &self.inner;
        let owner = opts.owner.clone();

        inner.emit(&MutexEvent::AcquireAttempt {
            mutex: inner.name.clone(),
            owner: owner.clone(),
        });

        // Cancellation wins before any side effect.
        if let Some(token) = &opts.cancel
            && token.is_cancelled()
        {
            return Err(SyncError::Aborted {
                mutex: inner.name.clone(),
            });
        }

        let started = Instant::now();
        let (ticket, mut rx) = {
            let mut st = inner.state.lock();
            if let Some((epoch, reentrant)) = inner.try_grant_now(&mut st, kind, owner.as_deref()) {
                drop(st);
                inner.emit_grant(owner.as_deref(), reentrant);
                return Ok(MutexGuard {
                    inner: Arc::clone(inner),
                    kind,
                    owner,
                    epoch,
                });
            }

            // The lock is contended; a named waiter must not close a cycle.
            if let Some(owner) = owner.as_deref()
                && inner.registry.would_deadlock(owner, inner.id)
            {
                drop(st);
                self.on_deadlock(owner);
                return Err(SyncError::Deadlock {
                    mutex: inner.name.clone(),
                    owner: owner.to_string(),
                });
            }

            let (tx, rx) = oneshot::channel();
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.queue.push(Waiter {
                ticket,
                kind,
                owner: owner.clone(),
                priority: opts.priority,
                weight: if opts.weight > 0.0 { opts.weight } else { 1.0 },
                enqueued_at: started,
                tx,
            });
            if let Some(owner) = owner.as_deref() {
                inner.registry.register_wait(owner, inner.id);
            }
            (ticket, rx)
        };

        let deadline = opts.timeout.map(|t| tokio::time::Instant::now() + t);
        let timeout_fut = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancel_fut = async {
            match &opts.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout_fut);
        tokio::pin!(cancel_fut);

        enum WaitOutcome {
            Message(std::result::Result<Grant, oneshot::error::RecvError>),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            msg = &mut rx => WaitOutcome::Message(msg),
            () = &mut timeout_fut => WaitOutcome::TimedOut,
            () = &mut cancel_fut => WaitOutcome::Cancelled,
        };

        match outcome {
            WaitOutcome::Message(Ok(Grant::Granted { epoch })) => {
                inner.emit_grant(owner.as_deref(), false);
                Ok(MutexGuard {
                    inner: Arc::clone(inner),
                    kind,
                    owner,
                    epoch,
                })
            }
            WaitOutcome::Message(Ok(Grant::ForceReleased)) => Err(SyncError::ForceReleased {
                mutex: inner.name.clone(),
            }),
            WaitOutcome::Message(Err(_)) => {
                if let Some(owner) = owner.as_deref() {
                    inner.registry.unregister_wait(owner, inner.id);
                }
                Err(SyncError::AcquireFailed {
                    mutex: inner.name.clone(),
                    reason: "wait channel closed".to_string(),
                })
            }
            WaitOutcome::TimedOut => {
                inner.abandon(ticket, kind, owner.as_deref(), &mut rx);
                inner.emit(&MutexEvent::Timeout {
                    mutex: inner.name.clone(),
                    owner: owner.clone(),
                });
                Err(SyncError::AcquireTimeout {
                    mutex: inner.name.clone(),
                    waited: started.elapsed(),
                })
            }
            WaitOutcome::Cancelled => {
                inner.abandon(ticket, kind, owner.as_deref(), &mut rx);
                Err(SyncError::Aborted {
                    mutex: inner.name.clone(),
                })
            }
        }
    }

    fn on_deadlock(&self, owner: &str) {
        let inner = &self.inner;
        tracing::warn!(
            mutex = %inner.name,
            owner,
            strategy = ?inner.opts.deadlock,
            "deadlock detected in waiter graph"
        );
        match &inner.opts.deadlock {
            DeadlockStrategy::ForceRelease { grace_period } => {
                let grace = *grace_period;
                let schedule = {
                    let mut st = inner.state.lock();
                    if st.force_release_pending {
                        false
                    } else {
                        st.force_release_pending = true;
                        true
                    }
                };
                if schedule {
                    let handle = Arc::clone(inner);
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        handle.force_release_now();
                    });
                }
            }
            DeadlockStrategy::PriorityElevation { boost } => {
                let mut st = inner.state.lock();
                for w in &mut st.queue {
                    w.priority += boost;
                }
            }
            DeadlockStrategy::Custom(callback) => {
                callback(&DeadlockInfo {
                    mutex: inner.name.clone(),
                    owner: owner.to_string(),
                });
            }
        }
    }
}

impl Inner {
    /// Grant immediately if the lock state allows it. Returns the epoch to
    /// stamp on the guard and whether the grant was reentrant.
    fn try_grant_now(
        &self,
        st: &mut State,
        kind: LockKind,
        owner: Option<&str>,
    ) -> Option<(u64, bool)> {
        match &mut st.hold {
            Hold::Free => {
                match kind {
                    LockKind::Write => {
                        st.hold = Hold::Exclusive {
                            owner: owner.map(str::to_string),
                            count: 1,
                        };
                    }
                    LockKind::Read => {
                        let mut readers = HashMap::new();
                        readers.insert(owner.map(str::to_string), 1);
                        st.hold = Hold::Shared { readers };
                    }
                }
                if let Some(owner) = owner {
                    self.registry.register_hold(owner, self.id);
                }
                Some((st.epoch, false))
            }
            Hold::Exclusive { owner: held_by, count } => {
                // Reentrant grant for the current exclusive holder; it already
                // excludes everyone, so reads nest as well.
                if self.opts.reentrant
                    && let (Some(o), Some(h)) = (owner, held_by.as_deref())
                    && o == h
                {
                    *count += 1;
                    return Some((st.epoch, true));
                }
                None
            }
            Hold::Shared { readers } => match kind {
                LockKind::Read => {
                    if self.opts.reentrant
                        && let Some(o) = owner
                        && let Some(count) = readers.get_mut(&Some(o.to_string()))
                    {
                        *count += 1;
                        return Some((st.epoch, true));
                    }
                    // Writer preference: new readers queue behind a waiting
                    // writer instead of starving it.
                    if st.queue.iter().any(|w| w.kind == LockKind::Write) {
                        return None;
                    }
                    *readers.entry(owner.map(str::to_string)).or_insert(0) += 1;
                    if let Some(owner) = owner {
                        self.registry.register_hold(owner, self.id);
                    }
                    Some((st.epoch, false))
                }
                LockKind::Write => None,
            },
        }
    }

    fn unlock(&self, kind: LockKind, owner: Option<&str>, epoch: u64) {
        let event = {
            let mut st = self.state.lock();
            if st.epoch != epoch {
                // A force release invalidated this hold; nothing to do.
                return;
            }
            let event = match &mut st.hold {
                Hold::Exclusive { owner: held_by, count } => {
                    if *count > 1 {
                        *count -= 1;
                        Some(MutexEvent::ReentrantReleased {
                            mutex: self.name.clone(),
                            owner: held_by.clone(),
                        })
                    } else {
                        if let Some(o) = held_by.as_deref() {
                            self.registry.unregister_hold(o, self.id);
                        }
                        st.hold = Hold::Free;
                        Some(MutexEvent::Released {
                            mutex: self.name.clone(),
                            owner: owner.map(str::to_string),
                        })
                    }
                }
                Hold::Shared { readers } => {
                    debug_assert_eq!(kind, LockKind::Read);
                    let key = owner.map(str::to_string);
                    match readers.get_mut(&key) {
                        Some(count) if *count > 1 => {
                            *count -= 1;
                            Some(MutexEvent::ReentrantReleased {
                                mutex: self.name.clone(),
                                owner: key,
                            })
                        }
                        Some(_) => {
                            readers.remove(&key);
                            if let Some(o) = owner {
                                self.registry.unregister_hold(o, self.id);
                            }
                            if readers.is_empty() {
                                st.hold = Hold::Free;
                            }
                            Some(MutexEvent::Released {
                                mutex: self.name.clone(),
                                owner: key,
                            })
                        }
                        None => None,
                    }
                }
                Hold::Free => None,
            };
            self.pump(&mut st);
            event
        };
        if let Some(event) = event {
            self.emit(&event);
        }
    }

    /// Hand the lock to queued waiters. Called with the state lock held,
    /// whenever the hold may have opened up.
    fn pump(&self, st: &mut State) {
        loop {
            match &st.hold {
                Hold::Free => {
                    if st.queue.is_empty() {
                        return;
                    }
                    let idx = self.select_next(st);
                    match st.queue[idx].kind {
                        LockKind::Write => {
                            let w = st.queue.remove(idx);
                            st.rr_last = Some(w.owner.clone());
                            let epoch = st.epoch;
                            if let Some(o) = w.owner.as_deref() {
                                self.registry.unregister_wait(o, self.id);
                            }
                            if w.tx.send(Grant::Granted { epoch }).is_ok() {
                                if let Some(o) = w.owner.as_deref() {
                                    self.registry.register_hold(o, self.id);
                                }
                                st.hold = Hold::Exclusive {
                                    owner: w.owner,
                                    count: 1,
                                };
                                return;
                            }
                            // Receiver vanished without dequeueing; try the
                            // next waiter.
                        }
                        LockKind::Read => {
                            if self.grant_all_readers(st) {
                                return;
                            }
                        }
                    }
                }
                Hold::Shared { .. } => {
                    // Admit late readers once no writer is queued ahead of
                    // them (e.g. the blocking writer timed out).
                    let has_writer = st.queue.iter().any(|w| w.kind == LockKind::Write);
                    let has_reader = st.queue.iter().any(|w| w.kind == LockKind::Read);
                    if !has_writer && has_reader {
                        self.grant_all_readers(st);
                    }
                    return;
                }
                Hold::Exclusive { .. } => return,
            }
        }
    }

    /// Grant every queued reader. Returns whether at least one grant landed.
    fn grant_all_readers(&self, st: &mut State) -> bool {
        let mut granted: HashMap<Option<String>, u32> = match &mut st.hold {
            Hold::Shared { readers } => std::mem::take(readers),
            _ => HashMap::new(),
        };
        let epoch = st.epoch;
        let mut i = 0;
        while i < st.queue.len() {
            if st.queue[i].kind == LockKind::Read {
                let w = st.queue.remove(i);
                if let Some(o) = w.owner.as_deref() {
                    self.registry.unregister_wait(o, self.id);
                }
                if w.tx.send(Grant::Granted { epoch }).is_ok() {
                    if let Some(o) = w.owner.as_deref() {
                        self.registry.register_hold(o, self.id);
                    }
                    *granted.entry(w.owner).or_insert(0) += 1;
                }
            } else {
                i += 1;
            }
        }
        if granted.is_empty() {
            st.hold = Hold::Free;
            false
        } else {
            st.hold = Hold::Shared { readers: granted };
            true
        }
    }

    /// Index of the next waiter according to the scheduling policy.
    fn select_next(&self, st: &State) -> usize {
        match self.opts.policy {
            SchedulingPolicy::Fifo => st
                .queue
                .iter()
                .enumerate()
                .min_by_key(|(_, w)| w.ticket)
                .map(|(i, _)| i)
                .unwrap_or(0),
            SchedulingPolicy::Priority | SchedulingPolicy::Weighted => {
                let now = Instant::now();
                let mut best: Option<(usize, f64, u64)> = None;
                for (i, w) in st.queue.iter().enumerate() {
                    let eff = self.effective_priority(w, now);
                    let better = match best {
                        None => true,
                        Some((_, best_eff, best_ticket)) => {
                            eff > best_eff || (eff == best_eff && w.ticket < best_ticket)
                        }
                    };
                    if better {
                        best = Some((i, eff, w.ticket));
                    }
                }
                best.map(|(i, _, _)| i).unwrap_or(0)
            }
            SchedulingPolicy::RoundRobin => {
                // Buckets in first-arrival order; resume after the owner
                // served last.
                let mut buckets: Vec<Option<String>> = Vec::new();
                for w in &st.queue {
                    if !buckets.contains(&w.owner) {
                        buckets.push(w.owner.clone());
                    }
                }
                let start = st
                    .rr_last
                    .as_ref()
                    .and_then(|last| buckets.iter().position(|b| b == last))
                    .map(|i| (i + 1) % buckets.len())
                    .unwrap_or(0);
                let bucket = &buckets[start];
                st.queue
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| &w.owner == bucket)
                    .min_by_key(|(_, w)| w.ticket)
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            }
        }
    }

    fn effective_priority(&self, w: &Waiter, now: Instant) -> f64 {
        let base = w.priority as f64;
        if !matches!(self.opts.policy, SchedulingPolicy::Weighted) {
            return base;
        }
        let aging = &self.opts.aging;
        let interval = aging.adjustment_interval.max(Duration::from_millis(1));
        let waited = now.saturating_duration_since(w.enqueued_at);
        let steps = (waited.as_millis() / interval.as_millis()).min(10_000) as u64;
        let mut bump = 0.0;
        for k in 1..=steps {
            let waiting_secs = interval.as_secs_f64() * k as f64;
            let inc = (aging.factor * waiting_secs.powf(aging.exponent)).min(aging.max_increment);
            bump += inc * w.weight;
            if inc >= aging.max_increment {
                bump += (steps - k) as f64 * aging.max_increment * w.weight;
                break;
            }
        }
        base + bump
    }

    /// Timeout/cancel path: dequeue, drop the waiter-graph edge, and undo a
    /// grant that raced us. Sends happen under the state lock, so after a
    /// successful removal no grant can arrive.
    fn abandon(
        &self,
        ticket: u64,
        kind: LockKind,
        owner: Option<&str>,
        rx: &mut oneshot::Receiver<Grant>,
    ) {
        let removed = {
            let mut st = self.state.lock();
            let pos = st.queue.iter().position(|w| w.ticket == ticket);
            if let Some(pos) = pos {
                st.queue.remove(pos);
                self.pump(&mut st);
                true
            } else {
                false
            }
        };
        if let Some(owner) = owner {
            self.registry.unregister_wait(owner, self.id);
        }
        if !removed
            && let Ok(Grant::Granted { epoch }) = rx.try_recv()
        {
            self.unlock(kind, owner, epoch);
        }
    }

    fn force_release_now(&self) {
        let rejected = {
            let mut st = self.state.lock();
            st.force_release_pending = false;
            st.epoch += 1;
            match std::mem::replace(&mut st.hold, Hold::Free) {
                Hold::Exclusive { owner, .. } => {
                    if let Some(o) = owner.as_deref() {
                        self.registry.unregister_hold(o, self.id);
                    }
                }
                Hold::Shared { readers } => {
                    for owner in readers.keys().flatten() {
                        self.registry.unregister_hold(owner, self.id);
                    }
                }
                Hold::Free => {}
            }
            let queue = std::mem::take(&mut st.queue);
            for w in &queue {
                if let Some(o) = w.owner.as_deref() {
                    self.registry.unregister_wait(o, self.id);
                }
            }
            queue
        };
        let count = rejected.len();
        for w in rejected {
            let _ = w.tx.send(Grant::ForceReleased);
        }
        tracing::warn!(mutex = %self.name, rejected = count, "mutex force-released");
        self.emit(&MutexEvent::ForceReleased {
            mutex: self.name.clone(),
        });
        self.emit(&MutexEvent::Released {
            mutex: self.name.clone(),
            owner: None,
        });
    }

    fn emit_grant(&self, owner: Option<&str>, reentrant: bool) {
        let event = if reentrant {
            MutexEvent::ReentrantAcquired {
                mutex: self.name.clone(),
                owner: owner.map(str::to_string),
            }
        } else {
            MutexEvent::Acquired {
                mutex: self.name.clone(),
                owner: owner.map(str::to_string),
            }
        };
        self.emit(&event);
    }

    fn emit(&self, event: &MutexEvent) {
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }
}
