//! Bounded connection pool over a [`GraphBackend`].
//!
//! # Invariants
//!
//! - At most `max_size` sessions are open at any time. Every session is either
//!   idle in the pool or held by exactly one [`PooledConnection`], and holding
//!   one requires a semaphore permit.
//! - Acquirers wait on the semaphore (no polling). The timeout covers the
//!   whole acquire, including opening a fresh session.
//! - Every batch runs under `statement_timeout`. A session that times out is
//!   closed on release; its transaction state is unknown.
//! - A connection whose consecutive failures reach `unhealthy_threshold` is
//!   closed on release instead of going back to the idle list; the freed slot
//!   opens a fresh session on the next acquire.
//!
//! # Health checks
//!
//! [`ConnectionManager::start`] spawns a loop that, every
//! `health_check_interval`, probes idle sessions one at a time. A probe only
//! runs if a permit is free right now, so it never makes an acquirer wait
//! longer than a single bounded probe.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::{GraphBackend, GraphSession, RetryPolicy, Statement, StorageError, with_retry};
use crate::execution::CancellationFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub health_check_interval: Duration,
    pub probe_timeout: Duration,
    pub statement_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub retry: RetryPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            statement_timeout: Duration::from_secs(30),
            unhealthy_threshold: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
    Unhealthy,
    Closed,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    /// Open sessions, idle plus active.
    pub size: usize,
    pub max_size: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub total_acquisitions: u64,
    pub health_check_failures: u64,
    pub connections_closed: u64,
}

/// Summary of a [`ConnectionManager::chunked_transaction`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    pub chunks: usize,
    pub statements: usize,
    pub rows_affected: u64,
}

struct Slot {
    id: u64,
    session: Box<dyn GraphSession>,
    consecutive_failures: u32,
    last_checked: Instant,
}

impl Slot {
    fn state(&self, threshold: u32, held: bool) -> ConnectionState {
        if self.consecutive_failures >= threshold {
            ConnectionState::Unhealthy
        } else if held {
            ConnectionState::Active
        } else {
            ConnectionState::Idle
        }
    }
}

#[derive(Default)]
struct PoolInner {
    idle: Vec<Slot>,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    open: AtomicUsize,
    active: AtomicUsize,
    waiting: AtomicUsize,
    total_acquisitions: AtomicU64,
    health_check_failures: AtomicU64,
    connections_closed: AtomicU64,
    next_id: AtomicU64,
}

/// Owns the pool of graph-database sessions.
///
/// Built once per resolved configuration and shared through `Arc`.
pub struct ConnectionManager {
    backend: Arc<dyn GraphBackend>,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
    counters: Counters,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager without starting the health loop.
    pub fn new(backend: Arc<dyn GraphBackend>, settings: PoolSettings) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            backend,
            permits: Arc::new(Semaphore::new(settings.max_size)),
            settings,
            inner: Mutex::new(PoolInner::default()),
            counters: Counters::default(),
            shutdown_tx,
            health_task: Mutex::new(None),
        })
    }

    /// Create a manager and start its health loop.
    pub fn start(backend: Arc<dyn GraphBackend>, settings: PoolSettings) -> Arc<Self> {
        let manager = Self::new(backend, settings);
        let handle = manager.spawn_health_loop();
        *lock(&manager.health_task) = Some(handle);
        info!(
            backend = manager.backend.name(),
            max_size = settings.max_size,
            "connection manager started"
        );
        manager
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Wait up to `timeout` for a connection.
    ///
    /// Reuses the most recently released idle session, or opens a new one
    /// (retrying transient connect failures) when none is idle. Opening
    /// shares the same deadline as waiting for a slot.
    ///
    /// # Errors
    ///
    /// - [`StorageError::PoolExhausted`] if no slot frees up in time
    /// - [`StorageError::Timeout`] if a new session cannot be opened before the deadline
    /// - [`StorageError::Closed`] after [`shutdown`](Self::shutdown)
    /// - the backend's error if a new session cannot be opened
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection, StorageError> {
        let started = Instant::now();

        self.counters.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()).await;
        self.counters.waiting.fetch_sub(1, Ordering::SeqCst);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StorageError::Closed),
            Err(_) => {
                let waited = started.elapsed();
                warn!(?waited, max_size = self.settings.max_size, "connection pool exhausted");
                return Err(StorageError::PoolExhausted {
                    waited,
                    max_size: self.settings.max_size,
                });
            }
        };

        let reused = {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Err(StorageError::Closed);
            }
            inner.idle.pop()
        };

        let slot = match reused {
            Some(slot) => slot,
            None => {
                let remaining = timeout.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, self.open_slot()).await {
                    Ok(opened) => opened?,
                    Err(_) => {
                        warn!(waited = ?started.elapsed(), "opening a session timed out");
                        return Err(StorageError::Timeout(format!(
                            "opening a session took longer than {timeout:?}"
                        )));
                    }
                }
            }
        };

        self.counters.active.fetch_add(1, Ordering::SeqCst);
        self.counters.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            pool: Arc::clone(self),
            slot: Some(slot),
            permit: Some(permit),
        })
    }

    async fn open_slot(&self) -> Result<Slot, StorageError> {
        let session = with_retry(&self.settings.retry, None, |_| self.backend.connect()).await?;
        let id = self.counters.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = id, "opened new session");
        Ok(Slot {
            id,
            session,
            consecutive_failures: 0,
            last_checked: Instant::now(),
        })
    }

    fn close_slot(&self, slot: Slot, reason: &str) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
        self.counters.connections_closed.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = slot.id, reason, "closing session");
        drop(slot);
    }

    /// Return a slot to the idle list, or close it if unhealthy or shut down.
    fn put_back(&self, slot: Slot) {
        if slot.consecutive_failures >= self.settings.unhealthy_threshold {
            warn!(
                connection_id = slot.id,
                failures = slot.consecutive_failures,
                "connection marked unhealthy"
            );
            self.close_slot(slot, "unhealthy");
            return;
        }

        let mut inner = lock(&self.inner);
        if inner.closed {
            drop(inner);
            self.close_slot(slot, "shutdown");
        } else {
            inner.idle.push(slot);
        }
    }

    /// Id and state of each session sitting in the idle list, most recent last.
    pub fn idle_connections(&self) -> Vec<(u64, ConnectionState)> {
        let threshold = self.settings.unhealthy_threshold;
        lock(&self.inner)
            .idle
            .iter()
            .map(|slot| (slot.id, slot.state(threshold, false)))
            .collect()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let idle = lock(&self.inner).idle.len();
        PoolMetrics {
            size: self.counters.open.load(Ordering::SeqCst),
            max_size: self.settings.max_size,
            active: self.counters.active.load(Ordering::SeqCst),
            idle,
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            total_acquisitions: self.counters.total_acquisitions.load(Ordering::Relaxed),
            health_check_failures: self.counters.health_check_failures.load(Ordering::Relaxed),
            connections_closed: self.counters.connections_closed.load(Ordering::Relaxed),
        }
    }

    /// Apply `statements` in sub-transactions of at most `chunk_size`.
    ///
    /// Each chunk acquires its own connection and is retried as a unit on
    /// transient failures. Chunks already committed stay committed if a later
    /// chunk fails.
    ///
    /// # Errors
    ///
    /// The first chunk error that survives the retry policy.
    pub async fn chunked_transaction(
        self: &Arc<Self>,
        statements: &[Statement],
        chunk_size: usize,
        cancel: Option<&CancellationFlag>,
    ) -> Result<ChunkReport, StorageError> {
        let mut report = ChunkReport::default();

        for chunk in statements.chunks(chunk_size.max(1)) {
            if cancel.is_some_and(CancellationFlag::is_cancelled) {
                return Err(StorageError::Cancelled);
            }
            let rows = with_retry(&self.settings.retry, cancel, |_| {
                let pool = Arc::clone(self);
                async move {
                    let mut conn = pool.acquire(pool.settings.acquire_timeout).await?;
                    let rows = conn.execute_batch(chunk).await?;
                    Ok(rows)
                }
            })
            .await?;

            report.chunks += 1;
            report.statements += chunk.len();
            report.rows_affected += rows;
        }

        debug!(
            chunks = report.chunks,
            statements = report.statements,
            "chunked transaction applied"
        );
        Ok(report)
    }

    fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.settings.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                let Some(pool) = weak.upgrade() else { break };
                pool.check_idle().await;
            }
            debug!("health loop stopped");
        })
    }

    /// Probe each idle session once, oldest check first.
    pub async fn check_idle(&self) {
        let rounds = lock(&self.inner).idle.len();

        for _ in 0..rounds {
            // Only probe with a spare permit so acquirers are never starved.
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let slot = {
                let mut inner = lock(&self.inner);
                let oldest = inner
                    .idle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.last_checked)
                    .map(|(index, _)| index);
                oldest.map(|index| inner.idle.swap_remove(index))
            };
            let Some(mut slot) = slot else { break };

            let probe = tokio::time::timeout(self.settings.probe_timeout, slot.session.ping()).await;
            slot.last_checked = Instant::now();
            match probe {
                Ok(Ok(())) => slot.consecutive_failures = 0,
                Ok(Err(err)) => self.record_probe_failure(&mut slot, &err.to_string()),
                Err(_) => self.record_probe_failure(&mut slot, "probe timed out"),
            }
            self.put_back(slot);
            drop(permit);
        }
    }

    fn record_probe_failure(&self, slot: &mut Slot, reason: &str) {
        slot.consecutive_failures += 1;
        self.counters.health_check_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            connection_id = slot.id,
            failures = slot.consecutive_failures,
            reason,
            "health probe failed"
        );
    }

    /// Stop the health loop, fail pending acquirers and close idle sessions.
    ///
    /// Connections still held are closed when released.
    pub async fn shutdown(&self) {
        let idle = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            std::mem::take(&mut inner.idle)
        };
        for slot in idle {
            self.close_slot(slot, "shutdown");
        }
        self.permits.close();
        self.shutdown_tx.send_replace(true);

        let handle = lock(&self.health_task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("connection manager shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.health_task).take() {
            handle.abort();
        }
    }
}

/// Pool state stays consistent across a panic; recover the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive handle to one pooled session between acquire and release.
///
/// Dropping the guard releases it.
pub struct PooledConnection {
    pool: Arc<ConnectionManager>,
    slot: Option<Slot>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Pool-assigned id, stable for the life of the session.
    pub fn id(&self) -> Option<u64> {
        self.slot.as_ref().map(|slot| slot.id)
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.as_ref().map_or(ConnectionState::Closed, |slot| {
            slot.state(self.pool.settings.unhealthy_threshold, true)
        })
    }

    fn slot_mut(&mut self) -> Result<&mut Slot, StorageError> {
        self.slot.as_mut().ok_or(StorageError::Closed)
    }

    /// Run a batch in one transaction, bounded by `statement_timeout`.
    ///
    /// Transient failures count against the connection's health; success
    /// resets it. A timed-out session is marked unhealthy so it is closed on
    /// release instead of being reused.
    pub async fn execute_batch(&mut self, statements: &[Statement]) -> Result<u64, StorageError> {
        let limit = self.pool.settings.statement_timeout;
        let threshold = self.pool.settings.unhealthy_threshold;
        let slot = self.slot_mut()?;
        let result = match tokio::time::timeout(limit, slot.session.execute_batch(statements)).await {
            Ok(result) => result,
            Err(_) => {
                slot.consecutive_failures = slot.consecutive_failures.max(threshold);
                warn!(connection_id = slot.id, ?limit, "batch timed out");
                return Err(StorageError::Timeout(format!("batch took longer than {limit:?}")));
            }
        };
        match &result {
            Ok(_) => slot.consecutive_failures = 0,
            Err(err) if err.is_transient() => slot.consecutive_failures += 1,
            Err(_) => {}
        }
        result
    }

    /// Flag a failure observed by the caller while using this connection.
    pub fn mark_failed(&mut self) {
        if let Some(slot) = self.slot.as_mut() {
            slot.consecutive_failures += 1;
        }
    }

    /// Return the connection to the pool.
    ///
    /// Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        let Some(slot) = self.slot.take() else {
            return false;
        };
        self.pool.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.pool.put_back(slot);
        // Free the slot only after the session is back in the idle list.
        self.permit.take();
        true
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;

    /// Backend whose connects and batches hang for the given durations.
    struct Stalled {
        connect: Duration,
        batch: Duration,
    }

    struct StalledSession {
        batch: Duration,
    }

    #[async_trait]
    impl GraphBackend for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn connect(&self) -> Result<Box<dyn GraphSession>, StorageError> {
            tokio::time::sleep(self.connect).await;
            Ok(Box::new(StalledSession { batch: self.batch }))
        }
    }

    #[async_trait]
    impl GraphSession for StalledSession {
        async fn ping(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn execute_batch(&mut self, statements: &[Statement]) -> Result<u64, StorageError> {
            tokio::time::sleep(self.batch).await;
            Ok(statements.len() as u64)
        }
    }

    fn settings(max_size: usize) -> PoolSettings {
        PoolSettings {
            max_size,
            acquire_timeout: Duration::from_millis(100),
            health_check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_millis(50),
            statement_timeout: Duration::from_millis(200),
            unhealthy_threshold: 2,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_total_wait: Duration::from_secs(1),
            },
        }
    }

    fn pool(max_size: usize) -> (Arc<MemoryBackend>, Arc<ConnectionManager>) {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConnectionManager::new(backend.clone(), settings(max_size));
        (backend, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn never_grants_more_than_max_size() {
        let (backend, pool) = pool(10);
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.acquire(Duration::from_millis(100)).await.unwrap());
        }
        assert_eq!(pool.metrics().active, 10);

        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, StorageError::PoolExhausted { max_size: 10, .. }));
        assert_eq!(backend.sessions_opened(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_acquire_succeeds_after_release() {
        let (_, pool) = pool(1);
        let mut first = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let first_id = first.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.metrics().waiting, 1);

        assert!(first.release());
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.id(), first_id, "idle session should be reused");
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (_, pool) = pool(2);
        let mut conn = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert!(conn.release());
        assert!(!conn.release());
        assert_eq!(conn.state(), ConnectionState::Closed);
        drop(conn);

        let metrics = pool.metrics();
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.idle, 1);
        assert_eq!(pool.idle_connections(), [(1, ConnectionState::Idle)]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_is_bounded_by_acquire_timeout() {
        let backend = Arc::new(Stalled {
            connect: Duration::from_secs(600),
            batch: Duration::ZERO,
        });
        let pool = ConnectionManager::new(backend, settings(1));

        let started = Instant::now();
        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();

        assert!(matches!(err, StorageError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() <= Duration::from_secs(1));
        let metrics = pool.metrics();
        assert_eq!((metrics.size, metrics.active), (0, 0));
        // The permit went back with the failed attempt.
        assert_eq!(pool.permits.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_batch_times_out_and_closes_the_session() {
        let backend = Arc::new(Stalled {
            connect: Duration::ZERO,
            batch: Duration::from_secs(600),
        });
        let pool = ConnectionManager::new(backend, settings(1));
        let mut conn = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let started = Instant::now();
        let err = conn.execute_batch(&[Statement::new("INSERT 0")]).await.unwrap_err();

        assert!(matches!(err, StorageError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(conn.state(), ConnectionState::Unhealthy);
        drop(conn);
        assert_eq!(pool.metrics().size, 0);
    }

    #[tokio::test]
    async fn idle_sessions_are_reused_lifo() {
        let (backend, pool) = pool(3);
        let a = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let b_id = b.id();
        drop(a);
        drop(b);

        let c = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(c.id(), b_id);
        assert_eq!(backend.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn unhealthy_connection_is_replaced() {
        let (backend, pool) = pool(1);
        let mut conn = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let old_id = conn.id();
        conn.mark_failed();
        conn.mark_failed();
        assert_eq!(conn.state(), ConnectionState::Unhealthy);
        drop(conn);

        assert_eq!(pool.metrics().size, 0);
        let fresh = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_ne!(fresh.id(), old_id);
        assert_eq!(backend.sessions_opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probes_close_idle_sessions() {
        let (backend, pool) = pool(2);
        drop(pool.acquire(Duration::from_millis(100)).await.unwrap());
        backend.set_ping_failing(true);

        pool.check_idle().await;
        assert_eq!(pool.metrics().idle, 1, "one failure is below the threshold");
        assert_eq!(pool.idle_connections()[0].1, ConnectionState::Idle);
        pool.check_idle().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.idle, 0);
        assert_eq!(metrics.size, 0);
        assert_eq!(metrics.health_check_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_transaction_splits_and_retries() {
        let (backend, pool) = pool(2);
        let statements: Vec<_> = (0..5)
            .map(|i| Statement::new(format!("INSERT {i}")))
            .collect();
        backend.inject_batch_failures(1);

        let report = pool.chunked_transaction(&statements, 2, None).await.unwrap();

        assert_eq!(report.chunks, 3);
        assert_eq!(report.statements, 5);
        assert_eq!(report.rows_affected, 5);
        let applied: Vec<_> = backend.applied().into_iter().map(|s| s.text).collect();
        assert_eq!(applied, ["INSERT 0", "INSERT 1", "INSERT 2", "INSERT 3", "INSERT 4"]);
    }

    #[tokio::test]
    async fn shutdown_fails_new_acquires() {
        let backend = Arc::new(MemoryBackend::new());
        let pool = ConnectionManager::start(backend, settings(2));
        drop(pool.acquire(Duration::from_millis(100)).await.unwrap());

        pool.shutdown().await;

        assert_eq!(pool.metrics().size, 0);
        assert_eq!(
            pool.acquire(Duration::from_millis(100)).await.unwrap_err(),
            StorageError::Closed
        );
    }
}
