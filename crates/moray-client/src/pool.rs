//! Connection pool with DNS-driven backend discovery.
//!
//! The pool keeps up to `maximum` live connections spread across the backends
//! its [`Resolver`] reports. A background manager task refreshes the backend
//! set periodically and opens connections until `spares` idle connections
//! are available on top of the ones currently claimed. Connection attempts
//! follow the pool's [`RecoveryPolicy`]; a backend that exhausts its retries
//! is skipped until the next refresh.
//!
//! Claims are synchronous and never wait: either an idle connection is handed
//! out immediately or the claim fails with [`MorayError::NoConnections`].
//! [`ConnectionPool::claim_async`] is the one exception, used to wait for the
//! pool to become ready.

use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use moray_common::{MorayError, Result};

use crate::options::PoolConfig;
use crate::recovery::RecoveryPolicy;
use crate::resolver::{Backend, Resolver};

/// Lifecycle events published by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// The first usable connection is ready
    Connect,
    /// No backend could be reached before the pool ever connected
    Error(String),
    /// Shutdown has completed
    Close,
}

/// Health of a pooled connection as published to the pool.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Connected,
    /// The connection faulted; carries the first fault only
    Failed(MorayError),
    Destroyed,
}

/// A connection the pool can manage.
pub trait PoolConnection: Send + Sync + 'static {
    fn backend(&self) -> &Backend;

    /// Observes the connection's state. It leaves `Connected` at most once.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    fn is_usable(&self) -> bool {
        matches!(*self.state().borrow(), ConnectionState::Connected)
    }

    /// Tears the connection down and suppresses any further fault reports.
    fn destroy(&self);

    /// Called when the connection is claimed.
    fn ref_connection(&self);

    /// Called when the connection is returned to the idle set.
    fn unref_connection(&self);
}

/// Opens connections to backends.
pub trait Connector: Send + Sync + 'static {
    type Connection: PoolConnection;

    fn connect<'a>(&'a self, backend: &'a Backend) -> BoxFuture<'a, Result<Self::Connection>>;
}

/// Pool sizing and recovery parameters.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub spares: usize,
    pub maximum: usize,
    /// Applied to every connection attempt
    pub recovery: RecoveryPolicy,
    pub refresh_interval: Duration,
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            spares: config.spares,
            maximum: config.maximum,
            recovery: config.recovery.default.clone(),
            refresh_interval: config.refresh_interval(),
        }
    }
}

/// Point-in-time counters, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub backends: usize,
    pub connections: usize,
    pub idle: usize,
    pub claimed: usize,
    pub connecting: usize,
}

struct Slot<T> {
    backend: String,
    conn: Arc<T>,
    claimed: bool,
    /// Destroy on release instead of returning to the idle set
    retired: bool,
}

struct BackendEntry {
    backend: Backend,
    /// Retries ran out during the current refresh cycle
    exhausted: bool,
}

struct PoolState<T> {
    backends: BTreeMap<String, BackendEntry>,
    slots: HashMap<u64, Slot<T>>,
    idle: VecDeque<u64>,
    connecting: usize,
    next_slot: u64,
    nclaims: usize,
    cursor: usize,
    connected: bool,
    stopping: bool,
}

struct PoolShared<C: Connector> {
    connector: C,
    resolver: Arc<dyn Resolver>,
    options: PoolOptions,
    state: Mutex<PoolState<C::Connection>>,
    /// Wakes the manager to rebalance
    wake: Notify,
    /// Wakes `claim_async` waiters
    available: Notify,
    events: broadcast::Sender<PoolEvent>,
    shutdown: watch::Sender<bool>,
}

/// An outstanding claim on a pooled connection.
///
/// Release it with [`Claim::release`]. A claim dropped without being
/// released is returned to the pool by its destructor.
pub struct Claim<C: Connector> {
    shared: Arc<PoolShared<C>>,
    slot: u64,
    conn: Arc<C::Connection>,
    released: bool,
}

impl<C: Connector> Claim<C> {
    pub fn connection(&self) -> &Arc<C::Connection> {
        &self.conn
    }

    pub fn release(mut self) {
        self.released = true;
        self.shared.release_slot(self.slot);
    }
}

impl<C: Connector> Drop for Claim<C> {
    fn drop(&mut self) {
        if !self.released {
            debug!(slot = self.slot, "claim dropped without release");
            self.released = true;
            self.shared.release_slot(self.slot);
        }
    }
}

/// The connection pool.
///
/// # Example
///
/// ```no_run
/// use moray_client::pool::{ConnectionPool, PoolOptions};
/// use moray_client::{Defaults, PoolConfig, RpcConnector, StaticResolver};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PoolConfig::new("127.0.0.1", 2020, &Defaults::HISTORICAL)?;
/// let resolver = StaticResolver::from_addrs(&["127.0.0.1:2020".parse()?]);
/// let pool = ConnectionPool::new(
///     RpcConnector::new(100),
///     Arc::new(resolver),
///     PoolOptions::from(&config),
/// );
///
/// let claim = pool.claim_async().await?;
/// // ... issue RPCs on claim.connection() ...
/// claim.release();
/// pool.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<C: Connector> {
    shared: Arc<PoolShared<C>>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ConnectionPool<C> {
    /// Creates the pool and starts its manager task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(connector: C, resolver: Arc<dyn Resolver>, options: PoolOptions) -> Self {
        let (events, _) = broadcast::channel(16);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(PoolShared {
            connector,
            resolver,
            options,
            state: Mutex::new(PoolState {
                backends: BTreeMap::new(),
                slots: HashMap::new(),
                idle: VecDeque::new(),
                connecting: 0,
                next_slot: 0,
                nclaims: 0,
                cursor: 0,
                connected: false,
                stopping: false,
            }),
            wake: Notify::new(),
            available: Notify::new(),
            events,
            shutdown,
        });

        let manager = tokio::spawn(shared.clone().run());

        Self {
            shared,
            manager: Mutex::new(Some(manager)),
        }
    }

    /// Claims an idle connection without waiting.
    ///
    /// # Errors
    ///
    /// - [`MorayError::NoConnections`] if no idle connection exists right now
    /// - [`MorayError::Closed`] if the pool is stopping
    pub fn claim(&self) -> Result<Claim<C>> {
        self.shared.claim()
    }

    /// Claims a connection, waiting for one to become available.
    pub async fn claim_async(&self) -> Result<Claim<C>> {
        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.claim() {
                Err(MorayError::NoConnections) => notified.await,
                other => return other,
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    pub fn outstanding_claims(&self) -> usize {
        self.shared.lock().nclaims
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock();
        PoolStats {
            backends: st.backends.len(),
            connections: st.slots.len(),
            idle: st.idle.len(),
            claimed: st.nclaims,
            connecting: st.connecting,
        }
    }

    /// Stops the pool.
    ///
    /// Idle connections are destroyed immediately. Connections that are
    /// still claimed are destroyed when their claims are released; stopping
    /// with outstanding claims is logged but otherwise allowed. Emits
    /// [`PoolEvent::Close`] once the manager task has exited.
    pub async fn stop(&self) {
        let (idle, nclaims) = {
            let mut st = self.shared.lock();
            if st.stopping {
                return;
            }
            st.stopping = true;

            let state = &mut *st;
            let idle: Vec<Arc<C::Connection>> = state
                .idle
                .drain(..)
                .filter_map(|id| state.slots.remove(&id))
                .map(|slot| slot.conn)
                .collect();
            (idle, state.nclaims)
        };

        if nclaims > 0 {
            warn!(nclaims, "pool stopping with outstanding claims");
        }

        self.shared.shutdown.send_replace(true);
        self.shared.available.notify_waiters();
        for conn in idle {
            conn.destroy();
        }

        let manager = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = manager {
            let _ = handle.await;
        }

        info!("pool closed");
        self.shared.emit(PoolEvent::Close);
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        if let Some(handle) = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let conns: Vec<Arc<C::Connection>> = {
            let mut st = self.shared.lock();
            st.stopping = true;
            st.idle.clear();
            st.slots
                .iter()
                .filter(|(_, slot)| !slot.claimed)
                .map(|(_, slot)| slot.conn.clone())
                .collect()
        };
        for conn in conns {
            conn.destroy();
        }
    }
}

impl<C: Connector> PoolShared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn claim(self: &Arc<Self>) -> Result<Claim<C>> {
        let mut st = self.lock();
        if st.stopping {
            return Err(MorayError::Closed);
        }

        let state = &mut *st;
        while let Some(id) = state.idle.pop_front() {
            let Some(slot) = state.slots.get_mut(&id) else {
                continue;
            };
            if slot.retired || !slot.conn.is_usable() {
                // The connection watcher removes it
                continue;
            }

            slot.claimed = true;
            let conn = slot.conn.clone();
            state.nclaims += 1;
            let nclaims = state.nclaims;
            drop(st);

            conn.ref_connection();
            debug!(slot = id, backend = %conn.backend(), nclaims, "connection claimed");
            self.wake.notify_one();
            return Ok(Claim {
                shared: self.clone(),
                slot: id,
                conn,
                released: false,
            });
        }

        drop(st);
        self.wake.notify_one();
        Err(MorayError::NoConnections)
    }

    fn release_slot(&self, id: u64) {
        let mut st = self.lock();
        let state = &mut *st;

        let Some(slot) = state.slots.get_mut(&id) else {
            drop(st);
            error!(slot = id, "released a connection the pool does not own");
            debug_assert!(false, "connection slot {} is not owned by this pool", id);
            return;
        };
        if !slot.claimed {
            drop(st);
            error!(slot = id, "connection released twice");
            debug_assert!(false, "connection slot {} released twice", id);
            return;
        }

        slot.claimed = false;
        let discard = slot.retired || state.stopping || !slot.conn.is_usable();
        state.nclaims -= 1;
        let nclaims = state.nclaims;

        let doomed = if discard {
            state.slots.remove(&id).map(|slot| slot.conn)
        } else {
            slot.conn.unref_connection();
            state.idle.push_back(id);
            None
        };
        drop(st);

        debug!(slot = id, nclaims, "connection released");
        if let Some(conn) = doomed {
            conn.destroy();
        } else {
            self.available.notify_waiters();
        }
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut next_refresh = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_refresh {
                tokio::select! {
                    _ = self.refresh() => {}
                    _ = shutdown.changed() => break,
                }
                next_refresh = deadline_after(self.options.refresh_interval);
            }

            self.rebalance();

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(next_refresh) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!("pool manager exiting");
    }

    async fn refresh(&self) {
        match self.resolver.resolve().await {
            Ok(found) => {
                let empty = found.is_empty();
                self.apply_backends(found);
                if empty {
                    warn!("backend resolution found no backends");
                    if self.never_connected() {
                        self.emit(PoolEvent::Error("no backends found".to_string()));
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "backend resolution failed");
                if self.never_connected() {
                    self.emit(PoolEvent::Error(err.to_string()));
                }
            }
        }
    }

    /// Whether the pool has neither backends nor a past connection.
    fn never_connected(&self) -> bool {
        let st = self.lock();
        st.backends.is_empty() && !st.connected
    }

    fn apply_backends(&self, found: Vec<Backend>) {
        let mut doomed = Vec::new();
        {
            let mut st = self.lock();
            let state = &mut *st;

            let keys: HashSet<String> = found.iter().map(Backend::key).collect();
            state.backends.retain(|key, _| {
                let keep = keys.contains(key);
                if !keep {
                    info!(backend = %key, "backend removed");
                }
                keep
            });
            for backend in found {
                state
                    .backends
                    .entry(backend.key())
                    .and_modify(|entry| entry.exhausted = false)
                    .or_insert_with(|| {
                        info!(backend = %backend, "backend added");
                        BackendEntry {
                            backend,
                            exhausted: false,
                        }
                    });
            }

            let stale: Vec<u64> = state
                .slots
                .iter()
                .filter(|(_, slot)| !state.backends.contains_key(&slot.backend))
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                let claimed = match state.slots.get_mut(&id) {
                    Some(slot) => {
                        slot.retired = true;
                        slot.claimed
                    }
                    None => continue,
                };
                if !claimed {
                    state.idle.retain(|idle| *idle != id);
                    if let Some(slot) = state.slots.remove(&id) {
                        doomed.push(slot.conn);
                    }
                }
            }
        }

        for conn in doomed {
            conn.destroy();
        }
    }

    fn rebalance(self: &Arc<Self>) {
        let mut launches = Vec::new();
        {
            let mut st = self.lock();
            if st.stopping {
                return;
            }

            let candidates: Vec<Backend> = st
                .backends
                .values()
                .filter(|entry| !entry.exhausted)
                .map(|entry| entry.backend.clone())
                .collect();
            if candidates.is_empty() {
                return;
            }

            let wanted = (st.nclaims + self.options.spares)
                .max(1)
                .min(self.options.maximum);
            let mut total = st.slots.len() + st.connecting;
            while total < wanted {
                let backend = candidates[st.cursor % candidates.len()].clone();
                st.cursor = st.cursor.wrapping_add(1);
                st.connecting += 1;
                total += 1;
                launches.push(backend);
            }
        }

        for backend in launches {
            tokio::spawn(self.clone().establish(backend));
        }
    }

    async fn establish(self: Arc<Self>, backend: Backend) {
        let policy = &self.options.recovery;
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt = 0;

        let outcome = loop {
            if *shutdown.borrow() {
                break Err(MorayError::Closed);
            }

            let timeout = policy.timeout_for_attempt(attempt);
            let err = match tokio::time::timeout(timeout, self.connector.connect(&backend)).await {
                Ok(Ok(conn)) => break Ok(conn),
                Ok(Err(e)) => e,
                Err(_) => MorayError::ConnectTimeout {
                    backend: backend.key(),
                    timeout_ms: moray_common::millis(timeout),
                },
            };

            if attempt >= policy.retries() {
                break Err(err);
            }

            debug!(backend = %backend, attempt, error = %err, "connect failed; retrying");
            tokio::select! {
                _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
                _ = shutdown.changed() => break Err(MorayError::Closed),
            }
            attempt += 1;
        };

        self.on_established(backend, outcome);
    }

    fn on_established(self: &Arc<Self>, backend: Backend, outcome: Result<C::Connection>) {
        let key = backend.key();
        let mut st = self.lock();
        st.connecting = st.connecting.saturating_sub(1);

        match outcome {
            Ok(conn) => {
                if st.stopping || !st.backends.contains_key(&key) {
                    drop(st);
                    debug!(backend = %backend, "discarding connection to a stopped pool or removed backend");
                    conn.destroy();
                    return;
                }

                let id = st.next_slot;
                st.next_slot += 1;
                let conn = Arc::new(conn);
                let signal = conn.state();
                st.slots.insert(
                    id,
                    Slot {
                        backend: key,
                        conn,
                        claimed: false,
                        retired: false,
                    },
                );
                st.idle.push_back(id);
                let first = !st.connected;
                st.connected = true;
                drop(st);

                debug!(backend = %backend, slot = id, "connection established");
                tokio::spawn(self.clone().watch_connection(id, signal));
                if first {
                    info!(backend = %backend, "pool connected");
                    self.emit(PoolEvent::Connect);
                }
                self.available.notify_waiters();
                self.wake.notify_one();
            }
            Err(MorayError::Closed) => {}
            Err(err) => {
                if let Some(entry) = st.backends.get_mut(&key) {
                    entry.exhausted = true;
                }
                let all_down = !st.connected && st.backends.values().all(|entry| entry.exhausted);
                drop(st);

                warn!(backend = %backend, error = %err, "giving up on backend until the next refresh");
                if all_down {
                    self.emit(PoolEvent::Error(err.to_string()));
                }
            }
        }
    }

    async fn watch_connection(self: Arc<Self>, id: u64, mut signal: watch::Receiver<ConnectionState>) {
        let fault = match signal
            .wait_for(|state| !matches!(state, ConnectionState::Connected))
            .await
        {
            Ok(state) => match &*state {
                ConnectionState::Failed(err) => Some(err.clone()),
                _ => None,
            },
            Err(_) => None,
        };

        self.on_connection_lost(id, fault);
    }

    fn on_connection_lost(&self, id: u64, fault: Option<MorayError>) {
        let doomed = {
            let mut st = self.lock();
            let state = &mut *st;
            let claimed = match state.slots.get_mut(&id) {
                Some(slot) => {
                    if let Some(err) = &fault {
                        warn!(backend = %slot.backend, slot = id, error = %err, "connection failed");
                    }
                    slot.retired = true;
                    slot.claimed
                }
                None => return,
            };

            if claimed {
                None
            } else {
                state.idle.retain(|idle| *idle != id);
                state.slots.remove(&id).map(|slot| slot.conn)
            }
        };

        if let Some(conn) = doomed {
            conn.destroy();
        }
        self.wake.notify_one();
    }
}

fn deadline_after(interval: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(interval)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}
