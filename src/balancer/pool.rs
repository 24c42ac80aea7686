//! Backend registry, selection and connection accounting

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::util::hash::stable_index;

use super::breaker::{BreakerPolicy, BreakerState, CircuitBreaker};

/// Default per-backend connection cap
pub const DEFAULT_BACKEND_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Connections per backend before it counts as full (0 = unlimited)
    pub capacity: usize,
    pub breaker: BreakerPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BACKEND_CAPACITY,
            breaker: BreakerPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("No healthy backend available")]
    NoHealthyBackend,

    #[error("All servers busy")]
    Saturated,

    #[error("Backend already registered: {0}")]
    DuplicateBackend(String),
}

struct Backend {
    /// Unique per registration; a re-added URL gets a new id
    id: u64,
    url: String,
    active: usize,
    breaker: CircuitBreaker,
    retire: watch::Sender<bool>,
}

#[derive(Default)]
struct PoolInner {
    backends: Vec<Backend>,
    next_id: u64,
}

impl PoolInner {
    fn find_mut(&mut self, id: u64) -> Option<&mut Backend> {
        self.backends.iter_mut().find(|b| b.id == id)
    }
}

/// Snapshot of one backend for admin endpoints
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: u64,
    pub url: String,
    pub active: usize,
    pub state: BreakerState,
    pub failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

/// Load figure the autoscaler works from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLoad {
    pub id: u64,
    pub url: String,
    pub active: usize,
}

/// Ordered set of backends. Insertion order breaks least-connections ties.
pub struct BackendPool {
    settings: PoolSettings,
    inner: Mutex<PoolInner>,
}

impl BackendPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn with_backends<I, S>(settings: PoolSettings, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::new(settings);
        for url in urls {
            if let Err(e) = pool.add_backend(url) {
                warn!("Skipping backend: {}", e);
            }
        }
        pool
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Register a backend. Returns its id.
    pub fn add_backend(&self, url: impl Into<String>) -> Result<u64, PoolError> {
        let url = url.into();
        let mut inner = self.inner.lock();
        if inner.backends.iter().any(|b| b.url == url) {
            return Err(PoolError::DuplicateBackend(url));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let (retire, _) = watch::channel(false);
        inner.backends.push(Backend {
            id,
            url: url.clone(),
            active: 0,
            breaker: CircuitBreaker::new(self.settings.breaker),
            retire,
        });
        info!(backend = %url, id, "Backend added");
        Ok(id)
    }

    /// Unregister a backend and cut its live sessions. Returns false if unknown.
    pub fn remove_backend(&self, url: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(index) = inner.backends.iter().position(|b| b.url == url) else {
            return false;
        };
        let backend = inner.backends.remove(index);
        backend.retire.send_replace(true);
        info!(backend = %url, active = backend.active, "Backend removed");
        true
    }

    /// Unregister a backend only if it has no live sessions. The idle check and the
    /// removal happen under one lock, so a concurrent pick cannot slip in between.
    pub fn remove_if_idle(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(index) = inner.backends.iter().position(|b| b.id == id) else {
            return false;
        };
        if inner.backends[index].active > 0 {
            return false;
        }
        let backend = inner.backends.remove(index);
        backend.retire.send_replace(true);
        info!(backend = %backend.url, "Idle backend removed");
        true
    }

    /// Cut every live session (shutdown)
    pub fn retire_all(&self) {
        let mut inner = self.inner.lock();
        for backend in inner.backends.drain(..) {
            backend.retire.send_replace(true);
        }
    }

    /// Least-connections pick among backends whose breaker admits traffic
    pub fn pick_backend(self: &Arc<Self>) -> Result<BackendLease, PoolError> {
        self.select(Instant::now(), None, &[])
    }

    /// Sticky pick: the backend the token hashes to, or least-connections if that
    /// one cannot take the connection
    pub fn pick_backend_for_token(self: &Arc<Self>, token: &str) -> Result<BackendLease, PoolError> {
        self.select(Instant::now(), Some(token), &[])
    }

    /// Pick for a retry, skipping backends that already failed this session
    pub fn pick_excluding(
        self: &Arc<Self>,
        token: Option<&str>,
        exclude: &[u64],
    ) -> Result<BackendLease, PoolError> {
        self.select(Instant::now(), token, exclude)
    }

    fn select(
        self: &Arc<Self>,
        now: Instant,
        token: Option<&str>,
        exclude: &[u64],
    ) -> Result<BackendLease, PoolError> {
        let capacity = self.settings.capacity;
        let mut inner = self.inner.lock();

        let eligible: Vec<usize> = inner
            .backends
            .iter_mut()
            .enumerate()
            .filter(|(_, b)| !exclude.contains(&b.id))
            .filter_map(|(i, b)| b.breaker.is_eligible(now).then_some(i))
            .collect();
        if eligible.is_empty() {
            return Err(PoolError::NoHealthyBackend);
        }

        let has_room = |b: &Backend| capacity == 0 || b.active < capacity;

        let sticky = token
            .and_then(|t| stable_index(t, inner.backends.len()))
            .filter(|i| eligible.contains(i) && has_room(&inner.backends[*i]));

        let index = match sticky {
            Some(i) => i,
            None => {
                // min_by_key keeps the first minimum, i.e. insertion order
                let least = eligible
                    .iter()
                    .copied()
                    .min_by_key(|i| inner.backends[*i].active)
                    .ok_or(PoolError::NoHealthyBackend)?;
                if !has_room(&inner.backends[least]) {
                    return Err(PoolError::Saturated);
                }
                least
            }
        };

        let backend = &mut inner.backends[index];
        backend.active += 1;
        let trial = backend.breaker.on_admit();
        debug!(backend = %backend.url, active = backend.active, trial, "Backend selected");

        Ok(BackendLease {
            pool: Arc::clone(self),
            id: backend.id,
            url: backend.url.clone(),
            retired: backend.retire.subscribe(),
            trial,
            reported: false,
        })
    }

    /// Give a connection slot back. Saturates at zero; unknown ids are ignored.
    fn release(&self, id: u64, abandoned_trial: bool) {
        let mut inner = self.inner.lock();
        if let Some(backend) = inner.find_mut(id) {
            backend.active = backend.active.saturating_sub(1);
            if abandoned_trial {
                backend.breaker.abandon_trial();
            }
        }
    }

    /// Upstream connection succeeded
    pub fn on_success(&self, lease: &mut BackendLease) {
        lease.reported = true;
        if let Some(backend) = self.inner.lock().find_mut(lease.id) {
            if backend.breaker.state_at(Instant::now()) != BreakerState::Closed {
                info!(backend = %backend.url, "Backend recovered");
            }
            backend.breaker.on_success();
        }
    }

    /// Upstream connection failed
    pub fn on_failure(&self, lease: &mut BackendLease) {
        self.on_failure_at(lease, Instant::now());
    }

    fn on_failure_at(&self, lease: &mut BackendLease, now: Instant) {
        lease.reported = true;
        if let Some(backend) = self.inner.lock().find_mut(lease.id) {
            backend.breaker.on_failure(now);
            warn!(
                backend = %backend.url,
                failures = backend.breaker.failures(),
                cooldown_ms = backend
                    .breaker
                    .remaining_cooldown(now)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                "Backend marked unhealthy"
            );
        }
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        let now = Instant::now();
        self.inner
            .lock()
            .backends
            .iter()
            .map(|b| BackendStatus {
                id: b.id,
                url: b.url.clone(),
                active: b.active,
                state: b.breaker.state_at(now),
                failures: b.breaker.failures(),
                cooldown_remaining_ms: b
                    .breaker
                    .remaining_cooldown(now)
                    .map(|d| d.as_millis() as u64),
            })
            .collect()
    }

    /// Per-backend active counts in insertion order
    pub fn load(&self) -> Vec<BackendLoad> {
        self.inner
            .lock()
            .backends
            .iter()
            .map(|b| BackendLoad {
                id: b.id,
                url: b.url.clone(),
                active: b.active,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_active(&self) -> usize {
        self.inner.lock().backends.iter().map(|b| b.active).sum()
    }
}

/// One accepted connection on a backend. Dropping it releases the slot exactly once.
pub struct BackendLease {
    pool: Arc<BackendPool>,
    id: u64,
    url: String,
    retired: watch::Receiver<bool>,
    trial: bool,
    reported: bool,
}

impl BackendLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Resolves once the backend is removed or the balancer shuts down
    pub async fn retired(&mut self) {
        loop {
            if *self.retired.borrow_and_update() {
                return;
            }
            if self.retired.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLease")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.pool.release(self.id, self.trial && !self.reported);
    }
}
