//! A fixed set of server instances handed out through RAII leases.
//!
//! Ordinary acquisitions take one free instance. A fleet acquisition announces
//! exclusive intent first, so no new ordinary lease is granted while it waits,
//! then takes every instance once all of them are free. Instances are health
//! checked on release and restarted before they become free again; a failed
//! restart makes the pool fatal.

use crate::server::{ServerError, ServerProcess};
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors returned by pool acquisition and lease release.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// No instance became free in time. Transient; callers retry.
    #[error("No server instance became free within {0:?}")]
    Exhausted(Duration),
    #[error("Server pool is unusable: {0}")]
    Fatal(String),
    #[error("Server pool has no instances")]
    Empty,
}

impl From<ServerError> for PoolError {
    fn from(err: ServerError) -> Self {
        PoolError::Fatal(err.to_string())
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<usize>,
    exclusive_active: bool,
    exclusive_waiting: usize,
    fatal: Option<String>,
    restarts: u64,
    acquisitions: u64,
}

/// Point-in-time utilization for the live report.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub busy: usize,
    pub restarts: u64,
    pub acquisitions: u64,
    pub exclusive: bool,
    pub fatal: Option<String>,
}

/// A fixed set of server-under-test instances handed out through leases.
///
/// Ordinary leases take one free instance. A fleet lease takes all of them and
/// blocks new ordinary acquisitions while it waits. Instances are health-checked
/// when they come back and restarted if they died; a failed restart makes the
/// pool fatal for good.
pub struct ServerPool {
    slots: Vec<Mutex<Box<dyn ServerProcess>>>,
    state: Mutex<PoolState>,
    available: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ServerPool {
    /// Starts every server and builds a pool where all of them are free.
    pub fn new(mut servers: Vec<Box<dyn ServerProcess>>) -> Result<Arc<Self>, PoolError> {
        if servers.is_empty() {
            return Err(PoolError::Empty);
        }
        for server in servers.iter_mut() {
            server.start()?;
            tracing::info!("Server {} ready on {}", server.id(), server.endpoint());
        }
        let state = PoolState {
            free: (0..servers.len()).collect(),
            ..PoolState::default()
        };
        Ok(Arc::new(Self {
            slots: servers.into_iter().map(Mutex::new).collect(),
            state: Mutex::new(state),
            available: Condvar::new(),
        }))
    }

    /// Number of instances, busy or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Current utilization for the live report.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            capacity: self.slots.len(),
            busy: self.slots.len() - state.free.len(),
            restarts: state.restarts,
            acquisitions: state.acquisitions,
            exclusive: state.exclusive_active,
            fatal: state.fatal.clone(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        lock(&self.state).fatal.is_some()
    }

    /// Waits on the condvar until `ready` holds, the pool turns fatal, or `deadline` passes.
    fn wait_for<'a>(
        &'a self,
        mut state: MutexGuard<'a, PoolState>,
        deadline: Instant,
        timeout: Duration,
        ready: impl Fn(&PoolState) -> bool,
    ) -> Result<MutexGuard<'a, PoolState>, (MutexGuard<'a, PoolState>, PoolError)> {
        loop {
            if let Some(reason) = &state.fatal {
                let err = PoolError::Fatal(reason.clone());
                return Err((state, err));
            }
            if ready(&state) {
                return Ok(state);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err((state, PoolError::Exhausted(timeout)));
            }
            state = self
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Takes one free instance, waiting at most `timeout`.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<ServerLease, PoolError> {
        if self.slots.is_empty() {
            return Err(PoolError::Empty);
        }
        let deadline = Instant::now() + timeout;
        let state = lock(&self.state);
        let mut state = self
            .wait_for(state, deadline, timeout, |s| {
                !s.exclusive_active && s.exclusive_waiting == 0 && !s.free.is_empty()
            })
            .map_err(|(_, e)| e)?;
        let slot = state.free.pop_front().ok_or(PoolError::Exhausted(timeout))?;
        state.acquisitions += 1;
        Ok(ServerLease::new(self.clone(), slot))
    }

    /// Takes every instance for exclusive use, waiting at most `timeout`.
    pub fn acquire_all(self: &Arc<Self>, timeout: Duration) -> Result<FleetLease, PoolError> {
        if self.slots.is_empty() {
            return Err(PoolError::Empty);
        }
        let capacity = self.slots.len();
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        state.exclusive_waiting += 1;
        let waited = self.wait_for(state, deadline, timeout, |s| {
            !s.exclusive_active && s.free.len() == capacity
        });
        let mut state = match waited {
            Ok(state) => state,
            Err((mut state, e)) => {
                state.exclusive_waiting -= 1;
                drop(state);
                // Ordinary acquirers held back by this request may proceed.
                self.available.notify_all();
                return Err(e);
            }
        };
        state.exclusive_waiting -= 1;
        state.exclusive_active = true;
        state.acquisitions += 1;
        let slots: Vec<usize> = state.free.drain(..).collect();
        drop(state);

        let leases = slots
            .into_iter()
            .map(|slot| ServerLease::new(self.clone(), slot))
            .collect();
        Ok(FleetLease {
            pool: self.clone(),
            leases,
            finished: false,
        })
    }

    /// Health-checks `slot` without holding the pool lock, then frees it.
    fn release_slot(&self, slot: usize) -> Result<(), PoolError> {
        let restart = {
            let mut server = lock(&self.slots[slot]);
            if server.is_alive() {
                None
            } else {
                tracing::warn!("Server {} is down, restarting", server.id());
                Some(server.restart())
            }
        };

        let mut state = lock(&self.state);
        let result = match restart {
            None => {
                state.free.push_back(slot);
                Ok(())
            }
            Some(Ok(())) => {
                state.restarts += 1;
                state.free.push_back(slot);
                Ok(())
            }
            Some(Err(e)) => {
                let reason = format!("restart of server {slot} failed: {e}");
                tracing::error!("{}", reason);
                state.fatal.get_or_insert(reason.clone());
                Err(PoolError::Fatal(reason))
            }
        };
        drop(state);
        self.available.notify_all();
        result
    }

    fn end_exclusive(&self) {
        lock(&self.state).exclusive_active = false;
        self.available.notify_all();
    }
}

/// One leased instance. Released on drop or through [`ServerLease::release`].
pub struct ServerLease {
    pool: Arc<ServerPool>,
    slot: usize,
    released: bool,
}

impl ServerLease {
    fn new(pool: Arc<ServerPool>, slot: usize) -> Self {
        Self {
            pool,
            slot,
            released: false,
        }
    }

    /// Index of the leased instance within the pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.with_server(|server| server.endpoint())
    }

    /// Runs `f` with exclusive access to the leased server process.
    pub fn with_server<R>(&self, f: impl FnOnce(&mut dyn ServerProcess) -> R) -> R {
        let mut server = lock(&self.pool.slots[self.slot]);
        f(server.as_mut())
    }

    /// Returns the instance now and reports a failed restart.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.released = true;
        self.pool.release_slot(self.slot)
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.pool.release_slot(self.slot) {
                tracing::error!("Releasing server slot {}: {}", self.slot, e);
            }
        }
    }
}

/// Every instance of the pool, held exclusively.
pub struct FleetLease {
    pool: Arc<ServerPool>,
    leases: Vec<ServerLease>,
    finished: bool,
}

impl FleetLease {
    /// One lease per pool slot, in slot order.
    pub fn leases(&self) -> &[ServerLease] {
        &self.leases
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    fn finish(&mut self) -> Result<(), PoolError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut first_error = None;
        for lease in self.leases.drain(..) {
            if let Err(e) = lease.release() {
                first_error.get_or_insert(e);
            }
        }
        self.pool.end_exclusive();
        first_error.map_or(Ok(()), Err)
    }

    /// Frees every instance, then ends exclusivity.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.finish()
    }
}

impl Drop for FleetLease {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::error!("Releasing server fleet: {}", e);
        }
    }
}
