//! Shared proxy registry
//!
//! Owns the ordered proxy records, the per-host round-robin cursors and the
//! pool-exhaustion state. Every read-then-mutate sequence runs under one
//! lock, and no lock is ever held across an await point.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::config::Config;
use crate::models::{PoolCounts, Proxy, ProxyId};
use crate::proxy::health::HealthPolicy;

/// Pool-wide exhaustion state
///
/// `Normal -> Exhausted` when a selection finds every proxy blocked.
/// `Exhausted -> Normal` only once enough proxies are active at the same
/// time, so a single revived proxy does not reopen the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exhaustion {
    #[default]
    Normal,
    Exhausted,
}

impl Exhaustion {
    /// Next state given how many proxies are active and how many are required
    pub fn transition(self, active: usize, needed: usize) -> Self {
        match self {
            Exhaustion::Exhausted if active >= needed => Exhaustion::Normal,
            state => state,
        }
    }
}

pub(crate) struct RegistryState {
    pub(crate) proxies: Vec<Proxy>,
    cursors: HashMap<String, usize>,
    pub(crate) exhaustion: Exhaustion,
    next_id: ProxyId,
}

impl RegistryState {
    fn install(&mut self, proxies: Vec<Proxy>) {
        let mut next_id = self.next_id;
        self.proxies = proxies
            .into_iter()
            .map(|mut proxy| {
                next_id += 1;
                proxy.id = next_id;
                proxy.in_use = false;
                proxy
            })
            .collect();
        self.next_id = next_id;
    }

    /// Move the host's cursor one step, wrapping at the end of the list
    pub(crate) fn advance_cursor(&mut self, host: &str) -> usize {
        let len = self.proxies.len();
        let next = match self.cursors.get(host) {
            None => {
                debug!(host, "first request for host, starting new cycle");
                0
            }
            Some(&idx) if idx + 1 >= len => 0,
            Some(&idx) => idx + 1,
        };
        self.cursors.insert(host.to_string(), next);
        next
    }

    fn find_mut(&mut self, id: ProxyId) -> Option<&mut Proxy> {
        self.proxies.iter_mut().find(|p| p.id == id)
    }
}

/// Result of recording a qualifying transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakOutcome {
    /// The proxy entered the broken state with this error
    pub newly_broken: bool,
    /// No proxy in the pool is active any more
    pub pool_broken: bool,
}

/// Ordered collection of proxies shared by the selector and the dispatcher
pub struct ProxyRegistry {
    state: Mutex<RegistryState>,
    policy: HealthPolicy,
    free_slots_needed: usize,
    time_waited_ms: AtomicU64,
}

impl ProxyRegistry {
    pub fn new(proxies: Vec<Proxy>, policy: HealthPolicy, free_slots_needed: usize) -> Self {
        let mut state = RegistryState {
            proxies: Vec::new(),
            cursors: HashMap::new(),
            exhaustion: Exhaustion::Normal,
            next_id: 0,
        };
        state.install(proxies);

        Self {
            state: Mutex::new(state),
            policy,
            free_slots_needed,
            time_waited_ms: AtomicU64::new(0),
        }
    }

    /// Build the registry from the configured proxy list
    pub fn from_config(config: &Config) -> Self {
        let mut proxies: Vec<Proxy> = config.proxies.iter().map(Proxy::new).collect();
        if config.shuffle {
            proxies.shuffle(&mut rand::thread_rng());
        }
        Self::new(
            proxies,
            HealthPolicy::from_config(config),
            config.free_slots_needed,
        )
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Copy of every record in registry order
    pub fn snapshot(&self) -> Vec<Proxy> {
        self.state.lock().proxies.clone()
    }

    pub fn exhaustion(&self) -> Exhaustion {
        self.state.lock().exhaustion
    }

    /// Replace the whole sequence, e.g. with restored state. `inUse` is reset.
    pub fn replace(&self, proxies: Vec<Proxy>) {
        let mut state = self.state.lock();
        state.install(proxies);
        info!("Installed {} proxies", state.proxies.len());
    }

    /// Pool-wide admission check consulted before accepting new work
    ///
    /// Returns `true` while the pool is exhausted and fewer than the required
    /// number of proxies are active. Clears the exhausted state otherwise.
    pub fn blocked(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.exhaustion == Exhaustion::Normal {
            return false;
        }

        let needed = self.free_slots_needed.min(state.proxies.len()).max(1);
        let active = self.policy.count_active(&state.proxies, now);

        state.exhaustion = state.exhaustion.transition(active, needed);
        if state.exhaustion == Exhaustion::Normal {
            info!(active, "enough proxies recovered, accepting requests again");
            false
        } else {
            true
        }
    }

    /// Administrative revive: clears broken/blocked on every record in place
    pub fn revive_all(&self) -> usize {
        let mut state = self.state.lock();
        for proxy in state.proxies.iter_mut() {
            proxy.revive();
        }
        let count = state.proxies.len();
        info!("Revived {} proxies", count);
        count
    }

    /// Remove the first record with this address, installing a new sequence
    pub fn remove(&self, address: &str) -> Option<Proxy> {
        let mut state = self.state.lock();
        let idx = state.proxies.iter().position(|p| p.address == address)?;

        let mut proxies = state.proxies.clone();
        let removed = proxies.remove(idx);
        state.proxies = proxies;

        info!(address, "Removed proxy");
        Some(removed)
    }

    /// Health counts as reported by the status endpoint
    pub fn counts(&self, now: DateTime<Utc>) -> PoolCounts {
        let state = self.state.lock();
        let mut counts = PoolCounts {
            proxies: state.proxies.len(),
            ..PoolCounts::default()
        };

        for proxy in &state.proxies {
            if self.policy.is_exhausted(proxy) {
                counts.error += 1;
                counts.broken += 1;
            } else if self.policy.is_broken(proxy, now) {
                counts.broken += 1;
            } else if self.policy.is_blocked(proxy, now) {
                counts.blocked += 1;
                counts.broken += 1;
            } else if proxy.in_use {
                counts.in_use += 1;
                counts.alive += 1;
            } else {
                counts.alive += 1;
            }
        }

        counts
    }

    /// When the earliest block still in force lifts
    pub fn blocked_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .proxies
            .iter()
            .filter(|p| self.policy.is_blocked(p, now))
            .filter_map(|p| p.blocked)
            .min()
            .map(|since| since + self.policy.block_timeout)
    }

    pub fn add_wait(&self, waited: Duration) {
        self.time_waited_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    /// Cumulative artificial wait (busy-pool polling and grace spacing)
    pub fn time_waited(&self) -> Duration {
        Duration::from_millis(self.time_waited_ms.load(Ordering::Relaxed))
    }

    fn release(&self, id: ProxyId) {
        if let Some(proxy) = self.state.lock().find_mut(id) {
            proxy.in_use = false;
        }
    }

    fn mark_broken(&self, id: ProxyId, now: DateTime<Utc>) -> BreakOutcome {
        let mut state = self.state.lock();
        let newly_broken = match state.find_mut(id) {
            Some(proxy) => {
                proxy.in_use = false;
                if proxy.broken.is_none() {
                    proxy.broken = Some(now);
                    proxy.errors += 1;
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        BreakOutcome {
            newly_broken,
            pool_broken: self.policy.all_broken(&state.proxies, now),
        }
    }

    fn mark_blocked(&self, id: ProxyId, now: DateTime<Utc>, track_request: bool) -> bool {
        let mut state = self.state.lock();
        if let Some(proxy) = state.find_mut(id) {
            proxy.in_use = false;
            if track_request {
                proxy.last_request = Some(now);
            }
            proxy.blocked = Some(now);
        }
        self.policy.all_blocked(&state.proxies, now)
    }

    fn record_hit(&self, id: ProxyId, now: DateTime<Utc>, track_request: bool) {
        if let Some(proxy) = self.state.lock().find_mut(id) {
            proxy.in_use = false;
            if track_request {
                proxy.last_request = Some(now);
            }
            proxy.hits += 1;
        }
    }
}

/// A proxy checked out of the registry for one outbound call
///
/// The record stays `inUse` until the lease is settled or dropped. Leases
/// address their record by id, so a record removed from the registry in the
/// meantime is simply no longer updated.
pub struct ProxyLease {
    registry: Arc<ProxyRegistry>,
    id: ProxyId,
    address: String,
    last_request: Option<DateTime<Utc>>,
    settled: bool,
}

impl ProxyLease {
    pub(crate) fn new(registry: Arc<ProxyRegistry>, proxy: &Proxy) -> Self {
        Self {
            registry,
            id: proxy.id,
            address: proxy.address.clone(),
            last_request: proxy.last_request,
            settled: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Last dispatch through this proxy at the time it was selected
    pub fn last_request(&self) -> Option<DateTime<Utc>> {
        self.last_request
    }

    /// Record a qualifying transport error
    pub fn mark_broken(mut self, now: DateTime<Utc>) -> BreakOutcome {
        self.settled = true;
        self.registry.mark_broken(self.id, now)
    }

    /// Record an upstream 403. Returns whether the whole pool is now blocked.
    pub fn mark_blocked(mut self, now: DateTime<Utc>, track_request: bool) -> bool {
        self.settled = true;
        self.registry.mark_blocked(self.id, now, track_request)
    }

    /// Record a successfully forwarded response
    pub fn record_hit(mut self, now: DateTime<Utc>, track_request: bool) {
        self.settled = true;
        self.registry.record_hit(self.id, now, track_request);
    }
}

impl fmt::Debug for ProxyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyLease")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.release(self.id);
        }
    }
}
