//! Health classification for upstream proxies
//!
//! Pure predicates over proxy records and the current time. Nothing here
//! mutates state; the registry and selector apply the transitions.

use chrono::{DateTime, Duration, Utc};

use crate::config::{Config, MAX_WINDOW_SECS};
use crate::models::Proxy;

/// Thresholds deciding whether a proxy is usable
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Errors after which a proxy that never succeeded is retired
    pub max_errors: u32,
    /// How long a broken proxy stays out of rotation
    pub repair_time: Duration,
    /// How long a blocked proxy stays out of rotation
    pub block_timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_errors: 3,
            repair_time: Duration::seconds(60),
            block_timeout: Duration::seconds(300),
        }
    }
}

impl HealthPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_errors: config.max_errors,
            repair_time: window(config.repair_time),
            block_timeout: window(config.block_timeout),
        }
    }

    /// Never succeeded and used up its error allowance
    pub fn is_exhausted(&self, proxy: &Proxy) -> bool {
        proxy.errors >= self.max_errors && proxy.hits == 0
    }

    /// Blocked and the block window has not elapsed yet
    pub fn is_blocked(&self, proxy: &Proxy, now: DateTime<Utc>) -> bool {
        proxy
            .blocked
            .is_some_and(|since| now < since + self.block_timeout)
    }

    /// Broken and the repair window has not elapsed yet
    pub fn is_broken(&self, proxy: &Proxy, now: DateTime<Utc>) -> bool {
        proxy
            .broken
            .is_some_and(|since| now < since + self.repair_time)
    }

    /// Usable by error count and block status, ignoring breakage
    pub fn is_unblocked(&self, proxy: &Proxy, now: DateTime<Utc>) -> bool {
        !self.is_exhausted(proxy) && !self.is_blocked(proxy, now)
    }

    pub fn is_active(&self, proxy: &Proxy, now: DateTime<Utc>) -> bool {
        self.is_unblocked(proxy, now) && !self.is_broken(proxy, now)
    }

    /// No proxy in the pool is active
    pub fn all_broken(&self, proxies: &[Proxy], now: DateTime<Utc>) -> bool {
        !proxies.iter().any(|p| self.is_active(p, now))
    }

    /// No proxy is usable by block status alone; broken entries may still exist
    pub fn all_blocked(&self, proxies: &[Proxy], now: DateTime<Utc>) -> bool {
        !proxies.iter().any(|p| self.is_unblocked(p, now))
    }

    /// Every active proxy currently has a call in flight
    pub fn all_in_use(&self, proxies: &[Proxy], now: DateTime<Utc>) -> bool {
        proxies
            .iter()
            .all(|p| p.in_use || !self.is_active(p, now))
    }

    pub fn count_active(&self, proxies: &[Proxy], now: DateTime<Utc>) -> usize {
        proxies.iter().filter(|p| self.is_active(p, now)).count()
    }
}

/// Seconds to a window, clamped to the validated maximum
fn window(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}
