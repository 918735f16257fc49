//! Proxy rotation
//!
//! Round-robin selection over the shared registry, one cursor per
//! destination host, skipping proxies the health policy rules out.

mod round_robin;

pub use round_robin::RoundRobinSelector;

use std::time::Duration;

use crate::config::Config;
use crate::proxy::registry::ProxyLease;

/// Selection behaviour knobs
#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    /// Allow several concurrent calls through one proxy
    pub allow_multiple_calls: bool,
    /// Poll interval while every active proxy is busy
    pub use_wait_time: Duration,
    /// Upper bound on time spent polling a busy pool
    pub selection_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            allow_multiple_calls: false,
            use_wait_time: Duration::from_millis(200),
            selection_timeout: Duration::from_secs(30),
        }
    }
}

impl SelectorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allow_multiple_calls: config.allow_multiple_calls,
            use_wait_time: Duration::from_millis(config.use_wait_time),
            selection_timeout: Duration::from_millis(config.selection_timeout),
        }
    }
}

/// Outcome of one pass over the registry
pub(crate) enum Selection {
    Ready(ProxyLease),
    /// Every active proxy is in use; poll again later
    Busy,
}
