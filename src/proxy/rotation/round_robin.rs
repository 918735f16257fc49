//! Round-robin proxy selection strategy

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::{Selection, SelectorConfig};
use crate::error::{Result, RotatorError};
use crate::proxy::registry::{Exhaustion, ProxyLease, ProxyRegistry};

/// Selects proxies in registry order, independently per destination host
///
/// A returned lease is already marked `inUse`; the mark is taken in the same
/// critical section that picked the proxy.
pub struct RoundRobinSelector {
    registry: Arc<ProxyRegistry>,
    config: SelectorConfig,
}

impl RoundRobinSelector {
    pub fn new(registry: Arc<ProxyRegistry>, config: SelectorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    /// Get the next usable proxy for `host`
    ///
    /// Fails with `AllBlocked` or `AllBroken` when nothing is selectable.
    /// While every active proxy is busy the call sleeps `use_wait_time` and
    /// starts over, for at most `selection_timeout`.
    pub async fn next_proxy(&self, host: &str) -> Result<ProxyLease> {
        let started = Instant::now();

        loop {
            match self.try_select(host, Utc::now())? {
                Selection::Ready(lease) => return Ok(lease),
                Selection::Busy => {
                    let wait = self.config.use_wait_time;
                    if started.elapsed() + wait > self.config.selection_timeout {
                        warn!(
                            host,
                            "no proxy became free within {:?}", self.config.selection_timeout
                        );
                        return Err(RotatorError::AllBroken);
                    }

                    debug!(host, "all proxies in use, waiting {:?}", wait);
                    self.registry.add_wait(wait);
                    sleep(wait).await;
                }
            }
        }
    }

    /// One lap over the registry under the lock
    pub(crate) fn try_select(&self, host: &str, now: DateTime<Utc>) -> Result<Selection> {
        let policy = *self.registry.policy();
        let mut state = self.registry.lock();

        if policy.all_broken(&state.proxies, now) {
            if policy.all_blocked(&state.proxies, now) {
                if state.exhaustion == Exhaustion::Normal {
                    error!("all proxies are blocked, rejecting requests until enough recover");
                }
                state.exhaustion = Exhaustion::Exhausted;
                return Err(RotatorError::AllBlocked);
            }
            return Err(RotatorError::AllBroken);
        }

        for _ in 0..state.proxies.len() {
            let idx = state.advance_cursor(host);
            let candidate = &state.proxies[idx];

            if policy.is_exhausted(candidate) {
                continue;
            }
            if candidate.in_use && !self.config.allow_multiple_calls {
                if policy.all_in_use(&state.proxies, now) {
                    return Ok(Selection::Busy);
                }
                continue;
            }
            if policy.is_blocked(candidate, now) || policy.is_broken(candidate, now) {
                continue;
            }

            let proxy = &mut state.proxies[idx];
            if proxy.blocked.take().is_some() {
                info!(
                    "reviving blocked proxy {} after {}s",
                    proxy.address,
                    policy.block_timeout.num_seconds()
                );
            }
            if proxy.broken.take().is_some() {
                info!(
                    "reviving broken proxy {} after {}s",
                    proxy.address,
                    policy.repair_time.num_seconds()
                );
            }
            proxy.in_use = true;

            return Ok(Selection::Ready(ProxyLease::new(
                self.registry.clone(),
                proxy,
            )));
        }

        // Unreachable while at least one proxy is active; kept as a hard stop.
        Err(RotatorError::AllBroken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Proxy;
    use crate::proxy::health::HealthPolicy;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            max_errors: 3,
            repair_time: ChronoDuration::seconds(10),
            block_timeout: ChronoDuration::seconds(20),
        }
    }

    fn selector_with(proxies: Vec<Proxy>, config: SelectorConfig) -> RoundRobinSelector {
        let registry = Arc::new(ProxyRegistry::new(proxies, policy(), 2));
        RoundRobinSelector::new(registry, config)
    }

    fn selector(addresses: &[&str]) -> RoundRobinSelector {
        let config = SelectorConfig {
            allow_multiple_calls: true,
            ..SelectorConfig::default()
        };
        selector_with(addresses.iter().map(|a| Proxy::new(*a)).collect(), config)
    }

    async fn pick(selector: &RoundRobinSelector, host: &str) -> String {
        selector.next_proxy(host).await.unwrap().address().to_string()
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let selector = selector(&["a:1", "b:1", "c:1"]);

        // Should cycle through a, b, c, a, b, c...
        assert_eq!(pick(&selector, "example.com").await, "a:1");
        assert_eq!(pick(&selector, "example.com").await, "b:1");
        assert_eq!(pick(&selector, "example.com").await, "c:1");
        assert_eq!(pick(&selector, "example.com").await, "a:1");
        assert_eq!(pick(&selector, "example.com").await, "b:1");
    }

    #[tokio::test]
    async fn test_cursors_are_per_host() {
        let selector = selector(&["a:1", "b:1"]);

        assert_eq!(pick(&selector, "one.example").await, "a:1");
        assert_eq!(pick(&selector, "two.example").await, "a:1");
        assert_eq!(pick(&selector, "one.example").await, "b:1");
    }

    #[tokio::test]
    async fn test_selected_proxy_is_in_use_until_released() {
        let selector = selector_with(
            vec![Proxy::new("a:1"), Proxy::new("b:1")],
            SelectorConfig::default(),
        );

        let lease = selector.next_proxy("example.com").await.unwrap();
        assert!(selector.registry().snapshot()[0].in_use);

        // a:1 is busy, so the next pick skips it
        let second = selector.next_proxy("example.com").await.unwrap();
        assert_eq!(second.address(), "b:1");
        let third = selector.try_select("example.com", Utc::now()).unwrap();
        assert!(matches!(third, Selection::Busy));

        drop(lease);
        drop(second);
        assert!(selector.registry().snapshot().iter().all(|p| !p.in_use));
    }

    #[tokio::test]
    async fn test_skips_exhausted_proxy() {
        let mut exhausted = Proxy::new("a:1");
        exhausted.errors = 3;
        let selector = selector_with(
            vec![exhausted, Proxy::new("b:1")],
            SelectorConfig::default(),
        );

        assert_eq!(pick(&selector, "example.com").await, "b:1");
    }

    #[tokio::test]
    async fn test_proven_proxy_survives_error_count() {
        let mut proven = Proxy::new("a:1");
        proven.errors = 5;
        proven.hits = 1;
        let selector = selector_with(vec![proven], SelectorConfig::default());

        assert_eq!(pick(&selector, "example.com").await, "a:1");
    }

    #[tokio::test]
    async fn test_broken_proxy_revived_after_repair_time() {
        let now = Utc::now();
        let mut broken = Proxy::new("a:1");
        broken.broken = Some(now);
        let selector = selector_with(
            vec![broken, Proxy::new("b:1")],
            SelectorConfig {
                allow_multiple_calls: true,
                ..SelectorConfig::default()
            },
        );

        // still inside the repair window
        for offset in [0, 5, 9] {
            let at = now + ChronoDuration::seconds(offset);
            match selector.try_select("example.com", at).unwrap() {
                Selection::Ready(lease) => assert_eq!(lease.address(), "b:1"),
                Selection::Busy => panic!("pool should not be busy"),
            }
        }

        // window elapsed: a:1 is eligible again and no longer broken
        let at = now + ChronoDuration::seconds(10);
        let mut revived = None;
        for _ in 0..2 {
            if let Selection::Ready(lease) = selector.try_select("example.com", at).unwrap() {
                if lease.address() == "a:1" {
                    revived = Some(lease);
                    break;
                }
            }
        }
        assert!(revived.is_some());
        assert!(selector.registry().snapshot()[0].broken.is_none());
    }

    #[tokio::test]
    async fn test_blocked_proxy_revived_after_block_timeout() {
        let now = Utc::now();
        let mut blocked = Proxy::new("a:1");
        blocked.blocked = Some(now - ChronoDuration::seconds(20));
        let selector = selector_with(vec![blocked], SelectorConfig::default());

        assert_eq!(pick(&selector, "example.com").await, "a:1");
        assert!(selector.registry().snapshot()[0].blocked.is_none());
    }

    #[tokio::test]
    async fn test_all_broken_when_some_unblocked() {
        let now = Utc::now();
        let mut broken = Proxy::new("a:1");
        broken.broken = Some(now);
        let mut both = Proxy::new("b:1");
        both.broken = Some(now);
        both.blocked = Some(now);
        let selector = selector_with(vec![broken, both], SelectorConfig::default());

        let err = selector.next_proxy("example.com").await.unwrap_err();
        assert!(matches!(err, RotatorError::AllBroken));
        assert_eq!(selector.registry().exhaustion(), Exhaustion::Normal);
    }

    #[tokio::test]
    async fn test_all_blocked_sets_exhaustion() {
        let now = Utc::now();
        let mut first = Proxy::new("a:1");
        first.broken = Some(now);
        first.blocked = Some(now);
        let mut second = Proxy::new("b:1");
        second.blocked = Some(now);
        let selector = selector_with(vec![first, second], SelectorConfig::default());

        let err = selector.next_proxy("example.com").await.unwrap_err();
        assert!(matches!(err, RotatorError::AllBlocked));
        assert_eq!(selector.registry().exhaustion(), Exhaustion::Exhausted);
    }

    #[tokio::test]
    async fn test_busy_pool_waits_for_release() {
        let selector = selector_with(
            vec![Proxy::new("a:1")],
            SelectorConfig {
                allow_multiple_calls: false,
                use_wait_time: Duration::from_millis(20),
                selection_timeout: Duration::from_secs(5),
            },
        );

        let lease = selector.next_proxy("example.com").await.unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            drop(lease);
        });

        let started = Instant::now();
        let second = selector.next_proxy("example.com").await.unwrap();
        assert_eq!(second.address(), "a:1");
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(selector.registry().time_waited() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_busy_pool_gives_up_after_selection_timeout() {
        let selector = selector_with(
            vec![Proxy::new("a:1")],
            SelectorConfig {
                allow_multiple_calls: false,
                use_wait_time: Duration::from_millis(10),
                selection_timeout: Duration::from_millis(50),
            },
        );

        let _lease = selector.next_proxy("example.com").await.unwrap();
        let err = selector.next_proxy("example.com").await.unwrap_err();
        assert!(matches!(err, RotatorError::AllBroken));
    }

    #[tokio::test]
    async fn test_multiple_calls_reuse_busy_proxy() {
        let selector = selector(&["a:1"]);

        let first = selector.next_proxy("example.com").await.unwrap();
        let second = selector.next_proxy("example.com").await.unwrap();
        assert_eq!(first.address(), second.address());
    }
}
