//! Request dispatcher
//!
//! Drives one inbound request: admission check, proxy selection, grace
//! spacing, the forwarded call, and health bookkeeping for the proxy that
//! served it. A 403 from upstream blocks the proxy and starts another cycle,
//! up to `max_retries` times.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hyper::StatusCode;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::Config;
use crate::error::{Result, RotatorError};
use crate::proxy::registry::{ProxyLease, ProxyRegistry};
use crate::proxy::rotation::RoundRobinSelector;
use crate::proxy::transport::{ForwardTransport, UpstreamResponse};

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Timeout for the forwarded call when the request has none
    pub default_timeout: Duration,
    /// Minimum spacing between dispatches through one proxy
    pub grace_time: Option<Duration>,
    /// Settle delay before retrying after a 403
    pub next_request_timeout: Duration,
    /// Maximum 403-triggered retry cycles
    pub max_retries: u32,
    /// Transport error codes that mark a proxy broken
    pub breaking_errors: HashSet<String>,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            grace_time: None,
            next_request_timeout: Duration::from_secs(2),
            max_retries: 3,
            breaking_errors: HashSet::new(),
        }
    }
}

impl ProxyHandlerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_timeout: config.default_timeout(),
            grace_time: config.grace_time(),
            next_request_timeout: Duration::from_millis(config.next_request_timeout),
            max_retries: config.max_retries,
            breaking_errors: config.breaking_errors.iter().cloned().collect(),
        }
    }
}

/// Upstream response together with the proxy that produced it
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub proxy: String,
    pub response: UpstreamResponse,
}

/// Proxy request dispatcher
pub struct ProxyHandler {
    selector: RoundRobinSelector,
    transport: Arc<dyn ForwardTransport>,
    config: ProxyHandlerConfig,
}

impl ProxyHandler {
    pub fn new(
        selector: RoundRobinSelector,
        transport: Arc<dyn ForwardTransport>,
        config: ProxyHandlerConfig,
    ) -> Self {
        Self {
            selector,
            transport,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        self.selector.registry()
    }

    /// Forward a GET for `url` through the pool
    #[instrument(skip(self), fields(request_id = %uuid::Uuid::new_v4()))]
    pub async fn handle(
        &self,
        url: Option<&str>,
        timeout: Option<u64>,
    ) -> Result<ForwardedResponse> {
        let target = parse_target(url)?;
        let host = target.host_str().unwrap_or_default().to_string();
        let timeout = timeout
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        let mut retries = 0;
        loop {
            if self.registry().blocked(Utc::now()) {
                debug!("pool exhausted, rejecting request");
                return Err(RotatorError::AllBlocked);
            }

            let lease = self.selector.next_proxy(&host).await?;
            self.wait_grace(&lease).await;

            debug!("Forwarding {} through proxy {}", target, lease.address());
            let result = self.transport.get(lease.address(), &target, timeout).await;
            let proxy = lease.address().to_string();

            match result {
                Err(e) if self.config.breaking_errors.contains(&e.code) => {
                    let outcome = lease.mark_broken(Utc::now());
                    if outcome.newly_broken {
                        warn!("proxy {} broken: {}", proxy, e);
                    }
                    if outcome.pool_broken {
                        error!("all proxies are broken");
                    }
                    return Err(e.into());
                }
                Err(e) => {
                    drop(lease);
                    error!("request through {} failed: {}", proxy, e);
                    return Err(e.into());
                }
                Ok(response) if response.status == StatusCode::FORBIDDEN => {
                    let pool_blocked = lease.mark_blocked(Utc::now(), self.tracks_requests());
                    warn!("proxy {} blocked by {}", proxy, host);
                    if pool_blocked {
                        error!("all proxies are blocked");
                    }

                    if retries >= self.config.max_retries {
                        warn!(retries, "giving up on {} after repeated blocks", target);
                        return Ok(ForwardedResponse { proxy, response });
                    }
                    retries += 1;
                    sleep(self.config.next_request_timeout).await;
                }
                Ok(response) => {
                    lease.record_hit(Utc::now(), self.tracks_requests());
                    info!("{} via {} -> {}", target, proxy, response.status);
                    return Ok(ForwardedResponse { proxy, response });
                }
            }
        }
    }

    fn tracks_requests(&self) -> bool {
        self.config.grace_time.is_some()
    }

    async fn wait_grace(&self, lease: &ProxyLease) {
        let Some(grace) = self.config.grace_time else {
            return;
        };
        if let Some(wait) = grace_delay(lease.last_request(), Utc::now(), grace) {
            debug!("grace spacing for {}: waiting {:?}", lease.address(), wait);
            self.registry().add_wait(wait);
            sleep(wait).await;
        }
    }
}

/// Remaining wait before a proxy last used at `last_request` may be used again
pub fn grace_delay(
    last_request: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> Option<Duration> {
    let elapsed = (now - last_request?).to_std().unwrap_or(Duration::ZERO);
    grace.checked_sub(elapsed).filter(|wait| !wait.is_zero())
}

/// Parse the `url` query value; bare host names get an implicit `http://`
///
/// Only plain `http` targets are forwarded. The transport sends the request
/// in absolute form to the proxy and has no CONNECT tunnel for TLS.
pub fn parse_target(raw: Option<&str>) -> Result<Url> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(RotatorError::MissingUrl)?;

    let url = if raw.contains("://") {
        Url::parse(raw)?
    } else {
        Url::parse(&format!("http://{}", raw))?
    };

    if url.scheme() != "http" || url.host_str().map_or(true, str::is_empty) {
        return Err(RotatorError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Proxy;
    use crate::proxy::health::HealthPolicy;
    use crate::proxy::registry::Exhaustion;
    use crate::proxy::rotation::SelectorConfig;
    use crate::proxy::transport::mock::MockTransport;
    use crate::proxy::transport::TransportError;
    use bytes::Bytes;
    use tokio_test::assert_ok;

    fn handler_with(
        addresses: &[&str],
        transport: Arc<MockTransport>,
        config: ProxyHandlerConfig,
    ) -> ProxyHandler {
        let proxies = addresses.iter().map(|a| Proxy::new(*a)).collect();
        let registry = Arc::new(ProxyRegistry::new(proxies, HealthPolicy::default(), 30));
        let selector = RoundRobinSelector::new(registry, SelectorConfig::default());
        ProxyHandler::new(selector, transport, config)
    }

    fn test_config() -> ProxyHandlerConfig {
        ProxyHandlerConfig {
            next_request_timeout: Duration::from_millis(10),
            breaking_errors: ["ETIMEDOUT", "ECONNREFUSED"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            ..ProxyHandlerConfig::default()
        }
    }

    #[test]
    fn test_parse_target_forms() {
        assert_eq!(
            parse_target(Some("example.com")).unwrap().as_str(),
            "http://example.com/"
        );
        assert_eq!(
            parse_target(Some("http://example.com/a?b=1")).unwrap().as_str(),
            "http://example.com/a?b=1"
        );
        assert_eq!(
            parse_target(Some("example.com:8080/path")).unwrap().as_str(),
            "http://example.com:8080/path"
        );
        assert!(matches!(parse_target(None), Err(RotatorError::MissingUrl)));
        assert!(matches!(parse_target(Some("  ")), Err(RotatorError::MissingUrl)));
        assert!(matches!(
            parse_target(Some("http://")),
            Err(RotatorError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_target(Some("ftp://example.com")),
            Err(RotatorError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_https_target_rejected_before_dispatch() {
        let transport = Arc::new(MockTransport::default());
        let handler = handler_with(&["p1:1"], transport.clone(), test_config());

        let err = handler
            .handle(Some("https://example.com/secret"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RotatorError::InvalidUrl(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(transport.calls().is_empty());
        assert!(!handler.registry().snapshot()[0].in_use);
    }

    #[test]
    fn test_grace_delay() {
        let now = Utc::now();
        let grace = Duration::from_millis(1000);

        assert_eq!(grace_delay(None, now, grace), None);
        assert_eq!(
            grace_delay(Some(now - chrono::Duration::milliseconds(200)), now, grace),
            Some(Duration::from_millis(800))
        );
        assert_eq!(
            grace_delay(Some(now - chrono::Duration::milliseconds(1000)), now, grace),
            None
        );
        assert_eq!(
            grace_delay(Some(now - chrono::Duration::milliseconds(5000)), now, grace),
            None
        );
    }

    #[tokio::test]
    async fn test_scenario_round_robin_success() {
        let transport = Arc::new(MockTransport::default());
        let handler = handler_with(&["p1:1", "p2:1", "p3:1"], transport.clone(), test_config());

        let first = handler.handle(Some("example.com"), None).await.unwrap();
        assert_eq!(first.proxy, "p1:1");
        assert_eq!(first.response.status, StatusCode::OK);
        assert_eq!(first.response.body, Bytes::from("hello from http://example.com/"));

        let second = handler.handle(Some("example.com"), None).await.unwrap();
        assert_eq!(second.proxy, "p2:1");

        let snapshot = handler.registry().snapshot();
        assert_eq!(snapshot[0].hits, 1);
        assert_eq!(snapshot[1].hits, 1);
        assert!(snapshot.iter().all(|p| !p.in_use));
    }

    #[tokio::test]
    async fn test_scenario_single_blocked_proxy() {
        let transport = Arc::new(MockTransport::default());
        transport.answer("p1:1", Ok(StatusCode::FORBIDDEN));
        let handler = handler_with(&["p1:1"], transport.clone(), test_config());

        let err = handler.handle(Some("blocked.example"), None).await.unwrap_err();
        assert!(matches!(err, RotatorError::AllBlocked));
        assert_eq!(err.to_string(), "all proxies are blocked");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let proxy = &handler.registry().snapshot()[0];
        assert!(proxy.blocked.is_some());
        assert_eq!(proxy.hits, 0);
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(handler.registry().exhaustion(), Exhaustion::Exhausted);

        // latched: later requests are rejected before selection
        let err = handler.handle(Some("other.example"), None).await.unwrap_err();
        assert!(matches!(err, RotatorError::AllBlocked));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_proxy_retries_on_next_proxy() {
        let transport = Arc::new(MockTransport::default());
        transport.answer("p1:1", Ok(StatusCode::FORBIDDEN));
        let handler = handler_with(&["p1:1", "p2:1"], transport.clone(), test_config());

        let forwarded = handler.handle(Some("example.com"), None).await.unwrap();
        assert_eq!(forwarded.proxy, "p2:1");
        assert_eq!(transport.calls(), vec!["p1:1", "p2:1"]);

        let snapshot = handler.registry().snapshot();
        assert!(snapshot[0].blocked.is_some());
        assert_eq!(snapshot[1].hits, 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let transport = Arc::new(MockTransport::default());
        for p in ["p1:1", "p2:1", "p3:1", "p4:1"] {
            transport.answer(p, Ok(StatusCode::FORBIDDEN));
        }
        let config = ProxyHandlerConfig {
            max_retries: 2,
            ..test_config()
        };
        let handler = handler_with(&["p1:1", "p2:1", "p3:1", "p4:1"], transport.clone(), config);

        let forwarded = handler.handle(Some("example.com"), None).await.unwrap();
        assert_eq!(forwarded.response.status, StatusCode::FORBIDDEN);
        assert_eq!(forwarded.proxy, "p3:1");
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_breaking_error_marks_proxy_broken() {
        let transport = Arc::new(MockTransport::default());
        transport.answer("p1:1", Err(TransportError::new("ETIMEDOUT", "timed out")));
        let handler = handler_with(&["p1:1", "p2:1"], transport.clone(), test_config());

        let err = handler.handle(Some("example.com"), None).await.unwrap_err();
        assert!(matches!(err, RotatorError::Transport(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "ETIMEDOUT: timed out");

        let proxy = &handler.registry().snapshot()[0];
        assert!(proxy.broken.is_some());
        assert_eq!(proxy.errors, 1);
        assert!(!proxy.in_use);

        // the broken proxy is skipped on the next request
        let forwarded = handler.handle(Some("example.com"), None).await.unwrap();
        assert_eq!(forwarded.proxy, "p2:1");
    }

    #[tokio::test]
    async fn test_unclassified_error_leaves_health_untouched() {
        let transport = Arc::new(MockTransport::default());
        transport.answer("p1:1", Err(TransportError::new("EPROTO", "bad response")));
        let handler = handler_with(&["p1:1"], transport.clone(), test_config());

        let err = handler.handle(Some("example.com"), None).await.unwrap_err();
        assert!(matches!(err, RotatorError::Transport(_)));

        let proxy = &handler.registry().snapshot()[0];
        assert!(proxy.broken.is_none());
        assert_eq!(proxy.errors, 0);
        assert!(!proxy.in_use);
    }

    #[tokio::test]
    async fn test_scenario_revive_restores_broken_proxy() {
        let transport = Arc::new(MockTransport::default());
        transport.answer("p1:1", Err(TransportError::new("ECONNREFUSED", "refused")));
        let handler = handler_with(&["p1:1"], transport.clone(), test_config());

        assert!(handler.handle(Some("example.com"), None).await.is_err());
        let err = handler.handle(Some("example.com"), None).await.unwrap_err();
        assert!(matches!(err, RotatorError::AllBroken));
        assert_eq!(err.to_string(), "all proxies are broken");

        transport.answer("p1:1", Ok(StatusCode::OK));
        handler.registry().revive_all();

        let forwarded = assert_ok!(handler.handle(Some("example.com"), None).await);
        assert_eq!(forwarded.proxy, "p1:1");
    }

    #[tokio::test]
    async fn test_invalid_url_does_not_touch_pool() {
        let transport = Arc::new(MockTransport::default());
        let handler = handler_with(&["p1:1"], transport.clone(), test_config());

        let err = handler.handle(None, None).await.unwrap_err();
        assert!(err.is_client_error());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_grace_spacing_delays_reuse() {
        let transport = Arc::new(MockTransport::default());
        let config = ProxyHandlerConfig {
            grace_time: Some(Duration::from_millis(300)),
            ..test_config()
        };
        let handler = handler_with(&["p1:1"], transport.clone(), config);

        handler.handle(Some("example.com"), None).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        handler.handle(Some("example.com"), None).await.unwrap();

        let calls = transport.timed_calls();
        assert_eq!(calls.len(), 2);
        let spacing = calls[1].1.duration_since(calls[0].1);
        assert!(spacing >= Duration::from_millis(290), "spacing was {:?}", spacing);
        assert!(spacing < Duration::from_millis(600), "spacing was {:?}", spacing);
        assert!(handler.registry().time_waited() >= Duration::from_millis(200));
        assert!(handler.registry().snapshot()[0].last_request.is_some());
    }
}
