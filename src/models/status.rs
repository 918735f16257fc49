use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;

/// Aggregate health counts over the registry
///
/// `error` and `blocked` proxies are also counted as `broken`, and `inUse`
/// proxies are also counted as `alive`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCounts {
    pub proxies: usize,
    pub alive: usize,
    pub error: usize,
    pub broken: usize,
    pub blocked: usize,
    pub in_use: usize,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub start_time: DateTime<Utc>,
    #[serde(flatten)]
    pub counts: PoolCounts,
    /// Cumulative artificial wait in milliseconds
    pub time_waited: u64,
    pub config: Config,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
}
