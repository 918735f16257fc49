use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to a proxy record when it enters the registry
pub type ProxyId = u64;

/// One configured upstream proxy and its health fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    #[serde(skip)]
    pub id: ProxyId,
    /// Endpoint as configured (`host:port` or URL)
    #[serde(alias = "proxy")]
    pub address: String,
    /// Qualifying transport failures
    #[serde(default)]
    pub errors: u32,
    /// Successfully forwarded responses
    #[serde(default)]
    pub hits: u64,
    /// When the current breakage episode started
    #[serde(default)]
    pub broken: Option<DateTime<Utc>>,
    /// When the upstream last answered 403 through this proxy
    #[serde(default)]
    pub blocked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub in_use: bool,
    /// Last dispatch, tracked only while grace spacing is enabled
    #[serde(default)]
    pub last_request: Option<DateTime<Utc>>,
}

impl Proxy {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: 0,
            address: address.into(),
            errors: 0,
            hits: 0,
            broken: None,
            blocked: None,
            in_use: false,
            last_request: None,
        }
    }

    /// Administrative revival: clears both timed states and the error count
    pub fn revive(&mut self) {
        self.broken = None;
        self.blocked = None;
        self.errors = 0;
    }
}
