//! Proxy rotation core
//!
//! This module provides the forwarding machinery:
//! - Proxy registry with per-proxy health bookkeeping
//! - Round-robin selection with per-host cursors
//! - Outbound transport through upstream HTTP proxies
//! - Request dispatch with block retries and grace spacing

pub mod handler;
pub mod health;
pub mod registry;
pub mod rotation;
pub mod transport;

pub use handler::{ForwardedResponse, ProxyHandler, ProxyHandlerConfig};
pub use health::HealthPolicy;
pub use registry::{Exhaustion, ProxyLease, ProxyRegistry};
pub use rotation::{RoundRobinSelector, SelectorConfig};
pub use transport::{ForwardTransport, HyperTransport, TransportError, UpstreamResponse};
