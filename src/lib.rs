//! Proxy Rotator - HTTP forwarding relay over rotating upstream proxies
//!
//! Each inbound `GET /?url=...` is forwarded through one proxy from a
//! configured pool.
//!
//! ## Features
//!
//! - Per-destination-host round-robin rotation
//! - Broken and blocked proxy tracking with timed revival
//! - Pool-wide exhaustion with hysteresis before new work is accepted
//! - Optional grace spacing between calls through the same proxy
//! - Pool state saved on shutdown and restored on startup

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod state;

pub use config::Config;
pub use error::{Result, RotatorError};
