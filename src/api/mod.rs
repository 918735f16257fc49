//! HTTP surface of the relay
//!
//! Forwarding endpoint, pool status, and the admin command channel.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
