//! HTTP middleware

mod logging;

pub use logging::RequestLogging;
