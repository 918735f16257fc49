//! Request handlers

pub mod admin;
pub mod forward;
pub mod health;
pub mod status;
