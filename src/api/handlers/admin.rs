//! Admin command channel
//!
//! `POST /admin` takes a single command, either as plain text
//! (`revive`, `removeProxy: 10.0.0.1:3128`) or as JSON (`"status"`,
//! `{"command": "revive"}`, `{"removeProxy": "10.0.0.1:3128"}`).
//! The body is parsed into [`AdminCommand`] before anything touches the pool.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::api::server::AppState;
use crate::error::RotatorError;

use super::status::build_report;

/// Administrative operation on the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Status,
    ListProxies,
    Revive,
    RemoveProxy(String),
}

impl AdminCommand {
    /// Parse a command body; `None` when it is not a recognized command
    pub fn parse(body: &str) -> Option<Self> {
        let body = body.trim();
        if body.starts_with('{') || body.starts_with('"') {
            return Self::from_json(serde_json::from_str(body).ok()?);
        }
        Self::from_text(body)
    }

    fn from_text(text: &str) -> Option<Self> {
        let (name, arg) = match text.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (text.trim(), None),
        };

        match (name, arg) {
            ("status", None) => Some(AdminCommand::Status),
            ("proxies", None) => Some(AdminCommand::ListProxies),
            ("revive", None) => Some(AdminCommand::Revive),
            ("removeProxy", Some(address)) if !address.is_empty() => {
                Some(AdminCommand::RemoveProxy(address.to_string()))
            }
            _ => None,
        }
    }

    fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::String(text) => Self::from_text(&text),
            Value::Object(map) => {
                if let Some(address) = map.get("removeProxy") {
                    let address = address.as_str()?.trim();
                    return (!address.is_empty())
                        .then(|| AdminCommand::RemoveProxy(address.to_string()));
                }
                match map.get("command")?.as_str()? {
                    "removeProxy" => {
                        let address = map.get("address")?.as_str()?.trim();
                        (!address.is_empty())
                            .then(|| AdminCommand::RemoveProxy(address.to_string()))
                    }
                    other => Self::from_text(other),
                }
            }
            _ => None,
        }
    }
}

/// Dispatch an admin command
pub async fn admin(State(state): State<AppState>, body: String) -> Result<Response, RotatorError> {
    let command = AdminCommand::parse(&body).ok_or(RotatorError::UnknownCommand)?;
    info!(?command, "admin command");

    let response = match command {
        AdminCommand::Status => Json(build_report(&state)).into_response(),
        AdminCommand::ListProxies => Json(state.registry().snapshot()).into_response(),
        AdminCommand::Revive => {
            let revived = state.registry().revive_all();
            Json(json!({ "revived": revived })).into_response()
        }
        AdminCommand::RemoveProxy(address) => match state.registry().remove(&address) {
            Some(removed) => Json(json!({ "removed": removed })).into_response(),
            None => return Err(RotatorError::ProxyNotFound { address }),
        },
    };

    Ok(response)
}
