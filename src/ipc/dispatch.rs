//! Top-level IPC router: routes by service, delegates to handlers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::QuotaEngine;
use crate::ipc::handlers;
use crate::quota::ResourceDimension;
use crate::types::{ActorId, EntityId, Error, IpcConfig, Result};

/// Result from dispatching a request.
#[derive(Debug)]
pub enum DispatchResponse {
    /// Single response value (most endpoints).
    Single(Value),
    /// Streaming response; each value becomes a chunk frame, then an end
    /// frame once the sender closes.
    Stream(mpsc::Receiver<Value>),
}

/// Per-request context the handlers may need beyond the body.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub engine: Arc<QuotaEngine>,
    pub ipc_config: IpcConfig,
    /// Cancelled on server shutdown.
    pub shutdown: CancellationToken,
}

/// Route an IPC request to the appropriate service handler.
pub async fn route_request(
    ctx: &DispatchContext,
    service: &str,
    method: &str,
    body: Value,
) -> Result<DispatchResponse> {
    match service {
        "allocation" => handlers::allocation::handle(ctx, method, body).await,
        "usage" => handlers::usage::handle(ctx, method, body).await,
        "enforcement" => handlers::enforcement::handle(ctx, method, body).await,
        "emergency" => handlers::emergency::handle(ctx, method, body).await,
        _ => Err(Error::validation(format!("unknown service: {service}"))),
    }
}

pub(crate) fn unknown_method(service: &str, method: &str) -> Error {
    Error::validation(format!("unknown {service} method: {method}"))
}

// =============================================================================
// Shared helpers: used by all handler modules
// =============================================================================

pub fn str_field(body: &Value, key: &str) -> Result<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::validation(format!("missing required field: {key}")))
}

pub fn opt_str_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn i64_field(body: &Value, key: &str) -> Result<i64> {
    body.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::validation(format!("missing or non-integer field: {key}")))
}

pub fn entity_field(body: &Value, key: &str) -> Result<EntityId> {
    EntityId::from_string(str_field(body, key)?).map_err(Error::validation)
}

/// Mutating methods must name who is acting.
pub fn actor_field(body: &Value) -> Result<ActorId> {
    ActorId::from_string(str_field(body, "actor")?).map_err(Error::validation)
}

pub fn dimension_field(body: &Value) -> Result<ResourceDimension> {
    str_field(body, "dimension")?.parse()
}

pub fn timestamp_field(body: &Value, key: &str) -> Result<Option<DateTime<Utc>>> {
    opt_str_field(body, key)
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| Error::validation(format!("{key}: invalid RFC 3339 timestamp: {e}")))
        })
        .transpose()
}

/// Deserialize a structured field (quota maps, change lists).
pub fn typed_field<T: DeserializeOwned>(body: &Value, key: &str) -> Result<T> {
    let raw = body
        .get(key)
        .cloned()
        .ok_or_else(|| Error::validation(format!("missing required field: {key}")))?;
    serde_json::from_value(raw).map_err(|e| Error::validation(format!("{key}: {e}")))
}

pub fn single<T: Serialize>(value: &T) -> Result<DispatchResponse> {
    Ok(DispatchResponse::Single(serde_json::to_value(value)?))
}
