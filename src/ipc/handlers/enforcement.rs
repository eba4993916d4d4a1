//! Enforcement service handler: the authorize hot path.
//!
//! Denials are successful responses carrying a `decision: "deny"` body;
//! only malformed requests and unknown entities come back as errors.

use serde_json::Value;

use crate::ipc::dispatch::{
    dimension_field, entity_field, i64_field, single, unknown_method, DispatchContext,
    DispatchResponse,
};
use crate::types::Result;

pub async fn handle(ctx: &DispatchContext, method: &str, body: Value) -> Result<DispatchResponse> {
    match method {
        "Authorize" => {
            let id = entity_field(&body, "entity")?;
            let dimension = dimension_field(&body)?;
            let amount = i64_field(&body, "amount")?;
            single(&ctx.engine.authorize(&id, dimension, amount)?)
        }

        _ => Err(unknown_method("enforcement", method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::QuotaEngine;
    use crate::quota::{QuotaUpdate, ResourceDimension::Workflows};
    use crate::types::{ActorId, EngineConfig, EntityId, Error, IpcConfig};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> DispatchContext {
        let engine = QuotaEngine::new(EngineConfig::default());
        engine
            .create_organization(
                &ActorId::must("admin"),
                &EntityId::must("acme"),
                &QuotaUpdate::new().with(Workflows, 2),
            )
            .unwrap();
        DispatchContext {
            engine: Arc::new(engine),
            ipc_config: IpcConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn authorize(ctx: &DispatchContext, amount: i64) -> Result<Value> {
        let body = json!({"entity": "acme", "dimension": "workflows", "amount": amount});
        match handle(ctx, "Authorize", body).await? {
            DispatchResponse::Single(v) => Ok(v),
            DispatchResponse::Stream(_) => panic!("unexpected stream"),
        }
    }

    #[tokio::test]
    async fn test_grant_then_deny_body() {
        let ctx = ctx();
        let grant = authorize(&ctx, 2).await.unwrap();
        assert_eq!(grant["decision"], "grant");
        assert_eq!(grant["remaining"], 0);

        let deny = authorize(&ctx, 1).await.unwrap();
        assert_eq!(deny["decision"], "deny");
        assert_eq!(deny["reason"], "quota_exceeded");
        assert_eq!(deny["headroom"], 0);
    }

    #[tokio::test]
    async fn test_negative_amount_is_error() {
        let err = authorize(&ctx(), -3).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }
}
