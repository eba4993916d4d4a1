//! Emergency service handler: set, clear and inspect stop flags.

use serde_json::{json, Value};

use crate::ipc::dispatch::{
    actor_field, entity_field, opt_str_field, single, unknown_method, DispatchContext,
    DispatchResponse,
};
use crate::types::Result;

pub async fn handle(ctx: &DispatchContext, method: &str, body: Value) -> Result<DispatchResponse> {
    let engine = &ctx.engine;
    match method {
        "SetStop" => {
            let actor = actor_field(&body)?;
            let id = entity_field(&body, "entity")?;
            let reason = opt_str_field(&body, "reason");
            single(&engine.set_stop(&actor, &id, reason)?)
        }

        "ClearStop" => {
            let actor = actor_field(&body)?;
            let id = entity_field(&body, "entity")?;
            let cleared = engine.clear_stop(&actor, &id)?;
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "cleared": cleared.is_some(),
                "previous": cleared,
            })))
        }

        "GetStopStatus" => {
            let id = entity_field(&body, "entity")?;
            let effective = engine.stop_status(&id)?;
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "stopped": effective.is_some(),
                "own": engine.stops().own_stop(&id),
                "effective": effective,
            })))
        }

        _ => Err(unknown_method("emergency", method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::QuotaEngine;
    use crate::quota::QuotaUpdate;
    use crate::types::{ActorId, EngineConfig, EntityId, Error, IpcConfig};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> DispatchContext {
        let engine = QuotaEngine::new(EngineConfig::default());
        let admin = ActorId::must("admin");
        engine
            .create_organization(&admin, &EntityId::must("acme"), &QuotaUpdate::new())
            .unwrap();
        engine
            .create_department(&admin, &EntityId::must("eng"), &EntityId::must("acme"))
            .unwrap();
        engine
            .create_member(&admin, &EntityId::must("alice"), &EntityId::must("eng"))
            .unwrap();
        DispatchContext {
            engine: Arc::new(engine),
            ipc_config: IpcConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn call(ctx: &DispatchContext, method: &str, body: Value) -> Result<Value> {
        match handle(ctx, method, body).await? {
            DispatchResponse::Single(v) => Ok(v),
            DispatchResponse::Stream(_) => panic!("unexpected stream"),
        }
    }

    #[tokio::test]
    async fn test_member_inherits_department_stop() {
        let ctx = ctx();
        call(&ctx, "SetStop", json!({"actor": "oncall", "entity": "eng", "reason": "runaway job"}))
            .await
            .unwrap();

        let status = call(&ctx, "GetStopStatus", json!({"entity": "alice"})).await.unwrap();
        assert_eq!(status["stopped"], true);
        assert_eq!(status["own"], Value::Null);
        assert_eq!(status["effective"]["entity"], "eng");
        assert_eq!(status["effective"]["reason"], "runaway job");

        let cleared = call(&ctx, "ClearStop", json!({"actor": "oncall", "entity": "eng"})).await.unwrap();
        assert_eq!(cleared["cleared"], true);
        let status = call(&ctx, "GetStopStatus", json!({"entity": "alice"})).await.unwrap();
        assert_eq!(status["stopped"], false);
    }

    #[tokio::test]
    async fn test_member_stop_rejected() {
        let err = call(&ctx(), "SetStop", json!({"actor": "oncall", "entity": "alice"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_clear_without_stop_reports_false() {
        let cleared = call(&ctx(), "ClearStop", json!({"actor": "oncall", "entity": "acme"}))
            .await
            .unwrap();
        assert_eq!(cleared["cleared"], false);
    }
}
