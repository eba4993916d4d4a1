//! Usage service handler: current usage, summaries and bucket history.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::engine::UsageBucket;
use crate::ipc::dispatch::{
    actor_field, dimension_field, entity_field, i64_field, opt_str_field, timestamp_field,
    unknown_method, DispatchContext, DispatchResponse,
};
use crate::quota::{PeriodType, ResourceDimension};
use crate::types::{EntityId, Error, Result};

pub async fn handle(ctx: &DispatchContext, method: &str, body: Value) -> Result<DispatchResponse> {
    let engine = &ctx.engine;
    match method {
        "GetCurrentUsage" => {
            let id = entity_field(&body, "entity")?;
            let dimension = dimension_field(&body)?;
            let used = engine.get_current_usage(&id, dimension)?;
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "dimension": dimension,
                "period": engine.ledger().enforcement_period(),
                "used": used,
            })))
        }

        "GetUsageSummary" => {
            let id = entity_field(&body, "entity")?;
            let usage = engine.usage_summary(&id)?;
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "period": engine.ledger().enforcement_period(),
                "usage": usage,
            })))
        }

        "RecordConsumption" => {
            let actor = actor_field(&body)?;
            let id = entity_field(&body, "entity")?;
            let dimension = dimension_field(&body)?;
            let amount = i64_field(&body, "amount")?;
            let timestamp = timestamp_field(&body, "timestamp")?.unwrap_or_else(|| engine.now());
            let used = engine.record_consumption(&id, dimension, amount, timestamp)?;
            tracing::debug!(actor = %actor, entity = %id, dimension = %dimension, amount, "consumption_recorded");
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "dimension": dimension,
                "used": used,
            })))
        }

        "GetUsageHistory" => {
            let query = HistoryQuery::parse(&body)?;
            let buckets = query.run(ctx)?;
            Ok(DispatchResponse::Single(json!({
                "entity": query.entity,
                "dimension": query.dimension,
                "period": query.period,
                "buckets": buckets,
            })))
        }

        "StreamUsageHistory" => {
            let query = HistoryQuery::parse(&body)?;
            // Resolved up front so errors come back as a normal error frame.
            let buckets = query.run(ctx)?;
            let (tx, rx) = mpsc::channel(ctx.ipc_config.stream_channel_capacity);
            tokio::spawn(async move {
                for bucket in buckets {
                    let chunk = match serde_json::to_value(bucket) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "usage_history_chunk_encode_failed");
                            break;
                        }
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
            Ok(DispatchResponse::Stream(rx))
        }

        _ => Err(unknown_method("usage", method)),
    }
}

struct HistoryQuery {
    entity: EntityId,
    dimension: ResourceDimension,
    period: PeriodType,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl HistoryQuery {
    fn parse(body: &Value) -> Result<Self> {
        let period = opt_str_field(body, "period")
            .map(|p| p.parse())
            .transpose()?
            .unwrap_or(PeriodType::Daily);
        let range = match (timestamp_field(body, "from")?, timestamp_field(body, "to")?) {
            (Some(from), Some(to)) => Some((from, to)),
            (None, None) => None,
            _ => {
                return Err(Error::validation(
                    "history range needs both 'from' and 'to'",
                ))
            }
        };
        Ok(Self {
            entity: entity_field(body, "entity")?,
            dimension: dimension_field(body)?,
            period,
            range,
        })
    }

    fn run(&self, ctx: &DispatchContext) -> Result<Vec<UsageBucket>> {
        ctx.engine
            .get_usage_history(&self.entity, self.dimension, Some(self.period), self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ManualClock, QuotaEngine};
    use crate::quota::{QuotaUpdate, ResourceDimension::Plugins};
    use crate::types::{ActorId, EngineConfig, IpcConfig};
    use chrono::Duration;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> (DispatchContext, Arc<ManualClock>) {
        let start = DateTime::parse_from_rfc3339("2026-03-16T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let engine = QuotaEngine::with_clock(EngineConfig::default(), clock.clone());
        engine
            .create_organization(
                &ActorId::must("admin"),
                &EntityId::must("acme"),
                &QuotaUpdate::new().with(Plugins, 50),
            )
            .unwrap();
        let ctx = DispatchContext {
            engine: Arc::new(engine),
            ipc_config: IpcConfig::default(),
            shutdown: CancellationToken::new(),
        };
        (ctx, clock)
    }

    #[tokio::test]
    async fn test_current_usage_and_summary() {
        let (ctx, _) = ctx();
        ctx.engine
            .authorize(&EntityId::must("acme"), Plugins, 7)
            .unwrap()
            .into_result()
            .unwrap();

        let DispatchResponse::Single(v) =
            handle(&ctx, "GetCurrentUsage", json!({"entity": "acme", "dimension": "plugins"}))
                .await
                .unwrap()
        else {
            panic!("expected single response");
        };
        assert_eq!(v["used"], 7);
        assert_eq!(v["period"], "daily");

        let DispatchResponse::Single(v) =
            handle(&ctx, "GetUsageSummary", json!({"entity": "acme"})).await.unwrap()
        else {
            panic!("expected single response");
        };
        assert_eq!(v["usage"]["plugins"], 7);
        assert_eq!(v["usage"]["api_calls"], 0);
    }

    #[tokio::test]
    async fn test_stream_history_yields_each_bucket() {
        let (ctx, clock) = ctx();
        for _ in 0..3 {
            ctx.engine
                .authorize(&EntityId::must("acme"), Plugins, 1)
                .unwrap()
                .into_result()
                .unwrap();
            clock.advance(Duration::days(1));
        }

        let DispatchResponse::Stream(mut rx) = handle(
            &ctx,
            "StreamUsageHistory",
            json!({"entity": "acme", "dimension": "plugins", "period": "daily"}),
        )
        .await
        .unwrap() else {
            panic!("expected stream");
        };

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0]["closed"], true);
        assert_eq!(chunks[0]["consumed"], 1);
    }

    #[tokio::test]
    async fn test_half_open_range_rejected() {
        let (ctx, _) = ctx();
        let err = handle(
            &ctx,
            "GetUsageHistory",
            json!({"entity": "acme", "dimension": "plugins", "from": "2026-03-01T00:00:00Z"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_record_consumption_requires_positive_amount() {
        let (ctx, _) = ctx();
        let err = handle(
            &ctx,
            "RecordConsumption",
            json!({"actor": "metering", "entity": "acme", "dimension": "plugins", "amount": 0}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }
}
