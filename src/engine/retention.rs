//! Background retention for usage buckets.
//!
//! RetentionService periodically prunes closed buckets older than the
//! per-period retention and drops series left empty. This keeps the ledger
//! bounded in long-running deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use super::QuotaEngine;
use crate::types::RetentionConfig;

/// Statistics from a sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionStats {
    /// Number of buckets removed
    pub buckets_pruned: usize,
    /// Number of (entity, dimension) series removed
    pub series_dropped: usize,
    /// When the sweep completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// RetentionService handles background pruning.
#[derive(Debug)]
pub struct RetentionService {
    engine: Arc<QuotaEngine>,
    config: RetentionConfig,
    cancel: CancellationToken,
}

impl RetentionService {
    pub fn new(engine: Arc<QuotaEngine>, config: RetentionConfig) -> Self {
        Self {
            engine,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; sweeps run in a spawned task.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.sweep_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = Self::sweep_once(&engine, &config);
                        if stats.buckets_pruned > 0 {
                            tracing::info!(
                                buckets_pruned = stats.buckets_pruned,
                                series_dropped = stats.series_dropped,
                                "retention_sweep_completed"
                            );
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("retention_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run a single sweep.
    pub fn sweep_once(engine: &QuotaEngine, config: &RetentionConfig) -> RetentionStats {
        let now = engine.now();
        let (buckets_pruned, series_dropped) = engine.ledger().prune(config, now);
        RetentionStats {
            buckets_pruned,
            series_dropped,
            completed_at: Some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManualClock;
    use crate::quota::{QuotaUpdate, ResourceDimension::Steps};
    use crate::types::{ActorId, EngineConfig, EntityId};
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn engine_with_usage() -> (Arc<QuotaEngine>, Arc<ManualClock>) {
        let start = DateTime::parse_from_rfc3339("2026-03-18T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let engine = Arc::new(QuotaEngine::with_clock(EngineConfig::default(), clock.clone()));
        engine
            .create_organization(
                &ActorId::must("admin"),
                &EntityId::must("acme"),
                &QuotaUpdate::new().with(Steps, -1),
            )
            .unwrap();
        engine
            .authorize(&EntityId::must("acme"), Steps, 5)
            .unwrap()
            .into_result()
            .unwrap();
        (engine, clock)
    }

    #[test]
    fn test_sweep_keeps_recent_buckets() {
        let (engine, _) = engine_with_usage();
        let stats = RetentionService::sweep_once(&engine, &RetentionConfig::default());
        assert_eq!(stats.buckets_pruned, 0);
        assert!(stats.completed_at.is_some());
    }

    #[test]
    fn test_sweep_prunes_by_period() {
        let (engine, clock) = engine_with_usage();
        clock.advance(Duration::days(8));
        let stats = RetentionService::sweep_once(&engine, &RetentionConfig::default());
        // Only the hourly bucket is past its 7-day retention.
        assert_eq!(stats.buckets_pruned, 1);
        assert_eq!(stats.series_dropped, 0);
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_cancel() {
        let (engine, _) = engine_with_usage();
        let config = RetentionConfig {
            sweep_interval: StdDuration::from_millis(10),
            ..RetentionConfig::default()
        };
        let service = RetentionService::new(engine, config);
        let handle = service.start();
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        service.stop();
        tokio::time::timeout(StdDuration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
