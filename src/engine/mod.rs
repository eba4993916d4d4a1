//! Quota engine: the allocation tree, usage ledger and stop flags behind one
//! facade.
//!
//! There is no engine-wide lock. Each state owner synchronizes itself:
//! - tree: one `RwLock`; every mutation takes the write side
//! - ledger: sharded map of per-(entity, dimension) mutexes
//! - stops: one `RwLock`, read-held by the gate across an authorization
//!
//! Lock order on the hot path is stops → series → tree. Nothing acquires them
//! in the reverse order, and no lock is held across I/O.

pub mod bulk;
pub mod clock;
pub mod gate;
pub mod ledger;
pub mod retention;
pub mod stop;
pub mod tree;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use bulk::{AllocationChange, BulkOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use gate::{Decision, Denial, DenyReason, EnforcementGate, Grant};
pub use ledger::{UsageBucket, UsageLedger, UsageRecord};
pub use retention::{RetentionService, RetentionStats};
pub use stop::{EmergencyStop, EmergencyStopController};
pub use tree::{AllocationTree, EntityKind, EntityNode};

use crate::quota::{Limit, PeriodType, Quota, QuotaUpdate, ResourceDimension};
use crate::store::{EngineSnapshot, SNAPSHOT_VERSION};
use crate::types::{ActorId, EngineConfig, EntityId, Error, Result};

/// The engine facade handed to request layers.
#[derive(Debug)]
pub struct QuotaEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    tree: AllocationTree,
    ledger: UsageLedger,
    stops: EmergencyStopController,
}

impl QuotaEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: UsageLedger::new(config.clone()),
            config,
            clock,
            tree: AllocationTree::new(),
            stops: EmergencyStopController::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tree(&self) -> &AllocationTree {
        &self.tree
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn stops(&self) -> &EmergencyStopController {
        &self.stops
    }

    pub fn gate(&self) -> EnforcementGate<'_> {
        EnforcementGate::new(&self.tree, &self.ledger, &self.stops)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    pub fn create_organization(
        &self,
        actor: &ActorId,
        id: &EntityId,
        quota: &QuotaUpdate,
    ) -> Result<EntityNode> {
        self.tree.create_organization(actor, id, quota)
    }

    pub fn create_department(
        &self,
        actor: &ActorId,
        id: &EntityId,
        organization: &EntityId,
    ) -> Result<EntityNode> {
        self.tree.create_department(actor, id, organization)
    }

    pub fn create_member(
        &self,
        actor: &ActorId,
        id: &EntityId,
        department: &EntityId,
    ) -> Result<EntityNode> {
        self.tree.create_member(actor, id, department)
    }

    pub fn remove_member(&self, actor: &ActorId, id: &EntityId) -> Result<EntityNode> {
        self.tree.remove_member(actor, id)
    }

    /// Also drops the department's stop flag, if any.
    pub fn remove_department(&self, actor: &ActorId, id: &EntityId) -> Result<EntityNode> {
        let removed = self.tree.remove_department(actor, id)?;
        self.stops.clear_stop(id, actor);
        Ok(removed)
    }

    pub fn remove_organization(&self, actor: &ActorId, id: &EntityId) -> Result<EntityNode> {
        let removed = self.tree.remove_organization(actor, id)?;
        self.stops.clear_stop(id, actor);
        Ok(removed)
    }

    pub fn set_organization_quota(
        &self,
        actor: &ActorId,
        id: &EntityId,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        self.tree.set_organization_quota(actor, id, update)
    }

    pub fn set_department_quota(
        &self,
        actor: &ActorId,
        id: &EntityId,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        self.tree.set_department_quota(actor, id, update)
    }

    pub fn set_member_quota(
        &self,
        actor: &ActorId,
        id: &EntityId,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        self.tree.set_member_quota(actor, id, update)
    }

    pub fn set_reservation(
        &self,
        actor: &ActorId,
        id: &EntityId,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        self.tree.set_reservation(actor, id, update)
    }

    pub fn bulk_reallocate(
        &self,
        actor: &ActorId,
        changes: &[AllocationChange],
        cancel: &CancellationToken,
    ) -> Result<BulkOutcome> {
        self.tree.bulk_reallocate(actor, changes, cancel)
    }

    pub fn get_effective_limit(&self, id: &EntityId, dimension: ResourceDimension) -> Result<Limit> {
        self.tree.effective_limit(id, dimension)
    }

    pub fn quota_limits(&self, id: &EntityId) -> Result<BTreeMap<ResourceDimension, i64>> {
        self.tree.quota_limits(id)
    }

    pub fn entity(&self, id: &EntityId) -> Result<EntityNode> {
        self.tree.entity(id)
    }

    pub fn remaining_capacity(
        &self,
        id: &EntityId,
        dimension: ResourceDimension,
    ) -> Result<Option<u64>> {
        self.tree.remaining_capacity(id, dimension)
    }

    // =========================================================================
    // Usage
    // =========================================================================

    /// Record consumption that happened outside `authorize`.
    pub fn record_consumption(
        &self,
        id: &EntityId,
        dimension: ResourceDimension,
        amount: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<u64> {
        self.tree.kind(id)?;
        self.ledger
            .record_consumption(id, dimension, amount, timestamp, self.now())
    }

    pub fn get_current_usage(&self, id: &EntityId, dimension: ResourceDimension) -> Result<u64> {
        self.tree.kind(id)?;
        Ok(self.ledger.current_usage(id, dimension, self.now()))
    }

    /// Current usage on every dimension.
    pub fn usage_summary(&self, id: &EntityId) -> Result<BTreeMap<ResourceDimension, u64>> {
        self.tree.kind(id)?;
        let now = self.now();
        Ok(ResourceDimension::ALL
            .iter()
            .map(|d| (*d, self.ledger.current_usage(id, *d, now)))
            .collect())
    }

    /// History of `period` (DAILY when omitted) over `range` or the default window.
    ///
    /// Removed entities keep their history until retention sweeps it.
    pub fn get_usage_history(
        &self,
        id: &EntityId,
        dimension: ResourceDimension,
        period: Option<PeriodType>,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<UsageBucket>> {
        self.ledger.usage_history(
            id,
            dimension,
            period.unwrap_or(PeriodType::Daily),
            range,
            self.now(),
        )
    }

    // =========================================================================
    // Enforcement
    // =========================================================================

    pub fn authorize(
        &self,
        id: &EntityId,
        dimension: ResourceDimension,
        requested: i64,
    ) -> Result<Decision> {
        self.gate().authorize(id, dimension, requested, self.now())
    }

    // =========================================================================
    // Emergency stop
    // =========================================================================

    pub fn set_stop(
        &self,
        actor: &ActorId,
        id: &EntityId,
        reason: Option<String>,
    ) -> Result<EmergencyStop> {
        let kind = self.tree.kind(id)?;
        self.stops.set_stop(id, kind, actor, reason, self.now())
    }

    pub fn clear_stop(&self, actor: &ActorId, id: &EntityId) -> Result<Option<EmergencyStop>> {
        self.tree.kind(id)?;
        Ok(self.stops.clear_stop(id, actor))
    }

    /// The stop currently blocking `id`, whether its own or inherited.
    pub fn stop_status(&self, id: &EntityId) -> Result<Option<EmergencyStop>> {
        let chain = self.tree.ancestors(id)?;
        Ok(self.stops.effective_stop(&chain))
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Capture every owner's state. Each owner is read consistently; take
    /// snapshots at quiet points if cross-owner consistency matters.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: self.now(),
            entities: self.tree.export(),
            usage: self.ledger.export(),
            stops: self.stops.list(),
        }
    }

    /// Rebuild all state from `snapshot`, validating before anything changes.
    /// Meant for startup, not for use under live traffic.
    pub fn restore(&self, snapshot: EngineSnapshot) -> Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::validation(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        let known: BTreeMap<&EntityId, EntityKind> = snapshot
            .entities
            .iter()
            .map(|node| (&node.id, node.kind))
            .collect();
        for stop in &snapshot.stops {
            if known.get(&stop.entity) != Some(&stop.kind) {
                return Err(Error::validation(format!(
                    "stop flag references unknown {} '{}'",
                    stop.kind, stop.entity
                )));
            }
        }

        let entity_count = snapshot.entities.len();
        self.tree.replace(snapshot.entities)?;
        self.ledger.replace(snapshot.usage)?;
        self.stops.replace(snapshot.stops)?;
        tracing::info!(entities = entity_count, "engine_state_restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::ResourceDimension::ApiCalls;
    use chrono::Duration;

    fn id(s: &str) -> EntityId {
        EntityId::must(s)
    }

    fn admin() -> ActorId {
        ActorId::must("admin")
    }

    fn engine_at(start: &str) -> (QuotaEngine, Arc<ManualClock>) {
        let start = DateTime::parse_from_rfc3339(start).unwrap().with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let engine = QuotaEngine::with_clock(EngineConfig::default(), clock.clone());
        engine
            .create_organization(&admin(), &id("acme"), &QuotaUpdate::new().with(ApiCalls, 1000))
            .unwrap();
        engine.create_department(&admin(), &id("eng"), &id("acme")).unwrap();
        engine.create_member(&admin(), &id("alice"), &id("eng")).unwrap();
        engine
            .set_department_quota(&admin(), &id("eng"), &QuotaUpdate::new().with(ApiCalls, 400))
            .unwrap();
        engine
            .set_member_quota(&admin(), &id("alice"), &QuotaUpdate::new().with(ApiCalls, 100))
            .unwrap();
        (engine, clock)
    }

    #[test]
    fn test_raising_allocation_reopens_member() {
        let (engine, _) = engine_at("2026-03-18T09:00:00Z");
        for _ in 0..100 {
            assert!(engine.authorize(&id("alice"), ApiCalls, 1).unwrap().is_granted());
        }
        assert!(!engine.authorize(&id("alice"), ApiCalls, 1).unwrap().is_granted());

        engine
            .set_member_quota(&admin(), &id("alice"), &QuotaUpdate::new().with(ApiCalls, 150))
            .unwrap();
        assert!(engine.authorize(&id("alice"), ApiCalls, 1).unwrap().is_granted());
    }

    #[test]
    fn test_usage_resets_at_day_boundary() {
        let (engine, clock) = engine_at("2026-03-18T23:00:00Z");
        engine.authorize(&id("alice"), ApiCalls, 100).unwrap().into_result().unwrap();
        assert_eq!(engine.get_current_usage(&id("alice"), ApiCalls).unwrap(), 100);

        clock.advance(Duration::hours(2));
        assert_eq!(engine.get_current_usage(&id("alice"), ApiCalls).unwrap(), 0);
        assert!(engine.authorize(&id("alice"), ApiCalls, 1).unwrap().is_granted());
    }

    #[test]
    fn test_department_usage_is_disjoint_from_members() {
        let (engine, _) = engine_at("2026-03-18T09:00:00Z");
        engine.authorize(&id("eng"), ApiCalls, 50).unwrap().into_result().unwrap();
        engine.authorize(&id("alice"), ApiCalls, 20).unwrap().into_result().unwrap();

        let summary = engine.usage_summary(&id("eng")).unwrap();
        assert_eq!(summary[&ApiCalls], 50);
        assert_eq!(engine.get_current_usage(&id("alice"), ApiCalls).unwrap(), 20);
    }

    #[test]
    fn test_stop_and_clear_through_facade() {
        let (engine, _) = engine_at("2026-03-18T09:00:00Z");
        engine.set_stop(&admin(), &id("eng"), Some("incident".into())).unwrap();
        assert_eq!(engine.stop_status(&id("alice")).unwrap().unwrap().entity, id("eng"));
        assert!(matches!(
            engine.set_stop(&admin(), &id("alice"), None),
            Err(Error::Validation(_))
        ));

        engine.clear_stop(&admin(), &id("eng")).unwrap();
        assert!(engine.stop_status(&id("alice")).unwrap().is_none());
        assert!(engine.authorize(&id("alice"), ApiCalls, 1).unwrap().is_granted());
    }

    #[test]
    fn test_removing_department_drops_its_stop() {
        let (engine, _) = engine_at("2026-03-18T09:00:00Z");
        engine.remove_member(&admin(), &id("alice")).unwrap();
        engine.set_stop(&admin(), &id("eng"), None).unwrap();
        engine.remove_department(&admin(), &id("eng")).unwrap();
        assert!(engine.stops().list().is_empty());
    }

    #[test]
    fn test_unknown_entity_reads_fail() {
        let (engine, _) = engine_at("2026-03-18T09:00:00Z");
        assert!(matches!(
            engine.get_current_usage(&id("ghost"), ApiCalls),
            Err(Error::EntityNotFound(_))
        ));
        assert!(matches!(
            engine.record_consumption(&id("ghost"), ApiCalls, 1, engine.now()),
            Err(Error::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let (engine, clock) = engine_at("2026-03-18T09:00:00Z");
        engine.authorize(&id("alice"), ApiCalls, 40).unwrap().into_result().unwrap();
        engine.set_stop(&admin(), &id("eng"), None).unwrap();
        let snapshot = engine.snapshot();

        let restored = QuotaEngine::with_clock(EngineConfig::default(), clock);
        restored.restore(snapshot).unwrap();
        assert_eq!(restored.get_current_usage(&id("alice"), ApiCalls).unwrap(), 40);
        assert_eq!(
            restored.get_effective_limit(&id("alice"), ApiCalls).unwrap(),
            Limit::Finite(100)
        );
        assert!(!restored.authorize(&id("alice"), ApiCalls, 1).unwrap().is_granted());
    }

    #[test]
    fn test_restore_rejects_stop_on_unknown_entity() {
        let (engine, _) = engine_at("2026-03-18T09:00:00Z");
        engine.set_stop(&admin(), &id("eng"), None).unwrap();
        let mut snapshot = engine.snapshot();
        snapshot.entities.retain(|n| n.id == id("acme"));

        let target = QuotaEngine::new(EngineConfig::default());
        assert!(matches!(target.restore(snapshot), Err(Error::Validation(_))));
        assert!(target.tree().is_empty());
    }
}
