//! Enforcement gate: the hot-path consumption check.
//!
//! Owns no state. Per request:
//! 1. resolve the ancestor chain,
//! 2. deny if the entity or any ancestor is emergency-stopped,
//! 3. read the entity's own limit (unlimited skips the usage check),
//! 4. deny if `used + requested > limit`, reporting headroom,
//! 5. otherwise record the consumption and grant.
//!
//! Steps 3–5 run inside the ledger's (entity, dimension) critical section, so
//! concurrent requests on the same entity and dimension cannot jointly
//! overshoot. Unrelated entities never contend on that section.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ledger::{positive_amount, UsageLedger};
use super::stop::EmergencyStopController;
use super::tree::AllocationTree;
use crate::quota::{Limit, ResourceDimension};
use crate::types::{ActorId, EntityId, Error, GrantId, Result};

/// Successful authorization. The amount is already recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub grant_id: GrantId,
    pub entity: EntityId,
    pub dimension: ResourceDimension,
    pub amount: u64,
    pub limit: Limit,
    /// Enforcement-period usage including this grant.
    pub usage_after: u64,
    /// `None` when the limit is unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    pub granted_at: DateTime<Utc>,
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    EmergencyStopped {
        stopped_entity: EntityId,
        stopped_by: ActorId,
        since: DateTime<Utc>,
    },
    QuotaExceeded {
        limit: u64,
        used: u64,
        headroom: u64,
    },
}

/// Denied authorization. Nothing was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub entity: EntityId,
    pub dimension: ResourceDimension,
    pub requested: u64,
    #[serde(flatten)]
    pub reason: DenyReason,
}

impl Denial {
    /// Headroom for `QuotaExceeded`, for client backoff decisions.
    pub fn headroom(&self) -> Option<u64> {
        match self.reason {
            DenyReason::QuotaExceeded { headroom, .. } => Some(headroom),
            DenyReason::EmergencyStopped { .. } => None,
        }
    }
}

impl From<Denial> for Error {
    fn from(denial: Denial) -> Self {
        match denial.reason {
            DenyReason::EmergencyStopped { stopped_entity, .. } => Error::emergency_stopped(format!(
                "{} on '{}' blocked by stop on '{stopped_entity}'",
                denial.dimension, denial.entity
            )),
            DenyReason::QuotaExceeded {
                limit,
                used,
                headroom,
            } => Error::quota_exceeded(
                format!(
                    "{} on '{}': used {used} + requested {} > limit {limit}",
                    denial.dimension, denial.entity, denial.requested
                ),
                headroom,
            ),
        }
    }
}

/// Outcome of `authorize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Grant(Grant),
    Deny(Denial),
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Grant(_))
    }

    /// Turn a denial into its error kind so callers can use `?`.
    pub fn into_result(self) -> Result<Grant> {
        match self {
            Decision::Grant(grant) => Ok(grant),
            Decision::Deny(denial) => Err(denial.into()),
        }
    }
}

/// Borrowing view over the three state owners.
#[derive(Debug)]
pub struct EnforcementGate<'a> {
    tree: &'a AllocationTree,
    ledger: &'a UsageLedger,
    stops: &'a EmergencyStopController,
}

impl<'a> EnforcementGate<'a> {
    pub fn new(
        tree: &'a AllocationTree,
        ledger: &'a UsageLedger,
        stops: &'a EmergencyStopController,
    ) -> Self {
        Self {
            tree,
            ledger,
            stops,
        }
    }

    /// Grant or deny `requested` units of `dimension` for `entity` at `now`.
    ///
    /// Errors are reserved for malformed requests (`InvalidAmount`) and
    /// unknown entities (`EntityNotFound`); policy outcomes are `Decision`s.
    pub fn authorize(
        &self,
        entity: &EntityId,
        dimension: ResourceDimension,
        requested: i64,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let requested = positive_amount(requested)?;
        let chain = self.tree.ancestors(entity)?;

        // Held until the ledger write lands; see the stop module docs.
        let stops = self.stops.view();
        if let Some(stop) = stops.active_for(&chain) {
            tracing::info!(
                entity = %entity,
                dimension = %dimension,
                stopped_entity = %stop.entity,
                "authorize_denied_emergency_stop"
            );
            return Ok(Decision::Deny(Denial {
                entity: entity.clone(),
                dimension,
                requested,
                reason: DenyReason::EmergencyStopped {
                    stopped_entity: stop.entity.clone(),
                    stopped_by: stop.actor.clone(),
                    since: stop.set_at,
                },
            }));
        }

        let period = self.ledger.enforcement_period();
        let decision = self.ledger.with_series(entity, dimension, |series| {
            let limit = self.tree.effective_limit(entity, dimension)?;
            let used = series.counter(period, now);

            if let Limit::Finite(cap) = limit {
                let headroom = cap.saturating_sub(used);
                if requested > headroom {
                    return Ok(Decision::Deny(Denial {
                        entity: entity.clone(),
                        dimension,
                        requested,
                        reason: DenyReason::QuotaExceeded {
                            limit: cap,
                            used,
                            headroom,
                        },
                    }));
                }
            }

            series.record(requested, now)?;
            let usage_after = series.counter(period, now);
            Ok(Decision::Grant(Grant {
                grant_id: GrantId::new(),
                entity: entity.clone(),
                dimension,
                amount: requested,
                limit,
                usage_after,
                remaining: limit.finite().map(|cap| cap.saturating_sub(usage_after)),
                granted_at: now,
            }))
        });
        drop(stops);

        match &decision {
            Ok(Decision::Grant(grant)) => tracing::debug!(
                entity = %entity,
                dimension = %dimension,
                amount = grant.amount,
                usage_after = grant.usage_after,
                "authorize_granted"
            ),
            Ok(Decision::Deny(denial)) => tracing::info!(
                entity = %entity,
                dimension = %dimension,
                requested,
                headroom = denial.headroom(),
                "authorize_denied_quota_exceeded"
            ),
            Err(e) => tracing::warn!(entity = %entity, dimension = %dimension, error = %e, "authorize_failed"),
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tree::EntityKind;
    use crate::quota::QuotaUpdate;
    use crate::quota::ResourceDimension::{ApiCalls, Storage};
    use crate::types::EngineConfig;

    struct Fixture {
        tree: AllocationTree,
        ledger: UsageLedger,
        stops: EmergencyStopController,
    }

    impl Fixture {
        fn new() -> Self {
            let admin = ActorId::must("admin");
            let tree = AllocationTree::new();
            tree.create_organization(
                &admin,
                &EntityId::must("acme"),
                &QuotaUpdate::new().with(ApiCalls, 1000).with(Storage, -1),
            )
            .unwrap();
            tree.create_department(&admin, &EntityId::must("eng"), &EntityId::must("acme"))
                .unwrap();
            tree.create_member(&admin, &EntityId::must("alice"), &EntityId::must("eng"))
                .unwrap();
            tree.set_department_quota(
                &admin,
                &EntityId::must("eng"),
                &QuotaUpdate::new().with(ApiCalls, 400).with(Storage, -1),
            )
            .unwrap();
            tree.set_member_quota(
                &admin,
                &EntityId::must("alice"),
                &QuotaUpdate::new().with(ApiCalls, 100).with(Storage, -1),
            )
            .unwrap();
            Self {
                tree,
                ledger: UsageLedger::new(EngineConfig::default()),
                stops: EmergencyStopController::new(),
            }
        }

        fn gate(&self) -> EnforcementGate<'_> {
            EnforcementGate::new(&self.tree, &self.ledger, &self.stops)
        }
    }

    #[test]
    fn test_grants_until_limit_then_reports_zero_headroom() {
        let fx = Fixture::new();
        let alice = EntityId::must("alice");
        let now = Utc::now();

        for _ in 0..100 {
            assert!(fx.gate().authorize(&alice, ApiCalls, 1, now).unwrap().is_granted());
        }
        match fx.gate().authorize(&alice, ApiCalls, 1, now).unwrap() {
            Decision::Deny(denial) => assert_eq!(denial.headroom(), Some(0)),
            other => panic!("expected deny, got {other:?}"),
        }
        assert_eq!(fx.ledger.current_usage(&alice, ApiCalls, now), 100);
    }

    #[test]
    fn test_partial_headroom_is_reported() {
        let fx = Fixture::new();
        let alice = EntityId::must("alice");
        let now = Utc::now();
        fx.gate().authorize(&alice, ApiCalls, 70, now).unwrap().into_result().unwrap();

        let err = fx
            .gate()
            .authorize(&alice, ApiCalls, 31, now)
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(err.headroom(), Some(30));
        assert!(matches!(err, Error::QuotaExceeded { .. }));
    }

    #[test]
    fn test_unlimited_skips_usage_check() {
        let fx = Fixture::new();
        let alice = EntityId::must("alice");
        let grant = fx
            .gate()
            .authorize(&alice, Storage, 1_000_000, Utc::now())
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(grant.limit, Limit::Unlimited);
        assert_eq!(grant.remaining, None);
        assert_eq!(grant.usage_after, 1_000_000);
    }

    #[test]
    fn test_stop_on_department_blocks_member_and_department() {
        let fx = Fixture::new();
        let now = Utc::now();
        fx.stops
            .set_stop(&EntityId::must("eng"), EntityKind::Department, &ActorId::must("oncall"), None, now)
            .unwrap();

        for entity in ["alice", "eng"] {
            let decision = fx
                .gate()
                .authorize(&EntityId::must(entity), Storage, 1, now)
                .unwrap();
            let err = decision.into_result().unwrap_err();
            assert!(matches!(err, Error::EmergencyStopped(_)), "{entity}");
        }
        // The organization itself is unaffected.
        assert!(fx
            .gate()
            .authorize(&EntityId::must("acme"), Storage, 1, now)
            .unwrap()
            .is_granted());
        assert_eq!(fx.ledger.current_usage(&EntityId::must("alice"), Storage, now), 0);
    }

    #[test]
    fn test_bad_requests_are_errors() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.gate().authorize(&EntityId::must("alice"), ApiCalls, 0, Utc::now()),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            fx.gate().authorize(&EntityId::must("ghost"), ApiCalls, 1, Utc::now()),
            Err(Error::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_decision_wire_shape() {
        let denial = Decision::Deny(Denial {
            entity: EntityId::must("alice"),
            dimension: ApiCalls,
            requested: 1,
            reason: DenyReason::QuotaExceeded {
                limit: 100,
                used: 100,
                headroom: 0,
            },
        });
        let json = serde_json::to_value(&denial).unwrap();
        assert_eq!(json["decision"], "deny");
        assert_eq!(json["reason"], "quota_exceeded");
        assert_eq!(json["headroom"], 0);
        assert_eq!(json["dimension"], "api_calls");
    }
}
