//! Emergency stop controller.
//!
//! A stop on an organization blocks the whole tree; a stop on a department
//! blocks it and its members. Members never hold their own flag. Flags never
//! expire; they are cleared explicitly.
//!
//! The gate holds a read guard on the flag table from its stop check until
//! its ledger write completes. `set_stop` needs the write guard, so once it
//! returns no authorization that missed the flag can still be in flight.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::tree::EntityKind;
use crate::types::{ActorId, EntityId, Error, Result};

/// An active stop flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyStop {
    pub entity: EntityId,
    pub kind: EntityKind,
    pub actor: ActorId,
    pub set_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Emergency stop controller: sole owner of stop flags.
#[derive(Debug, Default)]
pub struct EmergencyStopController {
    flags: RwLock<HashMap<EntityId, EmergencyStop>>,
}

/// Read view held by the gate across an authorization.
pub(crate) struct StopView<'a> {
    flags: RwLockReadGuard<'a, HashMap<EntityId, EmergencyStop>>,
}

impl StopView<'_> {
    /// First active stop on the entity or any ancestor, nearest first.
    pub(crate) fn active_for(&self, chain: &[EntityId]) -> Option<&EmergencyStop> {
        chain.iter().find_map(|id| self.flags.get(id))
    }
}

impl EmergencyStopController {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn view(&self) -> StopView<'_> {
        StopView {
            flags: self.flags.read(),
        }
    }

    /// Set a stop. Setting an already-stopped entity keeps the original record.
    pub fn set_stop(
        &self,
        entity: &EntityId,
        kind: EntityKind,
        actor: &ActorId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<EmergencyStop> {
        if !kind.is_allocator() {
            return Err(Error::validation(format!(
                "member '{entity}' cannot hold an emergency stop; stop its department"
            )));
        }

        let mut flags = self.flags.write();
        if let Some(existing) = flags.get(entity) {
            tracing::debug!(entity = %entity, actor = %actor, "emergency_stop_already_set");
            return Ok(existing.clone());
        }

        let stop = EmergencyStop {
            entity: entity.clone(),
            kind,
            actor: actor.clone(),
            set_at: now,
            reason,
        };
        flags.insert(entity.clone(), stop.clone());
        tracing::warn!(entity = %entity, kind = %kind, actor = %actor, "emergency_stop_set");
        Ok(stop)
    }

    /// Clear a stop. Returns the removed flag, `None` if none was set.
    /// Requests denied while it was active stay denied.
    pub fn clear_stop(&self, entity: &EntityId, actor: &ActorId) -> Option<EmergencyStop> {
        let removed = self.flags.write().remove(entity);
        if let Some(stop) = &removed {
            tracing::warn!(
                entity = %entity,
                actor = %actor,
                set_by = %stop.actor,
                "emergency_stop_cleared"
            );
        }
        removed
    }

    /// The entity's own flag, ignoring ancestors.
    pub fn own_stop(&self, entity: &EntityId) -> Option<EmergencyStop> {
        self.flags.read().get(entity).cloned()
    }

    /// Nearest active flag along `chain` (entity first, organization last).
    pub fn effective_stop(&self, chain: &[EntityId]) -> Option<EmergencyStop> {
        self.view().active_for(chain).cloned()
    }

    /// All flags sorted by entity id.
    pub fn list(&self) -> Vec<EmergencyStop> {
        let mut stops: Vec<EmergencyStop> = self.flags.read().values().cloned().collect();
        stops.sort_by(|a, b| a.entity.cmp(&b.entity));
        stops
    }

    pub(crate) fn replace(&self, stops: Vec<EmergencyStop>) -> Result<()> {
        let mut staged = HashMap::with_capacity(stops.len());
        for stop in stops {
            if !stop.kind.is_allocator() {
                return Err(Error::validation(format!(
                    "member '{}' cannot hold an emergency stop",
                    stop.entity
                )));
            }
            staged.insert(stop.entity.clone(), stop);
        }
        *self.flags.write() = staged;
        Ok(())
    }
}
