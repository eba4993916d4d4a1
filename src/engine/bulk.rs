//! Bulk re-allocation.
//!
//! All changes are applied to a staged copy of the tree and validated against
//! the final state, so a batch may move capacity between siblings. The batch
//! commits as a whole or not at all; cancellation between items leaves the
//! last committed tree in place.

use parking_lot::RwLockUpgradableReadGuard;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

use super::tree::AllocationTree;
use crate::quota::QuotaUpdate;
use crate::types::{ActorId, EntityId, Error, Result};

/// One entry of a bulk batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationChange {
    pub entity: EntityId,
    pub quota: QuotaUpdate,
}

impl AllocationChange {
    pub fn new(entity: EntityId, quota: QuotaUpdate) -> Self {
        Self { entity, quota }
    }
}

/// Result of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub applied: usize,
    /// Entities whose quota actually changed.
    pub changed: Vec<EntityId>,
}

impl AllocationTree {
    /// Apply `changes` atomically.
    ///
    /// Readers (including `authorize`) keep running while the batch is
    /// staged; other mutations wait until it commits or is abandoned.
    pub fn bulk_reallocate(
        &self,
        actor: &ActorId,
        changes: &[AllocationChange],
        cancel: &CancellationToken,
    ) -> Result<BulkOutcome> {
        let guard = self.state.upgradable_read();
        let mut staged = (*guard).clone();
        let mut touched = BTreeSet::new();
        let mut changed = BTreeSet::new();

        for (index, change) in changes.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(actor = %actor, index, total = changes.len(), "bulk_reallocate_cancelled");
                return Err(Error::cancelled(format!(
                    "bulk re-allocation cancelled after {index} of {} changes; nothing applied",
                    changes.len()
                )));
            }

            let node = staged.get_mut(&change.entity).map_err(|e| annotate(index, e))?;
            let next = change.quota.apply_to(&node.quota).map_err(|e| annotate(index, e))?;
            if next != node.quota {
                changed.insert(change.entity.clone());
            }
            node.quota = next;
            touched.insert(change.entity.clone());
            if let Some(parent) = &node.parent {
                touched.insert(parent.clone());
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::cancelled("bulk re-allocation cancelled before commit; nothing applied"));
        }
        for id in &touched {
            staged.validate_node(id)?;
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(guard);
        *state = staged;
        drop(state);

        tracing::info!(
            actor = %actor,
            applied = changes.len(),
            changed = changed.len(),
            "bulk_reallocate_committed"
        );
        Ok(BulkOutcome {
            applied: changes.len(),
            changed: changed.into_iter().collect(),
        })
    }
}

fn annotate(index: usize, error: Error) -> Error {
    match error {
        Error::EntityNotFound(msg) => Error::EntityNotFound(format!("change #{index}: {msg}")),
        Error::InvalidLimit(msg) => Error::InvalidLimit(format!("change #{index}: {msg}")),
        other => other,
    }
}
