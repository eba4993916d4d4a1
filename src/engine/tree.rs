//! Allocation tree store.
//!
//! Holds Organization → Department → Member allocations and enforces, for
//! every parent `P` and dimension `D` where `P` has a finite limit:
//!
//! ```text
//! reservation(P, D) + Σ quota(child, D)  <=  quota(P, D)
//! ```
//!
//! Nodes hold their parent's id, not a reference; ancestors are resolved by
//! lookup. Every mutation runs under the tree's write lock and validates
//! before it commits, so sibling updates never interleave and a failed
//! mutation leaves no trace.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::quota::{Limit, Quota, QuotaUpdate, ResourceDimension};
use crate::types::{ActorId, EntityId, Error, Result};

/// Level of a node in the allocation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Organization,
    Department,
    Member,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::Department => "department",
            EntityKind::Member => "member",
        }
    }

    /// Kind of the required parent; `None` for the root.
    pub fn parent_kind(self) -> Option<EntityKind> {
        match self {
            EntityKind::Organization => None,
            EntityKind::Department => Some(EntityKind::Organization),
            EntityKind::Member => Some(EntityKind::Department),
        }
    }

    /// Organizations and departments sub-allocate, hold reservations, and
    /// may carry an emergency stop. Members do none of these.
    pub fn is_allocator(self) -> bool {
        !matches!(self, EntityKind::Member)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entity with its own ceiling and the part of it kept for itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNode {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityId>,
    #[serde(default)]
    pub children: BTreeSet<EntityId>,
    pub quota: Quota,
    /// Always finite. Zero for members.
    #[serde(default)]
    pub reservation: Quota,
}

impl EntityNode {
    fn new(id: EntityId, kind: EntityKind, parent: Option<EntityId>, quota: Quota) -> Self {
        Self {
            id,
            kind,
            parent,
            children: BTreeSet::new(),
            quota,
            reservation: Quota::zero(),
        }
    }

    fn reserved(&self, dimension: ResourceDimension) -> u64 {
        self.reservation.get(dimension).finite().unwrap_or(0)
    }
}

/// What a parent has promised away on one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Committed {
    Finite(u64),
    /// A child holds an unlimited allocation.
    Unlimited(EntityId),
}

/// Tree contents. Cloned wholesale for staged bulk changes.
#[derive(Debug, Clone, Default)]
pub(super) struct TreeState {
    pub(super) nodes: HashMap<EntityId, EntityNode>,
}

impl TreeState {
    pub(super) fn get(&self, id: &EntityId) -> Result<&EntityNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::not_found(format!("unknown entity '{id}'")))
    }

    fn get_kind(&self, id: &EntityId, kind: EntityKind) -> Result<&EntityNode> {
        match self.nodes.get(id) {
            Some(node) if node.kind == kind => Ok(node),
            _ => Err(Error::not_found(format!("no {kind} '{id}'"))),
        }
    }

    pub(super) fn get_mut(&mut self, id: &EntityId) -> Result<&mut EntityNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("unknown entity '{id}'")))
    }

    fn ensure_vacant(&self, id: &EntityId) -> Result<()> {
        if self.nodes.contains_key(id) {
            return Err(Error::validation(format!("entity '{id}' already exists")));
        }
        Ok(())
    }

    /// The entity followed by its ancestors, organization last.
    pub(super) fn chain(&self, id: &EntityId) -> Result<Vec<EntityId>> {
        let mut chain = Vec::with_capacity(3);
        let mut cursor = Some(id.clone());
        while let Some(current) = cursor {
            if chain.len() >= 3 {
                return Err(Error::internal(format!("ancestor chain of '{id}' is too deep")));
            }
            cursor = self.get(&current)?.parent.clone();
            chain.push(current);
        }
        Ok(chain)
    }

    /// `reservation` plus every child's allocation, optionally skipping one child.
    fn committed(
        &self,
        node: &EntityNode,
        dimension: ResourceDimension,
        reservation: u64,
        excluding: Option<&EntityId>,
    ) -> Committed {
        let mut total = reservation;
        for child_id in &node.children {
            if Some(child_id) == excluding {
                continue;
            }
            let Some(child) = self.nodes.get(child_id) else {
                continue;
            };
            match child.quota.get(dimension) {
                Limit::Unlimited => return Committed::Unlimited(child_id.clone()),
                Limit::Finite(n) => total = total.saturating_add(n),
            }
        }
        Committed::Finite(total)
    }

    /// Would `child` holding `limit` on `dimension` still fit inside `parent`?
    fn check_child_fits(
        &self,
        parent: &EntityNode,
        child: &EntityId,
        child_kind: EntityKind,
        dimension: ResourceDimension,
        limit: Limit,
    ) -> Result<()> {
        let Limit::Finite(cap) = parent.quota.get(dimension) else {
            return Ok(());
        };
        let Limit::Finite(requested) = limit else {
            return Err(Error::capacity_violation(format!(
                "{dimension}: {child_kind} '{child}' cannot be unlimited under {} '{}' limited to {cap}",
                parent.kind, parent.id
            )));
        };
        match self.committed(parent, dimension, parent.reserved(dimension), Some(child)) {
            Committed::Unlimited(sibling) => Err(Error::capacity_violation(format!(
                "{dimension}: sibling '{sibling}' is unlimited under {} '{}' limited to {cap}",
                parent.kind, parent.id
            ))),
            Committed::Finite(used) => {
                let available = cap.saturating_sub(used);
                if requested > available {
                    return Err(Error::capacity_violation(format!(
                        "{dimension}: {child_kind} '{child}' requested {requested} but {} '{}' has {available} of {cap} available",
                        parent.kind, parent.id
                    )));
                }
                Ok(())
            }
        }
    }

    /// Does `limit` on `node` still cover `reservation` plus its children?
    fn check_covers_children(
        &self,
        node: &EntityNode,
        dimension: ResourceDimension,
        limit: Limit,
        reservation: u64,
    ) -> Result<()> {
        let Limit::Finite(cap) = limit else {
            return Ok(());
        };
        match self.committed(node, dimension, reservation, None) {
            Committed::Unlimited(child) => Err(Error::capacity_violation(format!(
                "{dimension}: cannot cap {} '{}' at {cap} while '{child}' is unlimited",
                node.kind, node.id
            ))),
            Committed::Finite(used) if used > cap => Err(Error::capacity_violation(format!(
                "{dimension}: {} '{}' cannot go to {cap}; {used} is already reserved or sub-allocated",
                node.kind, node.id
            ))),
            Committed::Finite(_) => Ok(()),
        }
    }

    /// Full invariant check for one node, against its parent and its children.
    pub(super) fn validate_node(&self, id: &EntityId) -> Result<()> {
        let node = self.get(id)?;
        let parent = match &node.parent {
            Some(parent_id) => Some(self.get(parent_id)?),
            None => None,
        };
        for (dimension, limit) in node.quota.iter() {
            let Some(reserved) = node.reservation.get(dimension).finite() else {
                return Err(Error::invalid_limit(format!(
                    "{dimension}: reservation of '{id}' must be finite"
                )));
            };
            if let Some(parent) = parent {
                self.check_child_fits(parent, &node.id, node.kind, dimension, limit)?;
            }
            self.check_covers_children(node, dimension, limit, reserved)?;
        }
        Ok(())
    }

    /// Rebuild from flat records, linking children from parent ids.
    pub(super) fn from_nodes(nodes: Vec<EntityNode>) -> Result<Self> {
        let mut state = TreeState::default();
        for mut node in nodes {
            state.ensure_vacant(&node.id)?;
            node.children.clear();
            if !node.kind.is_allocator() {
                node.reservation = Quota::zero();
            }
            state.nodes.insert(node.id.clone(), node);
        }

        let links: Vec<(EntityId, EntityKind, Option<EntityId>)> = state
            .nodes
            .values()
            .map(|n| (n.id.clone(), n.kind, n.parent.clone()))
            .collect();
        for (id, kind, parent) in links {
            match (kind.parent_kind(), parent) {
                (None, None) => {}
                (Some(parent_kind), Some(parent_id)) => {
                    state.get_kind(&parent_id, parent_kind).map_err(|_| {
                        Error::validation(format!("{kind} '{id}' references missing {parent_kind} '{parent_id}'"))
                    })?;
                    state.get_mut(&parent_id)?.children.insert(id);
                }
                (None, Some(_)) => {
                    return Err(Error::validation(format!("organization '{id}' cannot have a parent")));
                }
                (Some(_), None) => {
                    return Err(Error::validation(format!("{kind} '{id}' has no parent")));
                }
            }
        }

        let ids: Vec<EntityId> = state.nodes.keys().cloned().collect();
        for id in &ids {
            state.validate_node(id)?;
        }
        Ok(state)
    }
}

/// Allocation tree store: sole owner of quota and tree-shape data.
#[derive(Debug, Default)]
pub struct AllocationTree {
    pub(super) state: RwLock<TreeState>,
}

impl AllocationTree {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn create_organization(
        &self,
        actor: &ActorId,
        id: &EntityId,
        quota: &QuotaUpdate,
    ) -> Result<EntityNode> {
        let quota = quota.apply_to(&Quota::zero())?;
        let mut state = self.state.write();
        state.ensure_vacant(id)?;

        let node = EntityNode::new(id.clone(), EntityKind::Organization, None, quota);
        state.nodes.insert(id.clone(), node.clone());
        tracing::info!(actor = %actor, entity = %id, kind = "organization", "entity_created");
        Ok(node)
    }

    pub fn create_department(
        &self,
        actor: &ActorId,
        id: &EntityId,
        organization: &EntityId,
    ) -> Result<EntityNode> {
        self.create_child(actor, id, organization, EntityKind::Department)
    }

    pub fn create_member(
        &self,
        actor: &ActorId,
        id: &EntityId,
        department: &EntityId,
    ) -> Result<EntityNode> {
        self.create_child(actor, id, department, EntityKind::Member)
    }

    /// New children start at zero on every dimension, which always fits.
    fn create_child(
        &self,
        actor: &ActorId,
        id: &EntityId,
        parent: &EntityId,
        kind: EntityKind,
    ) -> Result<EntityNode> {
        let parent_kind = kind
            .parent_kind()
            .ok_or_else(|| Error::internal(format!("{kind} has no parent level")))?;
        let mut state = self.state.write();
        state.ensure_vacant(id)?;
        state.get_kind(parent, parent_kind)?;

        let node = EntityNode::new(id.clone(), kind, Some(parent.clone()), Quota::zero());
        state.get_mut(parent)?.children.insert(id.clone());
        state.nodes.insert(id.clone(), node.clone());
        tracing::info!(actor = %actor, entity = %id, parent = %parent, kind = %kind, "entity_created");
        Ok(node)
    }

    pub fn remove_member(&self, actor: &ActorId, id: &EntityId) -> Result<EntityNode> {
        self.remove(actor, id, EntityKind::Member)
    }

    pub fn remove_department(&self, actor: &ActorId, id: &EntityId) -> Result<EntityNode> {
        self.remove(actor, id, EntityKind::Department)
    }

    pub fn remove_organization(&self, actor: &ActorId, id: &EntityId) -> Result<EntityNode> {
        self.remove(actor, id, EntityKind::Organization)
    }

    /// Remove a leaf; its allocation returns to the parent's free capacity.
    fn remove(&self, actor: &ActorId, id: &EntityId, kind: EntityKind) -> Result<EntityNode> {
        let mut state = self.state.write();
        let node = state.get_kind(id, kind)?;
        if !node.children.is_empty() {
            return Err(Error::validation(format!(
                "{kind} '{id}' still has {} children",
                node.children.len()
            )));
        }
        let removed = state
            .nodes
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("no {kind} '{id}'")))?;
        if let Some(parent) = &removed.parent {
            if let Some(parent) = state.nodes.get_mut(parent) {
                parent.children.remove(id);
            }
        }
        tracing::info!(actor = %actor, entity = %id, kind = %kind, "entity_removed");
        Ok(removed)
    }

    // =========================================================================
    // Allocation mutations
    // =========================================================================

    pub fn set_organization_quota(
        &self,
        actor: &ActorId,
        id: &EntityId,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        self.set_quota(actor, id, EntityKind::Organization, update)
    }

    pub fn set_department_quota(
        &self,
        actor: &ActorId,
        id: &EntityId,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        self.set_quota(actor, id, EntityKind::Department, update)
    }

    pub fn set_member_quota(
        &self,
        actor: &ActorId,
        id: &EntityId,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        self.set_quota(actor, id, EntityKind::Member, update)
    }

    /// Validate every touched dimension against the parent's free capacity
    /// and against what this entity already handed out, then commit all of
    /// it or nothing.
    fn set_quota(
        &self,
        actor: &ActorId,
        id: &EntityId,
        kind: EntityKind,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        let mut state = self.state.write();
        let node = state.get_kind(id, kind)?;
        let next = update.apply_to(&node.quota)?;

        let parent = match &node.parent {
            Some(parent_id) => Some(state.get(parent_id)?),
            None => None,
        };
        for dimension in update.dimensions() {
            let limit = next.get(dimension);
            if let Some(parent) = parent {
                state.check_child_fits(parent, id, kind, dimension, limit)?;
            }
            state.check_covers_children(node, dimension, limit, node.reserved(dimension))?;
        }

        let previous = node.quota;
        state.get_mut(id)?.quota = next;
        for dimension in update.dimensions() {
            if previous.get(dimension) != next.get(dimension) {
                tracing::info!(
                    actor = %actor,
                    entity = %id,
                    kind = %kind,
                    dimension = %dimension,
                    from = %previous.get(dimension),
                    to = %next.get(dimension),
                    "quota_updated"
                );
            }
        }
        Ok(next)
    }

    /// Set the part of an organization's or department's own limit that is
    /// kept back from its children.
    pub fn set_reservation(
        &self,
        actor: &ActorId,
        id: &EntityId,
        update: &QuotaUpdate,
    ) -> Result<Quota> {
        let mut state = self.state.write();
        let node = state.get(id)?;
        if !node.kind.is_allocator() {
            return Err(Error::validation(format!(
                "member '{id}' cannot hold a reservation"
            )));
        }
        let next = update.apply_to(&node.reservation)?;
        for dimension in update.dimensions() {
            let Some(reserved) = next.get(dimension).finite() else {
                return Err(Error::invalid_limit(format!(
                    "{dimension}: a reservation must be finite"
                )));
            };
            state.check_covers_children(node, dimension, node.quota.get(dimension), reserved)?;
        }

        state.get_mut(id)?.reservation = next;
        tracing::info!(actor = %actor, entity = %id, "reservation_updated");
        Ok(next)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The entity's own ceiling. Ancestors are not consulted: the invariant
    /// already held when the ceiling was set.
    pub fn effective_limit(&self, id: &EntityId, dimension: ResourceDimension) -> Result<Limit> {
        Ok(self.state.read().get(id)?.quota.get(dimension))
    }

    pub fn quota(&self, id: &EntityId) -> Result<Quota> {
        Ok(self.state.read().get(id)?.quota)
    }

    /// Dimension → raw limit, `-1` meaning unlimited.
    pub fn quota_limits(&self, id: &EntityId) -> Result<BTreeMap<ResourceDimension, i64>> {
        Ok(self.quota(id)?.to_raw())
    }

    pub fn entity(&self, id: &EntityId) -> Result<EntityNode> {
        self.state.read().get(id).cloned()
    }

    pub fn kind(&self, id: &EntityId) -> Result<EntityKind> {
        Ok(self.state.read().get(id)?.kind)
    }

    /// The entity followed by its ancestors, organization last.
    pub fn ancestors(&self, id: &EntityId) -> Result<Vec<EntityId>> {
        self.state.read().chain(id)
    }

    /// Limit minus reservation minus children; `None` when unlimited.
    pub fn remaining_capacity(
        &self,
        id: &EntityId,
        dimension: ResourceDimension,
    ) -> Result<Option<u64>> {
        let state = self.state.read();
        let node = state.get(id)?;
        let Limit::Finite(cap) = node.quota.get(dimension) else {
            return Ok(None);
        };
        match state.committed(node, dimension, node.reserved(dimension), None) {
            Committed::Finite(used) => Ok(Some(cap.saturating_sub(used))),
            Committed::Unlimited(_) => Ok(Some(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All nodes sorted by id.
    pub fn export(&self) -> Vec<EntityNode> {
        let mut nodes: Vec<EntityNode> = self.state.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Replace the whole tree after validating the invariant everywhere.
    pub(crate) fn replace(&self, nodes: Vec<EntityNode>) -> Result<()> {
        let staged = TreeState::from_nodes(nodes)?;
        *self.state.write() = staged;
        Ok(())
    }
}
