//! Allocation service handler: entity lifecycle, quota mutation, capacity queries.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::AllocationChange;
use crate::ipc::dispatch::{
    actor_field, dimension_field, entity_field, single, typed_field, unknown_method,
    DispatchContext, DispatchResponse,
};
use crate::quota::QuotaUpdate;
use crate::types::{EntityId, Result};

pub async fn handle(ctx: &DispatchContext, method: &str, body: Value) -> Result<DispatchResponse> {
    let engine = &ctx.engine;
    match method {
        "CreateOrganization" => {
            let actor = actor_field(&body)?;
            let id = entity_field(&body, "entity")?;
            let quota = optional_quota(&body)?;
            single(&engine.create_organization(&actor, &id, &quota)?)
        }

        "CreateDepartment" => {
            let actor = actor_field(&body)?;
            let id = entity_field(&body, "entity")?;
            let parent = entity_field(&body, "organization")?;
            single(&engine.create_department(&actor, &id, &parent)?)
        }

        "CreateMember" => {
            let actor = actor_field(&body)?;
            let id = entity_field(&body, "entity")?;
            let parent = entity_field(&body, "department")?;
            single(&engine.create_member(&actor, &id, &parent)?)
        }

        "RemoveMember" => {
            let actor = actor_field(&body)?;
            single(&engine.remove_member(&actor, &entity_field(&body, "entity")?)?)
        }

        "RemoveDepartment" => {
            let actor = actor_field(&body)?;
            single(&engine.remove_department(&actor, &entity_field(&body, "entity")?)?)
        }

        "RemoveOrganization" => {
            let actor = actor_field(&body)?;
            single(&engine.remove_organization(&actor, &entity_field(&body, "entity")?)?)
        }

        "SetOrganizationQuota" | "SetDepartmentQuota" | "SetMemberQuota" | "SetReservation" => {
            let actor = actor_field(&body)?;
            let id = entity_field(&body, "entity")?;
            let update: QuotaUpdate = typed_field(&body, "quota")?;
            let result = match method {
                "SetOrganizationQuota" => engine.set_organization_quota(&actor, &id, &update)?,
                "SetDepartmentQuota" => engine.set_department_quota(&actor, &id, &update)?,
                "SetMemberQuota" => engine.set_member_quota(&actor, &id, &update)?,
                _ => engine.set_reservation(&actor, &id, &update)?,
            };
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "quota": result.to_raw(),
            })))
        }

        "GetQuotaLimits" => {
            let id = entity_field(&body, "entity")?;
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "limits": engine.quota_limits(&id)?,
            })))
        }

        "GetEffectiveLimit" => {
            let id = entity_field(&body, "entity")?;
            let dimension = dimension_field(&body)?;
            let limit = engine.get_effective_limit(&id, dimension)?;
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "dimension": dimension,
                "limit": limit,
            })))
        }

        "GetEntity" => single(&engine.entity(&entity_field(&body, "entity")?)?),

        "GetRemainingCapacity" => {
            let id = entity_field(&body, "entity")?;
            let dimension = dimension_field(&body)?;
            let remaining = engine.remaining_capacity(&id, dimension)?;
            Ok(DispatchResponse::Single(json!({
                "entity": id,
                "dimension": dimension,
                "remaining": remaining,
                "unlimited": remaining.is_none(),
            })))
        }

        "BulkReallocate" => {
            let actor = actor_field(&body)?;
            let changes: Vec<ChangeBody> = typed_field(&body, "changes")?;
            let changes: Vec<AllocationChange> = changes
                .into_iter()
                .map(|c| AllocationChange::new(c.entity, c.quota))
                .collect();
            // Shutdown abandons a batch that has not committed yet.
            single(&engine.bulk_reallocate(&actor, &changes, &ctx.shutdown)?)
        }

        _ => Err(unknown_method("allocation", method)),
    }
}

#[derive(Debug, Deserialize)]
struct ChangeBody {
    entity: EntityId,
    quota: QuotaUpdate,
}

fn optional_quota(body: &Value) -> Result<QuotaUpdate> {
    match body.get("quota") {
        Some(Value::Null) | None => Ok(QuotaUpdate::new()),
        Some(_) => typed_field(body, "quota"),
    }
}
