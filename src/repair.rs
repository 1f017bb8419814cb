//! Member pointer repair.
//!
//! After an identity swap, or a partial manual fix, members can be left
//! pointing at an identifier the consolidated account no longer holds. This
//! plans writes that re-point every member of the group at the current
//! consolidated account and owner.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::backup::BackupLedger;
use crate::db::{AccountFilter, DocumentStore};
use crate::error::MigrationError;
use crate::plan::{ConsolidatorAction, MigrationPlan, Operation, WriteSet};
use crate::planner::{find_by_email_or_id, resolve_group_key};

#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub group_key: Option<String>,
    pub admin: Option<String>,
    pub dry_run: bool,
}

pub fn plan_repair<S: DocumentStore>(
    store: &S,
    request: &RepairRequest,
    now: DateTime<Utc>,
) -> Result<MigrationPlan, MigrationError> {
    let group_key = resolve_group_key(request.group_key.as_deref(), request.admin.as_deref(), &[])?;
    let consolidator = store
        .find_one(&AccountFilter::ConsolidatorFor(group_key.clone()))?
        .ok_or_else(|| MigrationError::ConsolidatedAccountNotFound(group_key.clone()))?;

    let owner_id = match consolidator.owner_account_id.clone() {
        Some(id) => id,
        None => {
            let admin = request.admin.as_deref().ok_or_else(|| {
                MigrationError::AdminNotFound(format!("owner of {}", consolidator.id))
            })?;
            find_by_email_or_id(store, admin)?
                .ok_or_else(|| MigrationError::AdminNotFound(admin.to_string()))?
                .id
        }
    };

    let timestamp = now.to_rfc3339();
    let members = store.find(&AccountFilter::MembersOf(group_key.clone()))?;
    let mut member_writes = Vec::new();
    for member in &members {
        let mut writes = WriteSet::new(&member.id, member.email.as_deref());
        let pointers = [
            ("consolidated_account_id", json!(consolidator.id)),
            ("owner_account_id", json!(owner_id)),
        ];
        for (field, value) in pointers {
            if member.field(field).as_ref() == Some(&value) {
                continue;
            }
            BackupLedger::guard_overwrite(member, field, &value, &mut writes);
            writes.set_value(field, value);
        }
        if writes.is_empty() {
            continue;
        }
        writes.set_value("updated_at", json!(timestamp));
        member_writes.push(writes);
    }

    log::info!(
        "Repair of {}: {} of {} member(s) need new pointers",
        group_key,
        member_writes.len(),
        members.len()
    );

    Ok(MigrationPlan {
        operation: Operation::RepairMembers,
        group_key,
        dry_run: request.dry_run,
        generated_at: timestamp,
        owner_account_id: owner_id,
        consolidator: ConsolidatorAction::Existing {
            id: consolidator.id.clone(),
        },
        consolidator_writes: None,
        member_writes,
        missing_members: Vec::new(),
    })
}
