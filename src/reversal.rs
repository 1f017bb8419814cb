//! Reversal: dissolve a consolidated group back into individual accounts.
//!
//! The owner gets its pre-consolidation values back from its backups. Fields
//! with no backup inherit the consolidated account's value so nothing the
//! group accumulated is lost. The consolidated account is deleted and every
//! member is demoted to an individual account. The result is an ordinary
//! [`MigrationPlan`] applied by the executor in one transaction.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::backup::BackupLedger;
use crate::db::{AccountFilter, DocumentStore};
use crate::error::MigrationError;
use crate::merge::{is_empty, shallow_merge, FieldKind, PLAN_FIELDS, PORTABLE_FIELDS};
use crate::plan::{ConsolidatorAction, MigrationPlan, Operation, WriteSet};
use crate::planner::{find_by_email_or_id, resolve_group_key};
use crate::types::{Account, AccountKind};

/// Membership attributes cleared on demotion.
const MEMBERSHIP_FIELDS: &[&str] = &[
    "group_key",
    "role",
    "consolidated_account_id",
    "owner_account_id",
];

#[derive(Debug, Clone)]
pub struct ReversalRequest {
    pub group_key: Option<String>,
    /// Fallback owner lookup when the consolidated account has no owner pointer.
    pub admin: Option<String>,
    pub dry_run: bool,
}

pub struct ReversalPlanner<'a, S> {
    store: &'a S,
}

impl<'a, S: DocumentStore> ReversalPlanner<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn plan(
        &self,
        request: &ReversalRequest,
        now: DateTime<Utc>,
    ) -> Result<MigrationPlan, MigrationError> {
        let group_key = resolve_group_key(request.group_key.as_deref(), request.admin.as_deref(), &[])?;
        let consolidator = self
            .store
            .find_one(&AccountFilter::ConsolidatorFor(group_key.clone()))?
            .ok_or_else(|| MigrationError::ConsolidatedAccountNotFound(group_key.clone()))?;

        let owner = self.resolve_owner(&consolidator, request.admin.as_deref())?;
        let timestamp = now.to_rfc3339();

        let mut owner_writes = WriteSet::new(&owner.id, owner.email.as_deref());
        restore_owner_fields(&owner, &consolidator, &mut owner_writes);
        demote(&owner, &mut owner_writes, &timestamp);

        let mut member_writes = vec![owner_writes];
        for member in self.store.find(&AccountFilter::MembersOf(group_key.clone()))? {
            if member.id == owner.id {
                continue;
            }
            let mut writes = WriteSet::new(&member.id, member.email.as_deref());
            restore_from_backups(&member, &mut writes);
            demote(&member, &mut writes, &timestamp);
            member_writes.push(writes);
        }

        log::info!(
            "Reversal of {} planned: owner {}, {} other member(s)",
            group_key,
            owner.email.as_deref().unwrap_or(&owner.id),
            member_writes.len() - 1
        );

        Ok(MigrationPlan {
            operation: Operation::Revert,
            group_key,
            dry_run: request.dry_run,
            generated_at: timestamp,
            owner_account_id: owner.id.clone(),
            consolidator: ConsolidatorAction::Delete {
                id: consolidator.id.clone(),
            },
            consolidator_writes: None,
            member_writes,
            missing_members: Vec::new(),
        })
    }

    fn resolve_owner(
        &self,
        consolidator: &Account,
        admin: Option<&str>,
    ) -> Result<Account, MigrationError> {
        if let Some(owner_id) = consolidator.owner_account_id.as_deref() {
            if let Some(owner) = self.store.find_one(&AccountFilter::Id(owner_id.to_string()))? {
                return Ok(owner);
            }
            log::warn!("Owner pointer {} is dangling; falling back to administrator", owner_id);
        }
        let admin = admin.ok_or_else(|| {
            MigrationError::AdminNotFound(
                consolidator
                    .owner_account_id
                    .clone()
                    .unwrap_or_else(|| "unset".to_string()),
            )
        })?;
        find_by_email_or_id(self.store, admin)?
            .ok_or_else(|| MigrationError::AdminNotFound(admin.to_string()))
    }
}

/// Portable and plan fields for the owner: backup first, then the
/// consolidated account's value. Maps are merged with the owner's current
/// keys winning.
fn restore_owner_fields(owner: &Account, consolidator: &Account, writes: &mut WriteSet) {
    let portable = PORTABLE_FIELDS
        .iter()
        .filter(|(field, _)| *field != "user_folders")
        .map(|&(field, kind)| (field, Some(kind)));
    let plan = PLAN_FIELDS.iter().map(|&field| (field, None));

    for (field, kind) in portable.chain(plan) {
        if restore_backup(owner, field, writes) {
            continue;
        }
        let Some(value) = consolidator.fields.get(field).filter(|v| !is_empty(Some(*v))) else {
            continue;
        };
        let next = match kind {
            Some(FieldKind::ShallowMergeMap) => {
                Value::Object(shallow_merge(Some(value), owner.fields.get(field)))
            }
            _ => value.clone(),
        };
        if owner.fields.get(field) == Some(&next) {
            continue;
        }
        BackupLedger::guard(owner, field, writes);
        writes.set_value(field, next);
    }

    // Shared folders become the owner's personal folders.
    if !restore_backup(owner, "user_folders", writes) {
        let folders = ["shared_folders", "user_folders"]
            .into_iter()
            .filter_map(|f| consolidator.fields.get(f))
            .find(|v| !is_empty(Some(*v)));
        if let Some(folders) = folders {
            BackupLedger::guard(owner, "user_folders", writes);
            writes.set_value("user_folders", folders.clone());
        }
    }
}

fn restore_from_backups(member: &Account, writes: &mut WriteSet) {
    for &(field, _) in PORTABLE_FIELDS {
        restore_backup(member, field, writes);
    }
    for &field in PLAN_FIELDS {
        restore_backup(member, field, writes);
    }
}

/// Put the backed-up value of `field` back. Returns whether a backup exists.
fn restore_backup(record: &Account, field: &str, writes: &mut WriteSet) -> bool {
    let Some(saved) = record.backups.get(field) else {
        return false;
    };
    if record.fields.get(field) != Some(saved) {
        writes.set_value(field, saved.clone());
    }
    true
}

fn demote(member: &Account, writes: &mut WriteSet, timestamp: &str) {
    let individual = json!(AccountKind::Individual);
    BackupLedger::guard_overwrite(member, "kind", &individual, writes);
    writes.set_value("kind", individual);
    for &field in MEMBERSHIP_FIELDS {
        if member.has_field(field) {
            BackupLedger::guard(member, field, writes);
            writes.unset_field(field);
        }
    }
    writes.set_value("updated_at", json!(timestamp));
}
