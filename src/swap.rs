//! Identity swap between two records.
//!
//! Document stores do not let a primary identifier change in place, so a
//! swap is delete + insert on both sides. That is only safe inside one
//! transaction: every step below runs through the caller's session and any
//! failure rolls the whole exchange back.
//!
//! The three steps, in order:
//! 1. insert a clone of `record` under a fresh id (`id_old` = its old id),
//!    then delete the original;
//! 2. place the target (existing or freshly seeded) at the freed slot,
//!    stamping `id_old` with whatever id it held before;
//! 3. re-point both records at each other.

use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use crate::backup::BackupLedger;
use crate::db::{AccountFilter, DocumentStore, Retryable, StoreError};
use crate::error::MigrationError;
use crate::plan::{ConsolidatorAction, MigrationPlan, Operation, WriteSet};
use crate::planner::{find_by_email_or_id, resolve_group_key, PlanStamp};
use crate::types::Account;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStep {
    InsertClone,
    DeleteOriginal,
    RemoveTarget,
    PlaceTarget,
    UpdatePointers,
}

impl fmt::Display for SwapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SwapStep::InsertClone => "inserting the re-keyed clone",
            SwapStep::DeleteOriginal => "deleting the original record",
            SwapStep::RemoveTarget => "removing the target from its old slot",
            SwapStep::PlaceTarget => "placing the target record",
            SwapStep::UpdatePointers => "updating forward pointers",
        };
        f.write_str(text)
    }
}

/// The record that ends up at the freed identifier.
#[derive(Debug, Clone)]
pub enum SwapTarget {
    /// Already persisted; re-keyed from its current id.
    Existing(Account),
    /// Not persisted yet; created directly at the slot.
    Fresh(Account),
}

#[derive(Debug, Clone)]
pub struct SwapRequest<'r> {
    /// Identifier the target must end up with. Normally `record.id`.
    pub slot_id: String,
    /// The record giving up `slot_id`.
    pub record: &'r Account,
    pub target: SwapTarget,
    /// Fresh identifier for `record`.
    pub new_id: String,
    pub now: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapOutcome {
    pub target_id: String,
    pub target_previous_id: Option<String>,
    pub moved_id: String,
    pub moved_previous_id: String,
}

pub struct IdentitySwapper<'a, S> {
    store: &'a S,
}

impl<'a, S: DocumentStore> IdentitySwapper<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Run the swap in its own transaction.
    pub fn swap(&self, request: &SwapRequest<'_>) -> Result<SwapOutcome, MigrationError> {
        self.store
            .with_transaction(|tx| Self::swap_in_session(tx, request))
            .map_err(MigrationError::after_retries)
    }

    /// Run the swap inside an already open transaction.
    pub fn swap_in_session(
        store: &S,
        request: &SwapRequest<'_>,
    ) -> Result<SwapOutcome, MigrationError> {
        let record = request.record;
        let old_id = record.id.clone();
        let new_id = request.new_id.clone();

        // 1) Re-key the record: clone under the fresh id, then drop the original.
        let mut clone = record.clone();
        clone.id = new_id.clone();
        stamp_previous_id(&mut clone, &old_id);
        clone.updated_at = Some(request.now.clone());

        store
            .insert_one(&clone)
            .map_err(|e| step_error(SwapStep::InsertClone, clone.group_key.as_deref(), e))?;
        let deleted = store
            .delete_one(&old_id)
            .map_err(|e| step_error(SwapStep::DeleteOriginal, None, e))?;
        if !deleted {
            return Err(MigrationError::IdentitySwapFailed {
                step: SwapStep::DeleteOriginal,
                reason: format!("record {} disappeared before it could be deleted", old_id),
            });
        }
        log::info!("Identity swap: {} re-keyed to {}", old_id, new_id);

        // 2) Put the target into the freed slot.
        let (mut target, target_previous_id) = match &request.target {
            SwapTarget::Existing(existing) => {
                let previous = existing.id.clone();
                if previous != request.slot_id {
                    let removed = store
                        .delete_one(&previous)
                        .map_err(|e| step_error(SwapStep::RemoveTarget, None, e))?;
                    if !removed {
                        return Err(MigrationError::IdentitySwapFailed {
                            step: SwapStep::RemoveTarget,
                            reason: format!("target {} not found", previous),
                        });
                    }
                }
                let mut moved = existing.clone();
                stamp_previous_id(&mut moved, &previous);
                (moved, Some(previous))
            }
            SwapTarget::Fresh(seed) => (seed.clone(), None),
        };
        target.id = request.slot_id.clone();
        target.updated_at = Some(request.now.clone());

        store
            .insert_one(&target)
            .map_err(|e| step_error(SwapStep::PlaceTarget, target.group_key.as_deref(), e))?;
        log::info!(
            "Identity swap: target placed at {} (previously {})",
            target.id,
            target_previous_id.as_deref().unwrap_or("unsaved")
        );

        // 3) Forward pointers on both sides.
        let mut target_writes = WriteSet::new(&target.id, None);
        let owner = json!(new_id);
        BackupLedger::guard_overwrite(&target, "owner_account_id", &owner, &mut target_writes);
        target_writes.set_value("owner_account_id", owner);

        let mut clone_writes = WriteSet::new(&new_id, clone.email.as_deref());
        let pointers = [
            ("consolidated_account_id", json!(target.id)),
            ("owner_account_id", json!(new_id)),
        ];
        for (field, value) in pointers {
            BackupLedger::guard_overwrite(&clone, field, &value, &mut clone_writes);
            clone_writes.set_value(field, value);
        }
        clone_writes.set_value("updated_at", Value::String(request.now.clone()));

        for writes in [&target_writes, &clone_writes] {
            let matched = store
                .update_one(writes)
                .map_err(|e| step_error(SwapStep::UpdatePointers, None, e))?;
            if !matched {
                return Err(MigrationError::IdentitySwapFailed {
                    step: SwapStep::UpdatePointers,
                    reason: format!("record {} vanished mid-swap", writes.target_id),
                });
            }
        }

        Ok(SwapOutcome {
            target_id: target.id,
            target_previous_id,
            moved_id: new_id,
            moved_previous_id: old_id,
        })
    }
}

/// Record `previous` as the backward pointer, keeping any older pointer in
/// the backup ledger so no identifier is lost across repeated swaps.
fn stamp_previous_id(account: &mut Account, previous: &str) {
    if let Some(older) = account.id_old.take() {
        if older != previous {
            account
                .backups
                .entry("id_old".to_string())
                .or_insert(Value::String(older));
        }
    }
    account.id_old = Some(previous.to_string());
}

fn step_error(step: SwapStep, group: Option<&str>, err: StoreError) -> MigrationError {
    match err {
        e if e.is_retryable() => MigrationError::Store(e),
        StoreError::Duplicate { ref index, .. } if index.contains("group_key") => {
            MigrationError::ConsolidatedAccountConflict(group.unwrap_or("unknown").to_string())
        }
        other => MigrationError::IdentitySwapFailed {
            step,
            reason: other.to_string(),
        },
    }
}

#[derive(Debug, Clone)]
pub struct SwapIdsRequest {
    pub group_key: Option<String>,
    pub admin: String,
    pub dry_run: bool,
}

/// Plan handing the administrator's identifier to an existing consolidated
/// account. Members are re-pointed at the new identifiers in the same plan.
/// Returns `None` when the consolidated account already holds the
/// administrator's current or previous identifier.
pub fn plan_identity_swap<S: DocumentStore>(
    store: &S,
    request: &SwapIdsRequest,
    stamp: &PlanStamp,
) -> Result<Option<MigrationPlan>, MigrationError> {
    let admin = find_by_email_or_id(store, &request.admin)?
        .ok_or_else(|| MigrationError::AdminNotFound(request.admin.clone()))?;
    let group_key = resolve_group_key(
        request.group_key.as_deref(),
        admin.email.as_deref(),
        &[],
    )?;
    let consolidator = store
        .find_one(&AccountFilter::ConsolidatorFor(group_key.clone()))?
        .ok_or_else(|| MigrationError::ConsolidatedAccountNotFound(group_key.clone()))?;

    let already_swapped = consolidator.id == admin.id
        || admin.id_old.as_deref() == Some(consolidator.id.as_str());
    if already_swapped {
        log::info!("Consolidated account for {} already holds identifier {}", group_key, consolidator.id);
        return Ok(None);
    }

    let timestamp = stamp.timestamp();
    let slot = json!(admin.id);
    let owner = json!(stamp.owner_new_id);
    let mut member_writes = Vec::new();
    for member in store.find(&AccountFilter::MembersOf(group_key.clone()))? {
        if member.id == admin.id {
            continue;
        }
        let mut writes = WriteSet::new(&member.id, member.email.as_deref());
        for (field, value) in [("consolidated_account_id", &slot), ("owner_account_id", &owner)] {
            if member.field(field).as_ref() == Some(value) {
                continue;
            }
            BackupLedger::guard_overwrite(&member, field, value, &mut writes);
            writes.set_value(field, value.clone());
        }
        if !writes.is_empty() {
            writes.set_value("updated_at", json!(timestamp));
            member_writes.push(writes);
        }
    }

    Ok(Some(MigrationPlan {
        operation: Operation::SwapIds,
        group_key,
        dry_run: request.dry_run,
        generated_at: timestamp,
        owner_account_id: stamp.owner_new_id.clone(),
        consolidator: ConsolidatorAction::SwapExisting {
            current_id: consolidator.id.clone(),
            owner_old_id: admin.id.clone(),
            owner_new_id: stamp.owner_new_id.clone(),
        },
        consolidator_writes: None,
        member_writes,
        missing_members: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{seed, test_store, FailPoint, FailingStore};
    use crate::db::AccountFilter;
    use crate::types::{AccountKind, Role};

    fn admin() -> Account {
        let mut account = Account::new("admin-1").with_email("ana@acme.com");
        account.role = Some(Role::Owner);
        account.fields.insert("google_id".to_string(), json!("g-1"));
        account
    }

    fn consolidator_seed(group: &str) -> Account {
        let mut account = Account::new("pending");
        account.kind = AccountKind::Consolidator;
        account.group_key = Some(group.to_string());
        account
    }

    fn get<S: DocumentStore>(store: &S, id: &str) -> Option<Account> {
        store.find_one(&AccountFilter::Id(id.to_string())).expect("query")
    }

    #[test]
    fn test_swap_with_fresh_target() {
        let store = test_store();
        let admin = admin();
        seed(&store, &[admin.clone()]);

        let request = SwapRequest {
            slot_id: admin.id.clone(),
            record: &admin,
            target: SwapTarget::Fresh(consolidator_seed("acme.com")),
            new_id: "admin-2".to_string(),
            now: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let outcome = IdentitySwapper::new(&store).swap(&request).expect("swap");
        assert_eq!(outcome.target_id, "admin-1");
        assert_eq!(outcome.target_previous_id, None);

        let consolidator = get(&store, "admin-1").expect("consolidator at old admin id");
        assert_eq!(consolidator.kind, AccountKind::Consolidator);
        assert_eq!(consolidator.owner_account_id.as_deref(), Some("admin-2"));
        assert_eq!(consolidator.id_old, None);

        let moved = get(&store, "admin-2").expect("admin at new id");
        assert_eq!(moved.id_old.as_deref(), Some("admin-1"));
        assert_eq!(moved.email.as_deref(), Some("ana@acme.com"));
        assert_eq!(moved.fields.get("google_id"), Some(&json!("g-1")));
        assert_eq!(moved.consolidated_account_id.as_deref(), Some("admin-1"));
        assert_eq!(moved.owner_account_id.as_deref(), Some("admin-2"));
    }

    #[test]
    fn test_swap_with_existing_target_keeps_both_old_ids() {
        let store = test_store();
        let mut admin = admin();
        admin.kind = AccountKind::Member;
        admin.group_key = Some("acme.com".to_string());
        admin.consolidated_account_id = Some("cons-1".to_string());
        let mut existing = consolidator_seed("acme.com");
        existing.id = "cons-1".to_string();
        existing.owner_account_id = Some("admin-1".to_string());
        seed(&store, &[admin.clone(), existing.clone()]);

        let request = SwapRequest {
            slot_id: admin.id.clone(),
            record: &admin,
            target: SwapTarget::Existing(existing),
            new_id: "admin-2".to_string(),
            now: "2026-01-01T00:00:00+00:00".to_string(),
        };
        IdentitySwapper::new(&store).swap(&request).expect("swap");

        assert!(get(&store, "cons-1").is_none());
        let consolidator = get(&store, "admin-1").expect("moved consolidator");
        assert_eq!(consolidator.id_old.as_deref(), Some("cons-1"));
        assert_eq!(consolidator.owner_account_id.as_deref(), Some("admin-2"));
        assert_eq!(consolidator.backups["owner_account_id"], json!("admin-1"));

        let moved = get(&store, "admin-2").expect("moved admin");
        assert_eq!(moved.consolidated_account_id.as_deref(), Some("admin-1"));
        assert_eq!(moved.backups["consolidated_account_id"], json!("cons-1"));
    }

    #[test]
    fn test_failure_after_clone_insert_rolls_back() {
        let store = FailingStore::new(test_store(), FailPoint::Delete(1));
        let admin = admin();
        seed(&store.inner, &[admin.clone()]);

        let request = SwapRequest {
            slot_id: admin.id.clone(),
            record: &admin,
            target: SwapTarget::Fresh(consolidator_seed("acme.com")),
            new_id: "admin-2".to_string(),
            now: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let err = IdentitySwapper::new(&store)
            .swap(&request)
            .expect_err("injected failure");
        assert!(matches!(
            err,
            MigrationError::IdentitySwapFailed { step: SwapStep::DeleteOriginal, .. }
        ));

        let original = get(&store, "admin-1").expect("original still present");
        assert_eq!(original.kind, AccountKind::Individual);
        assert!(get(&store, "admin-2").is_none(), "clone must be rolled back");
        assert_eq!(store.inner.dump_documents().expect("dump").len(), 1);
    }

    #[test]
    fn test_swap_into_taken_group_is_a_conflict() {
        let store = test_store();
        let admin = admin();
        let mut other = consolidator_seed("acme.com");
        other.id = "cons-9".to_string();
        seed(&store, &[admin.clone(), other]);

        let request = SwapRequest {
            slot_id: admin.id.clone(),
            record: &admin,
            target: SwapTarget::Fresh(consolidator_seed("acme.com")),
            new_id: "admin-2".to_string(),
            now: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let err = IdentitySwapper::new(&store).swap(&request).expect_err("conflict");
        assert!(matches!(err, MigrationError::ConsolidatedAccountConflict(ref g) if g == "acme.com"));
        assert!(get(&store, "admin-1").is_some());
        assert!(get(&store, "admin-2").is_none());
    }

    #[test]
    fn test_repeated_swap_preserves_older_backward_pointer() {
        let mut account = Account::new("b");
        account.id_old = Some("a".to_string());
        stamp_previous_id(&mut account, "b");
        assert_eq!(account.id_old.as_deref(), Some("b"));
        assert_eq!(account.backups["id_old"], json!("a"));
    }

    #[test]
    fn test_swap_ids_plan_moves_group_onto_admin_identifier() {
        use crate::executor::MigrationExecutor;
        use chrono::{DateTime, Utc};

        let store = test_store();
        let mut admin = admin();
        admin.kind = AccountKind::Member;
        admin.group_key = Some("acme.com".to_string());
        admin.consolidated_account_id = Some("cons-1".to_string());
        admin.owner_account_id = Some("admin-1".to_string());
        let mut bob = Account::new("bob").with_email("bob@acme.com");
        bob.kind = AccountKind::Member;
        bob.group_key = Some("acme.com".to_string());
        bob.consolidated_account_id = Some("cons-1".to_string());
        bob.owner_account_id = Some("admin-1".to_string());
        let mut existing = consolidator_seed("acme.com");
        existing.id = "cons-1".to_string();
        existing.owner_account_id = Some("admin-1".to_string());
        seed(&store, &[admin, bob, existing]);

        let stamp = PlanStamp {
            now: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            consolidator_id: "unused".to_string(),
            owner_new_id: "admin-2".to_string(),
        };
        let request = SwapIdsRequest {
            group_key: None,
            admin: "ana@acme.com".to_string(),
            dry_run: false,
        };
        let plan = plan_identity_swap(&store, &request, &stamp)
            .expect("plan")
            .expect("swap needed");
        assert_eq!(plan.member_writes.len(), 1);
        MigrationExecutor::new(&store).execute(&plan).expect("apply");

        let consolidator = get(&store, "admin-1").expect("consolidator at admin id");
        assert_eq!(consolidator.kind, AccountKind::Consolidator);
        assert_eq!(consolidator.id_old.as_deref(), Some("cons-1"));
        let bob = get(&store, "bob").expect("bob");
        assert_eq!(bob.consolidated_account_id.as_deref(), Some("admin-1"));
        assert_eq!(bob.owner_account_id.as_deref(), Some("admin-2"));
        assert_eq!(bob.backups["consolidated_account_id"], json!("cons-1"));
        let moved = get(&store, "admin-2").expect("admin");
        assert_eq!(moved.consolidated_account_id.as_deref(), Some("admin-1"));

        // Once the identifiers match, swapping again is a no-op.
        assert!(plan_identity_swap(&store, &request, &stamp).expect("plan").is_none());
    }
}
