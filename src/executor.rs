//! Plan execution.
//!
//! A live run applies the whole plan inside one store transaction: the
//! consolidated-account action first (insert, identity swap or delete), then
//! its write-set, then member write-sets in plan order. Any error rolls the
//! transaction back and the store is left exactly as planned against.
//!
//! Dry runs never open a transaction and never write.

use serde::Serialize;

use crate::db::{AccountFilter, DocumentStore, StoreError};
use crate::error::MigrationError;
use crate::plan::{ConsolidatorAction, MigrationPlan, Operation, WriteSet};
use crate::swap::{IdentitySwapper, SwapOutcome, SwapRequest, SwapTarget};

/// Lifecycle of one plan.
///
/// `Planned -> DryRun` for dry runs, `Planned -> Applying -> Applied` on
/// success, `Planned -> Applying -> Failed` when the transaction rolls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Planned,
    Applying,
    Applied,
    Failed,
    DryRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub state: ExecutionState,
    pub operation: Operation,
    pub group_key: String,
    pub consolidator_id: String,
    pub owner_account_id: String,
    /// Record-level writes issued. Zero for dry runs.
    pub writes_applied: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<SwapOutcome>,
}

impl ExecutionReport {
    /// One-line summary for the CLI.
    pub fn summary(&self) -> String {
        match self.state {
            ExecutionState::DryRun => format!(
                "DRY RUN {:?} for {}: no changes written",
                self.operation, self.group_key
            ),
            _ => format!(
                "{:?} for {} applied: {} write(s), consolidated account {}",
                self.operation, self.group_key, self.writes_applied, self.consolidator_id
            ),
        }
    }
}

pub struct MigrationExecutor<'a, S> {
    store: &'a S,
    state: ExecutionState,
}

impl<'a, S: DocumentStore> MigrationExecutor<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            state: ExecutionState::Planned,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    fn transition(&mut self, next: ExecutionState) {
        log::info!("Execution state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn execute(&mut self, plan: &MigrationPlan) -> Result<ExecutionReport, MigrationError> {
        if plan.dry_run {
            self.transition(ExecutionState::DryRun);
            log::info!(
                "DRY RUN: {} write(s) planned for {}\n{}",
                plan.write_count(),
                plan.group_key,
                plan.to_pretty_json()
            );
            return Ok(self.report(plan, 0, None));
        }

        if plan.operation == Operation::Consolidate {
            self.store.ensure_consolidator_index()?;
        }

        self.transition(ExecutionState::Applying);
        let result = self
            .store
            .with_transaction(|tx| Self::apply_in_session(tx, plan));

        match result {
            Ok((applied, swap)) => {
                self.transition(ExecutionState::Applied);
                log::info!(
                    "{:?} for {} committed ({} write(s))",
                    plan.operation,
                    plan.group_key,
                    applied
                );
                Ok(self.report(plan, applied, swap))
            }
            Err(e) => {
                self.transition(ExecutionState::Failed);
                log::error!(
                    "{:?} for {} rolled back: {}",
                    plan.operation,
                    plan.group_key,
                    e
                );
                Err(e.after_retries())
            }
        }
    }

    fn report(
        &self,
        plan: &MigrationPlan,
        writes_applied: usize,
        swap: Option<SwapOutcome>,
    ) -> ExecutionReport {
        ExecutionReport {
            state: self.state,
            operation: plan.operation,
            group_key: plan.group_key.clone(),
            consolidator_id: plan.consolidator_id().to_string(),
            owner_account_id: plan.owner_account_id.clone(),
            writes_applied,
            swap,
        }
    }

    fn apply_in_session(
        store: &S,
        plan: &MigrationPlan,
    ) -> Result<(usize, Option<SwapOutcome>), MigrationError> {
        let mut applied = 0;
        let mut swap = None;

        match &plan.consolidator {
            ConsolidatorAction::Existing { id } => {
                if store.find_one(&AccountFilter::Id(id.clone()))?.is_none() {
                    return Err(MigrationError::TransactionAborted(format!(
                        "consolidated account {} no longer exists",
                        id
                    )));
                }
            }
            ConsolidatorAction::Create { account } => {
                store
                    .insert_one(account)
                    .map_err(|e| conflict_or_store(e, &plan.group_key))?;
                log::info!("Created consolidated account {} for {}", account.id, plan.group_key);
                applied += 1;
            }
            ConsolidatorAction::SwapWithOwner {
                owner_old_id,
                owner_new_id,
                account,
            } => {
                let target = SwapTarget::Fresh(account.clone());
                swap = Some(swap_owner(store, plan, owner_old_id, owner_new_id, target)?);
                applied += 5;
            }
            ConsolidatorAction::SwapExisting {
                current_id,
                owner_old_id,
                owner_new_id,
            } => {
                let existing = store
                    .find_one(&AccountFilter::Id(current_id.clone()))?
                    .ok_or_else(|| {
                        MigrationError::TransactionAborted(format!(
                            "consolidated account {} no longer exists",
                            current_id
                        ))
                    })?;
                let target = SwapTarget::Existing(existing);
                swap = Some(swap_owner(store, plan, owner_old_id, owner_new_id, target)?);
                applied += 6;
            }
            ConsolidatorAction::Delete { id } => {
                if !store.delete_one(id)? {
                    return Err(MigrationError::ConsolidatedAccountNotFound(
                        plan.group_key.clone(),
                    ));
                }
                log::info!("Deleted consolidated account {} for {}", id, plan.group_key);
                applied += 1;
            }
        }

        if let Some(writes) = plan.consolidator_writes.as_ref().filter(|w| !w.is_empty()) {
            apply_writes(store, writes)?;
            applied += 1;
        }

        for writes in plan.member_writes.iter().filter(|w| !w.is_empty()) {
            apply_writes(store, writes)?;
            log::info!("Updated {}", writes.label());
            applied += 1;
        }

        Ok((applied, swap))
    }
}

fn swap_owner<S: DocumentStore>(
    store: &S,
    plan: &MigrationPlan,
    owner_old_id: &str,
    owner_new_id: &str,
    target: SwapTarget,
) -> Result<SwapOutcome, MigrationError> {
    let owner = store
        .find_one(&AccountFilter::Id(owner_old_id.to_string()))?
        .ok_or_else(|| {
            MigrationError::TransactionAborted(format!(
                "owner {} changed since planning",
                owner_old_id
            ))
        })?;
    let request = SwapRequest {
        slot_id: owner_old_id.to_string(),
        record: &owner,
        target,
        new_id: owner_new_id.to_string(),
        now: plan.generated_at.clone(),
    };
    IdentitySwapper::swap_in_session(store, &request)
}

fn apply_writes<S: DocumentStore>(store: &S, writes: &WriteSet) -> Result<(), MigrationError> {
    if store.update_one(writes)? {
        Ok(())
    } else {
        Err(MigrationError::TransactionAborted(format!(
            "record {} not found",
            writes.label()
        )))
    }
}

/// A second consolidator for the group surfaces as a conflict; everything
/// else stays a store error.
fn conflict_or_store(err: StoreError, group_key: &str) -> MigrationError {
    match err {
        StoreError::Duplicate { ref index, .. } if index.contains("group_key") => {
            MigrationError::ConsolidatedAccountConflict(group_key.to_string())
        }
        other => MigrationError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanSettings;
    use crate::db::test_utils::{seed, test_store, FailPoint, FailingStore};
    use crate::planner::{ConsolidationPlanner, ConsolidationRequest, MemberSelector, PlanStamp};
    use crate::types::{Account, AccountKind, Role};
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn stamp(suffix: &str) -> PlanStamp {
        PlanStamp {
            now: DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            consolidator_id: format!("cons-{suffix}"),
            owner_new_id: format!("admin-{suffix}"),
        }
    }

    fn request(dry_run: bool, use_admin_identifier: bool) -> ConsolidationRequest {
        ConsolidationRequest {
            group_key: Some("g".to_string()),
            admin: "a@x.com".to_string(),
            members: MemberSelector::Explicit(vec!["a@x.com".into(), "b@x.com".into()]),
            default_role: Role::Viewer,
            use_admin_identifier,
            dry_run,
            legacy_member_emails: vec![],
            plan: PlanSettings::default(),
        }
    }

    fn fixture() -> Vec<Account> {
        vec![
            Account::new("A")
                .with_email("a@x.com")
                .with_field("tags", json!(["x"])),
            Account::new("B")
                .with_email("b@x.com")
                .with_field("tags", json!(["y"])),
        ]
    }

    fn get<S: DocumentStore>(store: &S, id: &str) -> Account {
        store
            .find_one(&AccountFilter::Id(id.to_string()))
            .expect("query")
            .unwrap_or_else(|| panic!("record {id} missing"))
    }

    fn run<S: DocumentStore>(
        store: &S,
        req: &ConsolidationRequest,
        stamp: &PlanStamp,
    ) -> Result<ExecutionReport, MigrationError> {
        let plan = ConsolidationPlanner::new(store).plan(req, stamp)?;
        MigrationExecutor::new(store).execute(&plan)
    }

    #[test]
    fn test_consolidates_two_accounts() {
        let store = test_store();
        seed(&store, &fixture());

        let report = run(&store, &request(false, false), &stamp("1")).expect("run");
        assert_eq!(report.state, ExecutionState::Applied);
        assert_eq!(report.writes_applied, 4);

        let consolidator = get(&store, "cons-1");
        assert_eq!(consolidator.kind, AccountKind::Consolidator);
        assert_eq!(consolidator.group_key.as_deref(), Some("g"));
        assert_eq!(consolidator.fields["tags"], json!(["x", "y"]));
        assert_eq!(consolidator.fields["subscription_tier"], json!("plan4"));

        let a = get(&store, "A");
        assert!(!a.has_field("tags"));
        assert_eq!(a.backups["tags"], json!(["x"]));
        assert_eq!(a.role, Some(Role::Owner));
        assert_eq!(a.kind, AccountKind::Member);
        assert_eq!(a.consolidated_account_id.as_deref(), Some("cons-1"));

        let b = get(&store, "B");
        assert_eq!(b.backups["tags"], json!(["y"]));
        assert_eq!(b.role, Some(Role::Viewer));
        assert_eq!(b.owner_account_id.as_deref(), Some("A"));
    }

    #[test]
    fn test_dry_run_writes_nothing_and_matches_live_plan() {
        let store = test_store();
        seed(&store, &fixture());
        let before = store.dump_documents().expect("dump");

        let stamp = stamp("1");
        let dry_plan = ConsolidationPlanner::new(&store)
            .plan(&request(true, true), &stamp)
            .expect("plan");
        let mut executor = MigrationExecutor::new(&store);
        let report = executor.execute(&dry_plan).expect("dry run");
        assert_eq!(executor.state(), ExecutionState::DryRun);
        assert_eq!(report.writes_applied, 0);
        assert_eq!(store.dump_documents().expect("dump"), before);

        let live_plan = ConsolidationPlanner::new(&store)
            .plan(&request(false, true), &stamp)
            .expect("plan");
        let mut dry_plan = dry_plan;
        dry_plan.dry_run = false;
        assert_eq!(
            serde_json::to_string(&dry_plan).expect("json"),
            serde_json::to_string(&live_plan).expect("json")
        );
    }

    #[test]
    fn test_second_run_keeps_first_backups() {
        let store = test_store();
        seed(&store, &fixture());
        run(&store, &request(false, false), &stamp("1")).expect("first run");

        // Someone gives B new tags between runs.
        let mut writes = WriteSet::new("B", None);
        writes.set_value("tags", json!(["z"]));
        store.update_one(&writes).expect("update");

        let report = run(&store, &request(false, false), &stamp("2")).expect("second run");
        assert_eq!(report.consolidator_id, "cons-1", "existing consolidator reused");
        assert!(store
            .find_one(&AccountFilter::Id("cons-2".to_string()))
            .expect("query")
            .is_none());

        let b = get(&store, "B");
        assert_eq!(b.backups["tags"], json!(["y"]), "first backup survives");
        assert!(!b.has_field("tags"));
    }

    #[test]
    fn test_swap_run_moves_admin_and_places_consolidator() {
        let store = test_store();
        seed(&store, &fixture());

        let report = run(&store, &request(false, true), &stamp("1")).expect("run");
        let swap = report.swap.expect("swap outcome");
        assert_eq!(swap.target_id, "A");
        assert_eq!(swap.moved_id, "admin-1");

        let consolidator = get(&store, "A");
        assert_eq!(consolidator.kind, AccountKind::Consolidator);
        assert_eq!(consolidator.owner_account_id.as_deref(), Some("admin-1"));
        assert_eq!(consolidator.fields["tags"], json!(["x", "y"]));

        let admin = get(&store, "admin-1");
        assert_eq!(admin.id_old.as_deref(), Some("A"));
        assert_eq!(admin.kind, AccountKind::Member);
        assert_eq!(admin.role, Some(Role::Owner));
        assert_eq!(admin.backups["tags"], json!(["x"]));
        assert_eq!(admin.consolidated_account_id.as_deref(), Some("A"));

        let b = get(&store, "B");
        assert_eq!(b.consolidated_account_id.as_deref(), Some("A"));
        assert_eq!(b.owner_account_id.as_deref(), Some("admin-1"));
    }

    #[test]
    fn test_concurrent_consolidator_is_a_conflict() {
        let store = test_store();
        seed(&store, &fixture());
        let plan = ConsolidationPlanner::new(&store)
            .plan(&request(false, false), &stamp("1"))
            .expect("plan");

        // Another run wins the race after we planned.
        let mut rival = Account::new("rival");
        rival.kind = AccountKind::Consolidator;
        rival.group_key = Some("g".to_string());
        store.insert_one(&rival).expect("rival");

        let mut executor = MigrationExecutor::new(&store);
        let err = executor.execute(&plan).expect_err("conflict");
        assert!(matches!(err, MigrationError::ConsolidatedAccountConflict(ref g) if g == "g"));
        assert_eq!(executor.state(), ExecutionState::Failed);
        assert!(get(&store, "A").has_field("tags"));
    }

    #[test]
    fn test_failed_member_update_rolls_back_everything() {
        let store = FailingStore::new(test_store(), FailPoint::Update(3));
        seed(&store.inner, &fixture());
        let before = store.inner.dump_documents().expect("dump");

        let err = run(&store, &request(false, false), &stamp("1")).expect_err("injected");
        assert!(matches!(err, MigrationError::Store(StoreError::Sqlite(_))), "{err:?}");
        assert!(!err.to_string().contains("migration"), "{err}");
        assert_eq!(store.inner.dump_documents().expect("dump"), before);
    }

    #[test]
    fn test_persistent_write_conflict_aborts_the_transaction() {
        let store = FailingStore::busy(test_store(), FailPoint::Update(1));
        seed(&store.inner, &fixture());
        let before = store.inner.dump_documents().expect("dump");

        let mut executor = MigrationExecutor::new(&store);
        let plan = ConsolidationPlanner::new(&store)
            .plan(&request(false, false), &stamp("1"))
            .expect("plan");
        let err = executor.execute(&plan).expect_err("conflict");

        assert!(
            matches!(err, MigrationError::TransactionAborted(ref m) if m.contains("write conflict")),
            "{err:?}"
        );
        assert_eq!(executor.state(), ExecutionState::Failed);
        assert_eq!(store.inner.dump_documents().expect("dump"), before);
    }

    #[test]
    fn test_vanished_member_aborts() {
        let store = test_store();
        seed(&store, &fixture());
        let plan = ConsolidationPlanner::new(&store)
            .plan(&request(false, false), &stamp("1"))
            .expect("plan");
        store.delete_one("B").expect("delete");

        let err = MigrationExecutor::new(&store)
            .execute(&plan)
            .expect_err("abort");
        assert!(matches!(err, MigrationError::TransactionAborted(_)));
        assert!(store
            .find_one(&AccountFilter::Id("cons-1".to_string()))
            .expect("query")
            .is_none());
    }
}
