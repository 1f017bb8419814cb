//! Consolidation planning.
//!
//! Reads the store, never writes to it. Resolves the administrator, the
//! group key, the consolidated account (existing or to be created) and the
//! member set, folds member fields into a seed through the merge table, and
//! emits a [`MigrationPlan`] with backups attached to every overwrite.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};

use crate::backup::BackupLedger;
use crate::config::{MigrationConfig, PlanSettings};
use crate::db::{AccountFilter, DocumentStore};
use crate::error::MigrationError;
use crate::merge::{is_empty, merge, shallow_merge, FieldKind, PORTABLE_FIELDS};
use crate::plan::{ConsolidatorAction, MigrationPlan, Operation, WriteSet};
use crate::types::{domain_of, Account, AccountKind, Role};

/// Which accounts fold into the consolidated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberSelector {
    /// Exactly these emails, in this order.
    Explicit(Vec<String>),
    /// Every account whose email domain equals the group key.
    Domain,
}

#[derive(Debug, Clone)]
pub struct ConsolidationRequest {
    pub group_key: Option<String>,
    /// Administrator email, or its identifier when it contains no `@`.
    pub admin: String,
    pub members: MemberSelector,
    pub default_role: Role,
    pub use_admin_identifier: bool,
    pub dry_run: bool,
    pub legacy_member_emails: Vec<String>,
    pub plan: PlanSettings,
}

impl ConsolidationRequest {
    pub fn from_config(config: &MigrationConfig) -> Result<Self, MigrationError> {
        let members = if config.user_emails.is_empty() {
            MemberSelector::Domain
        } else {
            MemberSelector::Explicit(config.user_emails.clone())
        };
        Ok(Self {
            group_key: config.group_key.clone(),
            admin: config.require_admin_email()?.to_string(),
            members,
            default_role: config.default_role,
            use_admin_identifier: config.use_admin_id_for_consolidator,
            dry_run: config.dry_run,
            legacy_member_emails: config.legacy_member_emails.clone(),
            plan: config.plan.clone(),
        })
    }
}

/// Clock reading and pre-generated identifiers for one planning pass, so a
/// plan is fully determined by the store contents plus this stamp.
#[derive(Debug, Clone)]
pub struct PlanStamp {
    pub now: DateTime<Utc>,
    pub consolidator_id: String,
    pub owner_new_id: String,
}

impl PlanStamp {
    pub fn fresh() -> Self {
        Self {
            now: Utc::now(),
            consolidator_id: uuid::Uuid::new_v4().to_string(),
            owner_new_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn timestamp(&self) -> String {
        self.now.to_rfc3339()
    }
}

/// Group key from, in order: the explicit value, the administrator's email
/// domain, the first selected member's domain.
pub fn resolve_group_key(
    explicit: Option<&str>,
    admin_email: Option<&str>,
    selected: &[String],
) -> Result<String, MigrationError> {
    if let Some(key) = explicit.map(|k| k.trim().to_lowercase()).filter(|k| !k.is_empty()) {
        return Ok(key);
    }
    admin_email
        .and_then(domain_of)
        .or_else(|| selected.first().and_then(|e| domain_of(e)))
        .ok_or(MigrationError::GroupKeyUnresolved)
}

/// Look an account up by email, or by id when `key` has no `@`.
pub fn find_by_email_or_id<S: DocumentStore>(
    store: &S,
    key: &str,
) -> Result<Option<Account>, MigrationError> {
    let filter = if key.contains('@') {
        AccountFilter::Email(key.to_string())
    } else {
        AccountFilter::Id(key.to_string())
    };
    Ok(store.find_one(&filter)?)
}

pub struct ConsolidationPlanner<'a, S> {
    store: &'a S,
}

impl<'a, S: DocumentStore> ConsolidationPlanner<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn plan(
        &self,
        request: &ConsolidationRequest,
        stamp: &PlanStamp,
    ) -> Result<MigrationPlan, MigrationError> {
        let admin = find_by_email_or_id(self.store, &request.admin)?
            .ok_or_else(|| MigrationError::AdminNotFound(request.admin.clone()))?;

        let selected = match &request.members {
            MemberSelector::Explicit(emails) => with_admin_included(emails, admin.email.as_deref()),
            MemberSelector::Domain => Vec::new(),
        };
        let group_key = resolve_group_key(
            request.group_key.as_deref(),
            admin.email.as_deref(),
            &selected,
        )?;

        let existing = self
            .store
            .find_one(&AccountFilter::ConsolidatorFor(group_key.clone()))?;

        let (members, missing) = self.resolve_members(&request.members, &selected, &group_key)?;
        if members.is_empty() {
            return Err(MigrationError::NoEligibleMembers(group_key));
        }

        let swap = existing.is_none() && request.use_admin_identifier;
        let owner_id = match &existing {
            Some(c) => c.owner_account_id.clone().unwrap_or_else(|| admin.id.clone()),
            None if swap => stamp.owner_new_id.clone(),
            None => admin.id.clone(),
        };

        let (action, current) = match existing {
            Some(consolidator) => (
                ConsolidatorAction::Existing {
                    id: consolidator.id.clone(),
                },
                consolidator,
            ),
            None => {
                let mut fresh = seed_document(&group_key, &admin, &owner_id, &request.plan, stamp);
                if swap {
                    fresh.id = admin.id.clone();
                    (
                        ConsolidatorAction::SwapWithOwner {
                            owner_old_id: admin.id.clone(),
                            owner_new_id: stamp.owner_new_id.clone(),
                            account: fresh.clone(),
                        },
                        fresh,
                    )
                } else {
                    (
                        ConsolidatorAction::Create {
                            account: fresh.clone(),
                        },
                        fresh,
                    )
                }
            }
        };

        let seed = seed_fields(&admin, &members);
        let consolidator_writes =
            consolidator_writes(&current, &seed, &owner_id, &members, request, stamp);

        let member_writes = members
            .iter()
            .map(|member| {
                let is_admin = member.id == admin.id;
                let target_id = if is_admin && swap {
                    stamp.owner_new_id.as_str()
                } else {
                    member.id.as_str()
                };
                let role = if is_admin {
                    Role::Owner
                } else {
                    request.default_role.member_default()
                };
                member_writes(member, target_id, role, &group_key, &current.id, &owner_id, request, stamp)
            })
            .collect();

        Ok(MigrationPlan {
            operation: Operation::Consolidate,
            group_key,
            dry_run: request.dry_run,
            generated_at: stamp.timestamp(),
            owner_account_id: owner_id,
            consolidator: action,
            consolidator_writes: Some(consolidator_writes),
            member_writes,
            missing_members: missing,
        })
    }

    fn resolve_members(
        &self,
        selector: &MemberSelector,
        selected: &[String],
        group_key: &str,
    ) -> Result<(Vec<Account>, Vec<String>), MigrationError> {
        let candidates = match selector {
            MemberSelector::Domain => {
                return Ok((
                    self.store
                        .find(&AccountFilter::EmailDomain(group_key.to_string()))?,
                    Vec::new(),
                ))
            }
            MemberSelector::Explicit(_) => selected,
        };

        let mut members: Vec<Account> = Vec::new();
        let mut missing = Vec::new();
        for email in candidates {
            match self.store.find_one(&AccountFilter::Email(email.clone()))? {
                Some(account) if account.kind != AccountKind::Consolidator => {
                    if !members.iter().any(|m| m.id == account.id) {
                        members.push(account);
                    }
                }
                _ => missing.push(email.clone()),
            }
        }
        if !missing.is_empty() {
            log::warn!(
                "{} requested member(s) not found: {}",
                missing.len(),
                missing.join(", ")
            );
        }
        Ok((members, missing))
    }
}

/// Explicit list with the administrator appended when absent.
fn with_admin_included(emails: &[String], admin_email: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for email in emails {
        let email = email.trim();
        if !email.is_empty() && !out.iter().any(|e| e.eq_ignore_ascii_case(email)) {
            out.push(email.to_string());
        }
    }
    if let Some(admin) = admin_email {
        if !out.iter().any(|e| e.eq_ignore_ascii_case(admin)) {
            out.push(admin.to_string());
        }
    }
    out
}

/// Starting document for a consolidated account that does not exist yet.
fn seed_document(
    group_key: &str,
    admin: &Account,
    owner_id: &str,
    plan: &PlanSettings,
    stamp: &PlanStamp,
) -> Account {
    let mut account = Account::new(stamp.consolidator_id.clone());
    account.kind = AccountKind::Consolidator;
    account.group_key = Some(group_key.to_string());
    account.owner_account_id = Some(owner_id.to_string());
    account.created_at = Some(
        admin
            .registration_date
            .as_deref()
            .and_then(parse_registration_date)
            .unwrap_or(stamp.now)
            .to_rfc3339(),
    );
    account.updated_at = Some(stamp.timestamp());

    for (field, kind) in PORTABLE_FIELDS {
        let empty = match kind {
            FieldKind::UnionArray => json!([]),
            FieldKind::ShallowMergeMap => json!({}),
            FieldKind::NormalizedUnion => json!({ "primary": [], "secondary": [] }),
            FieldKind::FirstNonEmptyWins => json!(""),
        };
        account.fields.insert(field.to_string(), empty);
    }
    account.fields.insert(
        "website_extraction_status".to_string(),
        json!({ "success": true, "error": null }),
    );
    account.fields.insert(
        "shared_folders".to_string(),
        json!({ "folders": {}, "assignments": {}, "version": 1 }),
    );
    account
        .fields
        .insert("edit_locks".to_string(), json!({ "agents": {}, "folders": {} }));
    account.fields.insert("agent_history".to_string(), json!([]));
    account.fields.insert("folder_history".to_string(), json!([]));
    for (field, value) in plan_values(plan) {
        account.fields.insert(field.to_string(), value);
    }
    account
        .fields
        .insert("profile_type".to_string(), json!("enterprise"));
    account
}

fn parse_registration_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

pub(crate) fn plan_values(plan: &PlanSettings) -> [(&'static str, Value); 4] {
    [
        ("subscription_tier", json!(plan.subscription_tier)),
        ("agent_limit", json!(plan.agent_limit)),
        ("source_limit", json!(plan.source_limit)),
        ("impact_analysis_limit", json!(plan.impact_analysis_limit)),
    ]
}

/// Admin values first, then the remaining members in selector order.
fn seed_fields(admin: &Account, members: &[Account]) -> BTreeMap<&'static str, Value> {
    let mut seed = BTreeMap::new();
    let sources = std::iter::once(admin).chain(members.iter().filter(|m| m.id != admin.id));
    for account in sources {
        for &(field, kind) in PORTABLE_FIELDS {
            let Some(incoming) = account.fields.get(field) else {
                continue;
            };
            let merged = merge(kind, seed.get(field), Some(incoming));
            seed.insert(field, merged);
        }
    }
    seed
}

fn consolidator_writes(
    current: &Account,
    seed: &BTreeMap<&'static str, Value>,
    owner_id: &str,
    members: &[Account],
    request: &ConsolidationRequest,
    stamp: &PlanStamp,
) -> WriteSet {
    let mut writes = WriteSet::new(&current.id, None);

    for &(field, kind) in PORTABLE_FIELDS {
        let Some(value) = seed.get(field).filter(|v| !is_empty(Some(*v))) else {
            continue;
        };
        let existing = current.fields.get(field);
        let next = match kind {
            FieldKind::ShallowMergeMap => Value::Object(shallow_merge(existing, Some(value))),
            _ => value.clone(),
        };
        if existing == Some(&next) {
            continue;
        }
        BackupLedger::guard_overwrite(current, field, &next, &mut writes);
        writes.set_value(field, next);
    }

    let mut assignments: Vec<(&str, Value)> = plan_values(&request.plan).into_iter().collect();
    assignments.push(("profile_type", json!("enterprise")));
    assignments.push(("owner_account_id", json!(owner_id)));

    if !request.legacy_member_emails.is_empty() {
        let wanted: HashSet<String> = request
            .legacy_member_emails
            .iter()
            .map(|e| e.trim().to_lowercase())
            .collect();
        let mut legacy = current.legacy_member_ids.clone();
        for member in members {
            let is_legacy = member
                .email
                .as_deref()
                .map(|e| wanted.contains(&e.trim().to_lowercase()))
                .unwrap_or(false);
            if is_legacy && !legacy.contains(&member.id) {
                legacy.push(member.id.clone());
            }
        }
        if legacy != current.legacy_member_ids {
            assignments.push(("legacy_member_ids", json!(legacy)));
        }
    }

    for (field, value) in assignments {
        if current.field(field).as_ref() == Some(&value) {
            continue;
        }
        BackupLedger::guard_overwrite(current, field, &value, &mut writes);
        writes.set_value(field, value);
    }
    writes.set_value("updated_at", json!(stamp.timestamp()));
    writes
}

#[allow(clippy::too_many_arguments)]
fn member_writes(
    member: &Account,
    target_id: &str,
    role: Role,
    group_key: &str,
    consolidator_id: &str,
    owner_id: &str,
    request: &ConsolidationRequest,
    stamp: &PlanStamp,
) -> WriteSet {
    let mut writes = WriteSet::new(target_id, member.email.as_deref());

    // Portable fields move to the consolidated account.
    for &(field, _) in PORTABLE_FIELDS {
        if member.fields.contains_key(field) {
            BackupLedger::guard(member, field, &mut writes);
            writes.unset_field(field);
        }
    }

    let mut assignments: Vec<(&str, Value)> = vec![
        ("kind", json!(AccountKind::Member)),
        ("group_key", json!(group_key)),
        ("consolidated_account_id", json!(consolidator_id)),
        ("owner_account_id", json!(owner_id)),
        ("role", json!(role)),
    ];
    assignments.extend(plan_values(&request.plan));

    for (field, value) in assignments {
        BackupLedger::guard_overwrite(member, field, &value, &mut writes);
        writes.set_value(field, value);
    }
    writes.set_value("updated_at", json!(stamp.timestamp()));
    writes
}
