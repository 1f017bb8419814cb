//! Read-only group report.

use serde::Serialize;
use serde_json::Value;

use crate::db::{AccountFilter, DocumentStore};
use crate::error::MigrationError;
use crate::types::{Account, AccountKind, Role};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatorSummary {
    pub id: String,
    pub group_key: Option<String>,
    pub subscription_tier: Option<Value>,
    pub profile_type: Option<Value>,
    pub owner_account_id: Option<String>,
    pub id_old: Option<String>,
    pub legacy_member_ids: Vec<String>,
    pub has_backups: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSummary {
    pub id: String,
    pub email: Option<String>,
    pub kind: AccountKind,
    pub role: Option<Role>,
    pub group_key: Option<String>,
    pub consolidated_account_id: Option<String>,
    pub owner_account_id: Option<String>,
    pub backup_keys: Vec<String>,
    pub has_id_old: bool,
    /// Member pointer disagrees with the group's consolidated account.
    pub stale_pointer: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReport {
    pub group_key: String,
    pub consolidator: Option<ConsolidatorSummary>,
    pub members: Vec<MemberSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

impl GroupReport {
    pub fn stale_members(&self) -> usize {
        self.members.iter().filter(|m| m.stale_pointer).count()
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<unserializable report: {e}>"))
    }
}

/// Build the report for `group_key`. With no `emails`, every current member
/// of the group is listed.
pub fn build_report<S: DocumentStore>(
    store: &S,
    group_key: &str,
    emails: &[String],
) -> Result<GroupReport, MigrationError> {
    let consolidator = store.find_one(&AccountFilter::ConsolidatorFor(group_key.to_string()))?;

    let mut missing = Vec::new();
    let accounts = if emails.is_empty() {
        store.find(&AccountFilter::MembersOf(group_key.to_string()))?
    } else {
        let mut found = Vec::new();
        for email in emails {
            match store.find_one(&AccountFilter::Email(email.clone()))? {
                Some(account) => found.push(account),
                None => missing.push(email.clone()),
            }
        }
        found
    };

    let consolidator_id = consolidator.as_ref().map(|c| c.id.as_str());
    let members = accounts
        .iter()
        .map(|account| summarize_member(account, consolidator_id))
        .collect();

    Ok(GroupReport {
        group_key: group_key.to_string(),
        consolidator: consolidator.as_ref().map(summarize_consolidator),
        members,
        missing,
    })
}

fn summarize_consolidator(account: &Account) -> ConsolidatorSummary {
    ConsolidatorSummary {
        id: account.id.clone(),
        group_key: account.group_key.clone(),
        subscription_tier: account.fields.get("subscription_tier").cloned(),
        profile_type: account.fields.get("profile_type").cloned(),
        owner_account_id: account.owner_account_id.clone(),
        id_old: account.id_old.clone(),
        legacy_member_ids: account.legacy_member_ids.clone(),
        has_backups: !account.backups.is_empty(),
    }
}

fn summarize_member(account: &Account, consolidator_id: Option<&str>) -> MemberSummary {
    let stale_pointer = account.kind == AccountKind::Member
        && account.consolidated_account_id.as_deref() != consolidator_id;
    MemberSummary {
        id: account.id.clone(),
        email: account.email.clone(),
        kind: account.kind,
        role: account.role,
        group_key: account.group_key.clone(),
        consolidated_account_id: account.consolidated_account_id.clone(),
        owner_account_id: account.owner_account_id.clone(),
        // BTreeMap keys are already sorted
        backup_keys: account.backups.keys().cloned().collect(),
        has_id_old: account.id_old.is_some(),
        stale_pointer,
    }
}
