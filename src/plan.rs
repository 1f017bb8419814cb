//! Side-effect-free descriptions of intended writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Account;

/// Which operation produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Consolidate,
    Revert,
    SwapIds,
    RepairMembers,
}

/// Writes against a single record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSet {
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Backup values keyed by field name; never overwrite an existing backup.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backups: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset: Vec<String>,
}

impl WriteSet {
    pub fn new(target_id: &str, email: Option<&str>) -> Self {
        Self {
            target_id: target_id.to_string(),
            email: email.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty() && self.set.is_empty() && self.unset.is_empty()
    }

    pub fn set_value(&mut self, field: &str, value: Value) {
        self.set.insert(field.to_string(), value);
    }

    pub fn unset_field(&mut self, field: &str) {
        if !self.unset.iter().any(|f| f == field) {
            self.unset.push(field.to_string());
        }
    }

    /// Short label for log lines.
    pub fn label(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.target_id)
    }
}

/// What happens to the consolidated account record itself before its
/// write-set is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConsolidatorAction {
    /// The record already exists at `id`.
    Existing { id: String },
    /// Insert a freshly seeded record.
    Create { account: Account },
    /// Seed a new record at the owner's current identifier; the owner moves
    /// to `owner_new_id`.
    SwapWithOwner {
        owner_old_id: String,
        owner_new_id: String,
        account: Account,
    },
    /// Move an already persisted record to the owner's identifier; the
    /// owner moves to `owner_new_id`.
    SwapExisting {
        current_id: String,
        owner_old_id: String,
        owner_new_id: String,
    },
    /// Remove the record.
    Delete { id: String },
}

impl ConsolidatorAction {
    pub fn consolidator_id(&self) -> &str {
        match self {
            ConsolidatorAction::Existing { id } | ConsolidatorAction::Delete { id } => id,
            ConsolidatorAction::Create { account } => &account.id,
            ConsolidatorAction::SwapWithOwner { owner_old_id, .. }
            | ConsolidatorAction::SwapExisting { owner_old_id, .. } => owner_old_id,
        }
    }
}

/// Ordered description of a migration. The consolidated account is handled
/// first, then members in resolved selector order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub operation: Operation,
    pub group_key: String,
    pub dry_run: bool,
    pub generated_at: String,
    pub owner_account_id: String,
    pub consolidator: ConsolidatorAction,
    pub consolidator_writes: Option<WriteSet>,
    pub member_writes: Vec<WriteSet>,
    /// Explicitly requested members that were not found.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_members: Vec<String>,
}

impl MigrationPlan {
    pub fn consolidator_id(&self) -> &str {
        self.consolidator.consolidator_id()
    }

    /// Number of record-level writes a live run would issue.
    pub fn write_count(&self) -> usize {
        let action = match self.consolidator {
            ConsolidatorAction::Existing { .. } => 0,
            ConsolidatorAction::Create { .. } | ConsolidatorAction::Delete { .. } => 1,
            // clone insert, original delete, target insert, two pointer updates
            ConsolidatorAction::SwapWithOwner { .. } => 5,
            // plus removing the existing record from its old slot
            ConsolidatorAction::SwapExisting { .. } => 6,
        };
        let consolidator = self
            .consolidator_writes
            .as_ref()
            .map(|w| usize::from(!w.is_empty()))
            .unwrap_or(0);
        let members = self.member_writes.iter().filter(|w| !w.is_empty()).count();
        action + consolidator + members
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<unserializable plan: {e}>"))
    }
}
