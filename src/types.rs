//! Account document model.
//!
//! Records are schema-less documents in the store. The attributes the engine
//! reasons about are typed; everything else (portable fields, plan-level
//! fields, attributes this binary has never heard of) rides along in the
//! flattened `fields` map so a read/modify/write cycle never drops data.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::plan::WriteSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    #[default]
    Individual,
    #[serde(alias = "empresa")]
    Member,
    #[serde(alias = "estructura_empresa")]
    Consolidator,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Individual => "individual",
            AccountKind::Member => "member",
            AccountKind::Consolidator => "consolidator",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission level of a member inside its group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "admin")]
    Owner,
    #[serde(alias = "edicion")]
    Editor,
    #[default]
    #[serde(alias = "lectura")]
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    /// Role handed to non-administrator members. Ownership is never granted
    /// by default; anything other than editor collapses to viewer.
    pub fn member_default(self) -> Role {
        match self {
            Role::Editor => Role::Editor,
            _ => Role::Viewer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "owner" | "admin" => Ok(Role::Owner),
            "editor" | "edicion" => Ok(Role::Editor),
            "viewer" | "lectura" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// One record of the `accounts` collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub kind: AccountKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidated_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_account_id: Option<String>,
    /// Identifier this record held before an identity swap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_old: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub legacy_member_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Pre-migration values keyed by field name. Written at most once per field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backups: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Domain part of the email, lowercased.
    pub fn email_domain(&self) -> Option<String> {
        self.email.as_deref().and_then(domain_of)
    }

    pub fn email_matches(&self, email: &str) -> bool {
        self.email
            .as_deref()
            .map(|e| e.eq_ignore_ascii_case(email.trim()))
            .unwrap_or(false)
    }

    /// Read any top-level attribute by document name, typed ones included.
    ///
    /// Mirrors the persisted document: attributes skipped on serialization
    /// (unset options, empty lists and maps) read as `None`.
    pub fn field(&self, name: &str) -> Option<Value> {
        let text = |v: &Option<String>| v.clone().map(Value::String);
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "email" => text(&self.email),
            "kind" => Some(Value::String(self.kind.as_str().to_string())),
            "group_key" => text(&self.group_key),
            "role" => self.role.map(|r| Value::String(r.as_str().to_string())),
            "consolidated_account_id" => text(&self.consolidated_account_id),
            "owner_account_id" => text(&self.owner_account_id),
            "id_old" => text(&self.id_old),
            "legacy_member_ids" if self.legacy_member_ids.is_empty() => None,
            "legacy_member_ids" => Some(Value::Array(
                self.legacy_member_ids
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            )),
            "registration_date" => text(&self.registration_date),
            "created_at" => text(&self.created_at),
            "updated_at" => text(&self.updated_at),
            "backups" if self.backups.is_empty() => None,
            "backups" => Some(Value::Object(
                self.backups
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
            other => self.fields.get(other).cloned(),
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Serialize into the document shape persisted by the store.
    pub fn to_document(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "account serialized to non-object {}",
                other
            ))),
        }
    }

    pub fn from_document(doc: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(doc))
    }

    /// Apply a write-set in place: backups first (never clobbering an
    /// existing one), then `set`, then `unset`.
    pub fn apply(&mut self, writes: &WriteSet) -> Result<(), serde_json::Error> {
        let mut doc = self.to_document()?;
        for (name, value) in &writes.set {
            doc.insert(name.clone(), value.clone());
        }
        for name in &writes.unset {
            doc.remove(name);
        }
        // The identifier is only changed through delete + insert.
        doc.insert("id".to_string(), Value::String(self.id.clone()));

        let mut updated = Self::from_document(doc)?;
        updated.backups = self.backups.clone();
        for (name, value) in &writes.backups {
            updated
                .backups
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        *self = updated;
        Ok(())
    }
}

/// Lowercased domain of an email address, if it has one.
pub fn domain_of(email: &str) -> Option<String> {
    email
        .trim()
        .split_once('@')
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|d| !d.is_empty())
}
