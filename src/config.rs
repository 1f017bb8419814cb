//! Run configuration.
//!
//! Built once at process start and passed by reference into the planner.
//! Precedence, lowest to highest: built-in defaults, optional JSON config
//! file, `MIGRATE_*` environment variables, CLI flags (applied by the binary).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::types::Role;

fn default_true() -> bool {
    true
}

fn default_tier() -> String {
    "plan4".to_string()
}

fn default_impact_limit() -> i64 {
    -1
}

/// Subscription tier and quotas stamped on the consolidated account and its
/// members. `None` limits mean unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSettings {
    #[serde(default = "default_tier")]
    pub subscription_tier: String,
    #[serde(default)]
    pub agent_limit: Option<i64>,
    #[serde(default)]
    pub source_limit: Option<i64>,
    #[serde(default = "default_impact_limit")]
    pub impact_analysis_limit: i64,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            subscription_tier: default_tier(),
            agent_limit: None,
            source_limit: None,
            impact_analysis_limit: default_impact_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    /// Explicit member list. Empty means "every account on the group domain".
    #[serde(default, alias = "user_emails")]
    pub user_emails: Vec<String>,
    #[serde(default, alias = "domain", alias = "group_key")]
    pub group_key: Option<String>,
    #[serde(default, alias = "admin_email")]
    pub admin_email: Option<String>,
    #[serde(default, alias = "default_role")]
    pub default_role: Role,
    #[serde(default = "default_true", alias = "dry_run")]
    pub dry_run: bool,
    #[serde(default = "default_true", alias = "use_admin_id_for_consolidator")]
    pub use_admin_id_for_consolidator: bool,
    /// Members whose identifiers must keep resolving to the consolidated account.
    #[serde(default, alias = "legacy_member_emails")]
    pub legacy_member_emails: Vec<String>,
    #[serde(default)]
    pub plan: PlanSettings,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            user_emails: Vec::new(),
            group_key: None,
            admin_email: None,
            default_role: Role::Viewer,
            dry_run: true,
            use_admin_id_for_consolidator: true,
            legacy_member_emails: Vec::new(),
            plan: PlanSettings::default(),
        }
    }
}

impl MigrationConfig {
    /// Defaults, then `config_file` if given, then the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, MigrationError> {
        let base = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_env(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, MigrationError> {
        let content = fs::read_to_string(path).map_err(|e| {
            MigrationError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            MigrationError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    /// Overlay `MIGRATE_*` variables read through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, MigrationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = var("MIGRATE_DB_PATH") {
            self.db_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(list) = var("MIGRATE_USER_EMAILS") {
            self.user_emails = split_list(&list);
        }
        if let Some(domain) = var("MIGRATE_DOMAIN") {
            self.group_key = Some(domain.trim().to_lowercase());
        }
        if let Some(email) = var("MIGRATE_ADMIN_EMAIL") {
            self.admin_email = Some(email.trim().to_string());
        }
        if let Some(role) = var("MIGRATE_DEFAULT_ROLE").or_else(|| var("MIGRATE_DEFAULT_PERMISO")) {
            self.default_role = role.parse().map_err(MigrationError::Config)?;
        }
        if let Some(flag) = var("MIGRATE_DRY_RUN") {
            self.dry_run = parse_flag(&flag);
        }
        if let Some(flag) = var("MIGRATE_USE_ADMIN_AS_EMPRESA_ID") {
            self.use_admin_id_for_consolidator = parse_flag(&flag);
        }
        if let Some(list) = var("MIGRATE_LEGACY_USER_EMAILS") {
            self.legacy_member_emails = split_list(&list);
        }
        if let Some(tier) = var("MIGRATE_SUBSCRIPTION_TIER") {
            self.plan.subscription_tier = tier.trim().to_string();
        }
        Ok(self)
    }

    /// Administrator email, required by every operation.
    pub fn require_admin_email(&self) -> Result<&str, MigrationError> {
        self.admin_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| MigrationError::Config("administrator email is not set".to_string()))
    }

    pub fn db_path(&self) -> Result<PathBuf, MigrationError> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(crate::db::SqliteStore::default_path()?),
        }
    }
}

/// Comma-separated list, trimmed, blanks dropped.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Only a literal `true` (any case) enables a flag.
pub fn parse_flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}
