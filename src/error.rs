//! Error types for consolidation, reversal and repair runs.
//!
//! Errors are classified by phase:
//! - Planning: raised before any write; nothing to clean up.
//! - Execution: raised inside the store transaction; the store's rollback is
//!   the only recovery and no compensating writes are issued.

use thiserror::Error;

use crate::db::{Retryable, StoreError};
use crate::swap::SwapStep;

#[derive(Debug, Error)]
pub enum MigrationError {
    // Planning errors
    #[error("Administrator account not found: {0}")]
    AdminNotFound(String),

    #[error("Could not determine the group key (set MIGRATE_DOMAIN or an administrator email)")]
    GroupKeyUnresolved,

    #[error("No eligible member accounts for group {0}")]
    NoEligibleMembers(String),

    #[error("No consolidated account exists for group {0}")]
    ConsolidatedAccountNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pre-run backup failed: {0}")]
    Backup(String),

    // Execution errors
    #[error("A consolidated account already exists for group {0}")]
    ConsolidatedAccountConflict(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Identity swap failed while {step}: {reason}")]
    IdentitySwapFailed { step: SwapStep, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// True for errors raised before the first write.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            MigrationError::AdminNotFound(_)
                | MigrationError::GroupKeyUnresolved
                | MigrationError::NoEligibleMembers(_)
                | MigrationError::ConsolidatedAccountNotFound(_)
                | MigrationError::Config(_)
                | MigrationError::Backup(_)
        )
    }

    /// A write conflict still standing once the store has spent its
    /// transaction retries is reported as an aborted transaction.
    pub fn after_retries(self) -> Self {
        if self.is_retryable() {
            return MigrationError::TransactionAborted(self.to_string());
        }
        self
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            MigrationError::AdminNotFound(_) => "Check MIGRATE_ADMIN_EMAIL against the store.",
            MigrationError::GroupKeyUnresolved => {
                "Set MIGRATE_DOMAIN or use an administrator email with a domain."
            }
            MigrationError::NoEligibleMembers(_) => {
                "Check MIGRATE_USER_EMAILS or the domain; nothing matched."
            }
            MigrationError::ConsolidatedAccountNotFound(_) => {
                "Run the consolidation first, or check the group key."
            }
            MigrationError::Config(_) => "Fix the configuration and run again.",
            MigrationError::Backup(_) => {
                "Check free space and write permission next to the store file."
            }
            MigrationError::ConsolidatedAccountConflict(_) => {
                "Another run created the consolidated account; re-run to merge into it."
            }
            MigrationError::TransactionAborted(_) | MigrationError::IdentitySwapFailed { .. } => {
                "Nothing was written. Investigate the cause, then re-run."
            }
            MigrationError::Store(_) => "Check the store path and permissions.",
        }
    }
}

impl Retryable for MigrationError {
    fn is_retryable(&self) -> bool {
        matches!(self, MigrationError::Store(e) if e.is_retryable())
    }
}
