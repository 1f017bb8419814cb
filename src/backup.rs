//! Backup ledger: the only undo mechanism for migrations.
//!
//! A backup is written at most once per field per record. The ledger never
//! touches the store; callers fold its decisions into the same write-set as
//! the change being protected so both land in one atomic update.

use serde_json::Value;

use crate::merge::is_empty;
use crate::plan::WriteSet;
use crate::types::Account;

pub struct BackupLedger;

impl BackupLedger {
    /// True iff `record` has no backup for `field` yet.
    pub fn should_backup(record: &Account, field: &str) -> bool {
        !record.backups.contains_key(field)
    }

    /// The value to store as the backup of `field`.
    pub fn snapshot(record: &Account, field: &str) -> Option<Value> {
        record.field(field)
    }

    /// Back up `field` if it is present and not already backed up.
    /// Returns whether a backup was added to `writes`.
    pub fn guard(record: &Account, field: &str, writes: &mut WriteSet) -> bool {
        if !Self::should_backup(record, field) || writes.backups.contains_key(field) {
            return false;
        }
        match Self::snapshot(record, field) {
            Some(value) => {
                writes.backups.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Back up `field` only when the pending value would replace a
    /// different, non-empty current value.
    pub fn guard_overwrite(
        record: &Account,
        field: &str,
        incoming: &Value,
        writes: &mut WriteSet,
    ) -> bool {
        let current = Self::snapshot(record, field);
        if is_empty(current.as_ref()) || current.as_ref() == Some(incoming) {
            return false;
        }
        Self::guard(record, field, writes)
    }
}
