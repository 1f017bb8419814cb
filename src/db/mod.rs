//! Document store for account records.
//!
//! The engine only talks to [`DocumentStore`]. The shipped backend keeps each
//! account as a JSON document in SQLite with the lookup keys (`email`, `kind`,
//! `group_key`) mirrored into indexed columns. A partial unique index on
//! `(group_key) WHERE kind = 'consolidator'` is the guard against two runs
//! consolidating the same group at once.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::plan::WriteSet;
use crate::types::{Account, AccountKind};

pub mod types;
pub use types::*;

/// Attempts per transaction before a busy store is reported to the caller.
const MAX_TRANSACTION_ATTEMPTS: u32 = 3;

/// Name of the partial unique index guarding one consolidator per group.
pub const CONSOLIDATOR_INDEX: &str = "idx_accounts_consolidator_group";

/// Transactional document-store primitives consumed by the engine.
pub trait DocumentStore {
    fn find_one(&self, filter: &AccountFilter) -> Result<Option<Account>, StoreError>;

    /// Matching records in insertion order.
    fn find(&self, filter: &AccountFilter) -> Result<Vec<Account>, StoreError>;

    fn insert_one(&self, account: &Account) -> Result<(), StoreError>;

    /// Apply `writes` to the record at `writes.target_id`.
    /// Returns false when no such record exists.
    fn update_one(&self, writes: &WriteSet) -> Result<bool, StoreError>;

    /// Returns false when no such record exists.
    fn delete_one(&self, id: &str) -> Result<bool, StoreError>;

    /// Run `f` inside one transaction. Commits on Ok, rolls back on Err.
    /// Calls made while a transaction is already open join it.
    fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnMut(&Self) -> Result<T, E>,
        E: From<StoreError> + Retryable;

    /// Make sure the one-consolidator-per-group constraint exists.
    fn ensure_consolidator_index(&self) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
    in_transaction: Cell<bool>,
}

impl SqliteStore {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Open (or create) the store at `~/.enterprise-migrate/accounts.db`.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(Self::default_path()?)
    }

    /// Open a store at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn).map_err(StoreError::Migration)?;

        Ok(Self {
            conn,
            in_transaction: Cell::new(false),
        })
    }

    /// Open read-only; used by `verify` so a report can never write.
    pub fn open_readonly_at(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            in_transaction: Cell::new(false),
        })
    }

    pub fn default_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeDirNotFound)?;
        Ok(home.join(".enterprise-migrate").join("accounts.db"))
    }

    /// Raw `(id, doc)` rows ordered by id. Used to compare store snapshots.
    pub fn dump_documents(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id, doc FROM accounts ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn where_clause(filter: &AccountFilter) -> (&'static str, String) {
        match filter {
            AccountFilter::Id(id) => ("id = ?1", id.clone()),
            AccountFilter::Email(email) => ("email = ?1", email.trim().to_lowercase()),
            AccountFilter::EmailDomain(domain) => (
                "email IS NOT NULL AND instr(email, '@') > 0
                 AND substr(email, instr(email, '@') + 1) = ?1
                 AND kind != 'consolidator'",
                domain.trim().to_lowercase(),
            ),
            AccountFilter::ConsolidatorFor(group) => {
                ("kind = 'consolidator' AND group_key = ?1", group.clone())
            }
            AccountFilter::MembersOf(group) => ("kind = 'member' AND group_key = ?1", group.clone()),
        }
    }

    fn decode(doc: &str) -> Result<Account, StoreError> {
        Ok(serde_json::from_str(doc)?)
    }

    fn write_row(&self, account: &Account, insert: bool) -> Result<(), StoreError> {
        let doc = serde_json::to_string(account)?;
        let email = account.email.as_deref().map(|e| e.trim().to_lowercase());
        let now = chrono::Utc::now().to_rfc3339();
        if insert {
            self.conn.execute(
                "INSERT INTO accounts (id, email, kind, group_key, doc, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![account.id, email, account.kind.as_str(), account.group_key, doc, now],
            )?;
        } else {
            self.conn.execute(
                "UPDATE accounts SET email = ?2, kind = ?3, group_key = ?4, doc = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![account.id, email, account.kind.as_str(), account.group_key, doc, now],
            )?;
        }
        Ok(())
    }
}

impl DocumentStore for SqliteStore {
    fn find_one(&self, filter: &AccountFilter) -> Result<Option<Account>, StoreError> {
        let (clause, param) = Self::where_clause(filter);
        let sql = format!("SELECT doc FROM accounts WHERE {clause} ORDER BY rowid LIMIT 1");
        let doc: Option<String> = self
            .conn
            .query_row(&sql, params![param], |row| row.get(0))
            .optional()?;
        doc.as_deref().map(Self::decode).transpose()
    }

    fn find(&self, filter: &AccountFilter) -> Result<Vec<Account>, StoreError> {
        let (clause, param) = Self::where_clause(filter);
        let sql = format!("SELECT doc FROM accounts WHERE {clause} ORDER BY rowid");
        let mut stmt = self.conn.prepare(&sql)?;
        let docs = stmt
            .query_map(params![param], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|doc| Self::decode(doc)).collect()
    }

    fn insert_one(&self, account: &Account) -> Result<(), StoreError> {
        self.write_row(account, true)
    }

    fn update_one(&self, writes: &WriteSet) -> Result<bool, StoreError> {
        let Some(mut account) = self.find_one(&AccountFilter::Id(writes.target_id.clone()))? else {
            return Ok(false);
        };
        account.apply(writes)?;
        self.write_row(&account, false)?;
        Ok(true)
    }

    fn delete_one(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn with_transaction<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&Self) -> Result<T, E>,
        E: From<StoreError> + Retryable,
    {
        if self.in_transaction.get() {
            return f(self);
        }

        let mut attempt = 1;
        loop {
            self.conn
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| E::from(StoreError::from(e)))?;
            self.in_transaction.set(true);
            let result = f(self);
            self.in_transaction.set(false);

            let err = match result {
                Ok(val) => match self.conn.execute_batch("COMMIT") {
                    Ok(()) => return Ok(val),
                    Err(e) => {
                        let _ = self.conn.execute_batch("ROLLBACK");
                        E::from(StoreError::from(e))
                    }
                },
                Err(e) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    e
                }
            };

            if err.is_retryable() && attempt < MAX_TRANSACTION_ATTEMPTS {
                log::warn!(
                    "Transaction attempt {} of {} hit a transient error; retrying",
                    attempt,
                    MAX_TRANSACTION_ATTEMPTS
                );
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }

    fn ensure_consolidator_index(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {CONSOLIDATOR_INDEX}
             ON accounts(group_key) WHERE kind = '{}'",
            AccountKind::Consolidator.as_str()
        ))?;
        Ok(())
    }
}

pub mod test_utils {
    use std::cell::Cell;

    use super::{AccountFilter, DocumentStore, Retryable, SqliteStore, StoreError};
    use crate::plan::WriteSet;
    use crate::types::Account;

    /// Which call a [`FailingStore`] breaks on (1-based, per operation).
    #[derive(Debug, Clone, Copy)]
    pub enum FailPoint {
        Insert(usize),
        Update(usize),
        Delete(usize),
    }

    /// Store wrapper that fails a chosen write, for rollback tests.
    ///
    /// [`FailingStore::new`] breaks the chosen call once with an I/O error.
    /// [`FailingStore::busy`] reports a write conflict on that call and on
    /// every later one, so transaction retries never get through.
    pub struct FailingStore {
        pub inner: SqliteStore,
        fail_at: FailPoint,
        persistent: bool,
        inserts: Cell<usize>,
        updates: Cell<usize>,
        deletes: Cell<usize>,
    }

    impl FailingStore {
        pub fn new(inner: SqliteStore, fail_at: FailPoint) -> Self {
            Self {
                inner,
                fail_at,
                persistent: false,
                inserts: Cell::new(0),
                updates: Cell::new(0),
                deletes: Cell::new(0),
            }
        }

        pub fn busy(inner: SqliteStore, fail_at: FailPoint) -> Self {
            Self {
                persistent: true,
                ..Self::new(inner, fail_at)
            }
        }

        fn tick(&self, counter: &Cell<usize>, fail_on: Option<usize>) -> Result<(), StoreError> {
            counter.set(counter.get() + 1);
            let Some(n) = fail_on else {
                return Ok(());
            };
            if self.persistent && counter.get() >= n {
                return Err(StoreError::Busy("write conflict".to_string()));
            }
            if counter.get() == n {
                return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
                    Some("injected write failure".to_string()),
                )));
            }
            Ok(())
        }
    }

    impl DocumentStore for FailingStore {
        fn find_one(&self, filter: &AccountFilter) -> Result<Option<Account>, StoreError> {
            self.inner.find_one(filter)
        }

        fn find(&self, filter: &AccountFilter) -> Result<Vec<Account>, StoreError> {
            self.inner.find(filter)
        }

        fn insert_one(&self, account: &Account) -> Result<(), StoreError> {
            let fail_on = match self.fail_at {
                FailPoint::Insert(n) => Some(n),
                _ => None,
            };
            self.tick(&self.inserts, fail_on)?;
            self.inner.insert_one(account)
        }

        fn update_one(&self, writes: &WriteSet) -> Result<bool, StoreError> {
            let fail_on = match self.fail_at {
                FailPoint::Update(n) => Some(n),
                _ => None,
            };
            self.tick(&self.updates, fail_on)?;
            self.inner.update_one(writes)
        }

        fn delete_one(&self, id: &str) -> Result<bool, StoreError> {
            let fail_on = match self.fail_at {
                FailPoint::Delete(n) => Some(n),
                _ => None,
            };
            self.tick(&self.deletes, fail_on)?;
            self.inner.delete_one(id)
        }

        fn with_transaction<T, E, F>(&self, mut f: F) -> Result<T, E>
        where
            F: FnMut(&Self) -> Result<T, E>,
            E: From<StoreError> + Retryable,
        {
            self.inner.with_transaction(|_| f(self))
        }

        fn ensure_consolidator_index(&self) -> Result<(), StoreError> {
            self.inner.ensure_consolidator_index()
        }
    }

    /// Create a temporary store for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    pub fn test_store() -> SqliteStore {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        SqliteStore::open_at(path).expect("Failed to open test store")
    }

    /// Insert fixture records in order.
    pub fn seed(store: &SqliteStore, accounts: &[Account]) {
        for account in accounts {
            store.insert_one(account).expect("seed account");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::test_utils::{seed, test_store};
    use super::*;
    use crate::types::Role;
    use serde_json::json;

    fn member(id: &str, email: &str, group: &str) -> Account {
        let mut account = Account::new(id).with_email(email);
        account.kind = AccountKind::Member;
        account.group_key = Some(group.to_string());
        account.role = Some(Role::Viewer);
        account
    }

    fn consolidator(id: &str, group: &str) -> Account {
        let mut account = Account::new(id);
        account.kind = AccountKind::Consolidator;
        account.group_key = Some(group.to_string());
        account
    }

    #[test]
    fn test_open_creates_accounts_table() {
        let store = test_store();
        let count: i32 = store
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))
            .expect("accounts table should exist");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_find_by_email_is_case_insensitive() {
        let store = test_store();
        seed(&store, &[Account::new("u1").with_email("Ana@Acme.com")]);

        let found = store
            .find_one(&AccountFilter::Email("ana@ACME.COM".to_string()))
            .expect("query")
            .expect("should exist");
        assert_eq!(found.id, "u1");
        assert_eq!(found.email.as_deref(), Some("Ana@Acme.com"));
    }

    #[test]
    fn test_find_by_domain_keeps_insertion_order_and_skips_consolidators() {
        let store = test_store();
        seed(
            &store,
            &[
                Account::new("u2").with_email("zoe@acme.com"),
                Account::new("u1").with_email("ana@acme.com"),
                Account::new("x1").with_email("bob@other.com"),
                Account::new("x2").with_email("eve@notacme.com"),
                consolidator("c1", "acme.com"),
            ],
        );

        let ids: Vec<String> = store
            .find(&AccountFilter::EmailDomain("ACME.com".to_string()))
            .expect("query")
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["u2".to_string(), "u1".to_string()]);
    }

    #[test]
    fn test_members_of_and_consolidator_lookup() {
        let store = test_store();
        seed(
            &store,
            &[
                consolidator("c1", "acme.com"),
                member("u1", "ana@acme.com", "acme.com"),
                member("u2", "bob@other.com", "other.com"),
            ],
        );

        let members = store
            .find(&AccountFilter::MembersOf("acme.com".to_string()))
            .expect("query");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, "u1");

        let found = store
            .find_one(&AccountFilter::ConsolidatorFor("acme.com".to_string()))
            .expect("query");
        assert_eq!(found.map(|c| c.id), Some("c1".to_string()));
    }

    #[test]
    fn test_second_consolidator_for_group_is_rejected() {
        let store = test_store();
        store.ensure_consolidator_index().expect("index");
        store.insert_one(&consolidator("c1", "acme.com")).expect("first");

        let err = store
            .insert_one(&consolidator("c2", "acme.com"))
            .expect_err("duplicate consolidator must fail");
        match err {
            StoreError::Duplicate { index, .. } => assert!(index.contains("group_key"), "{index}"),
            other => panic!("expected duplicate error, got {other:?}"),
        }

        // Members of the same group are not constrained.
        store.insert_one(&member("u1", "a@acme.com", "acme.com")).expect("member");
        store.insert_one(&member("u2", "b@acme.com", "acme.com")).expect("member");
    }

    #[test]
    fn test_update_one_applies_write_set() {
        let store = test_store();
        seed(&store, &[Account::new("u1").with_field("tags", json!(["x"]))]);

        let mut writes = WriteSet::new("u1", None);
        writes.backups.insert("tags".to_string(), json!(["x"]));
        writes.unset_field("tags");
        writes.set_value("kind", json!("member"));
        writes.set_value("group_key", json!("acme.com"));
        assert!(store.update_one(&writes).expect("update"));

        let members = store
            .find(&AccountFilter::MembersOf("acme.com".to_string()))
            .expect("query");
        assert_eq!(members.len(), 1);
        assert!(!members[0].has_field("tags"));
        assert_eq!(members[0].backups["tags"], json!(["x"]));

        assert!(!store.update_one(&WriteSet::new("missing", None)).expect("update"));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = test_store();
        let result: Result<(), StoreError> = store.with_transaction(|tx| {
            tx.insert_one(&Account::new("u1"))?;
            Err(StoreError::Migration("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(store
            .find_one(&AccountFilter::Id("u1".to_string()))
            .expect("query")
            .is_none());
    }

    #[test]
    fn test_nested_transaction_joins_outer() {
        let store = test_store();
        let result: Result<(), StoreError> = store.with_transaction(|tx| {
            tx.insert_one(&Account::new("u1"))?;
            tx.with_transaction(|inner| inner.insert_one(&Account::new("u2")))?;
            Err(StoreError::Migration("abort outer".to_string()))
        });
        assert!(result.is_err());
        assert!(store.dump_documents().expect("dump").is_empty());
    }

    #[test]
    fn test_transaction_retries_transient_errors() {
        let store = test_store();
        let mut calls = 0;
        let result: Result<usize, StoreError> = store.with_transaction(|tx| {
            calls += 1;
            tx.insert_one(&Account::new(format!("u{calls}")))?;
            if calls < 2 {
                return Err(StoreError::Busy("simulated".to_string()));
            }
            Ok(calls)
        });
        assert_eq!(result.expect("second attempt commits"), 2);
        let ids: Vec<String> = store
            .dump_documents()
            .expect("dump")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["u2".to_string()]);
    }
}
