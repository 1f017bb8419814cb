//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.
//! A migration and its version row commit together, so a failed step leaves
//! the store at the previous version. A store stamped with a version this
//! binary does not know is refused untouched.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

/// Create the `schema_version` table if it doesn't exist.
fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Failed to create schema_version table: {}", e))
}

/// Return the highest applied migration version, or 0 if none.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

fn apply(conn: &Connection, migration: &Migration) -> Result<(), String> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("Failed to begin migration v{}: {}", migration.version, e))?;
    tx.execute_batch(migration.sql)
        .map_err(|e| format!("Migration v{} failed: {}", migration.version, e))?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [migration.version],
    )
    .map_err(|e| format!("Failed to record migration v{}: {}", migration.version, e))?;
    tx.commit()
        .map_err(|e| format!("Failed to commit migration v{}: {}", migration.version, e))
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date). A
/// store stamped with a newer version than this binary knows is refused.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(format!(
            "Store schema version ({}) is newer than this binary supports ({}). \
             Upgrade enterprise-migrate before running it against this store.",
            current, max_known
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    for migration in &pending {
        apply(conn, migration)?;
        log::info!("Applied migration v{}", migration.version);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = mem_db();
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 1);
        assert_eq!(current_version(&conn).expect("version"), 1);

        conn.execute(
            "INSERT INTO accounts (id, email, kind, group_key, doc)
             VALUES ('c1', NULL, 'consolidator', 'acme.com', '{}')",
            [],
        )
        .expect("accounts table should accept a consolidator");

        let dup = conn.execute(
            "INSERT INTO accounts (id, email, kind, group_key, doc)
             VALUES ('c2', NULL, 'consolidator', 'acme.com', '{}')",
            [],
        );
        assert!(dup.is_err(), "partial unique index should reject a second consolidator");
    }

    #[test]
    fn test_failed_migration_keeps_previous_version() {
        let conn = mem_db();
        ensure_schema_version_table(&conn).expect("version table");
        let broken = Migration {
            version: 1,
            sql: "CREATE TABLE accounts (id TEXT PRIMARY KEY); NOT VALID SQL;",
        };

        let err = apply(&conn, &broken).expect_err("broken SQL must fail");
        assert!(err.contains("Migration v1 failed"), "unexpected error: {}", err);
        assert_eq!(current_version(&conn).expect("version"), 0);
        let leftover = conn.prepare("SELECT 1 FROM accounts").is_ok();
        assert!(!leftover, "partial migration must roll back");
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = mem_db();
        ensure_schema_version_table(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();

        let err = run_migrations(&conn).expect_err("future schema must be refused");
        assert!(err.contains("newer than"), "unexpected error: {}", err);
    }

    #[test]
    fn test_idempotency() {
        let conn = mem_db();
        assert_eq!(run_migrations(&conn).expect("first run"), 1);
        assert_eq!(run_migrations(&conn).expect("second run"), 0);
        assert_eq!(current_version(&conn).expect("version"), 1);
    }
}
