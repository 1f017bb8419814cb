//! Hot file-level backups of the SQLite store.
//!
//! Taken before every live migration run, on top of the per-field backups the
//! engine writes into each record. Uses the online backup API so the source
//! connection stays usable throughout.

use std::path::PathBuf;

use rusqlite::Connection;

use crate::db::SqliteStore;

/// Copy the database behind `conn` to `<db_path>.<suffix>.bak`.
///
/// Returns `None` for in-memory or temporary databases, which have no file
/// to sit next to.
pub fn backup_connection(conn: &Connection, suffix: &str) -> Result<Option<PathBuf>, String> {
    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Failed to get database path: {}", e))?;

    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(None);
    }

    let backup_path = PathBuf::from(format!("{}.{}.bak", db_path, suffix));
    let mut backup_conn = Connection::open(&backup_path)
        .map_err(|e| format!("Failed to open backup file: {}", e))?;

    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| format!("Failed to initialize backup: {}", e))?;

    // Copy all pages in one step
    backup
        .step(-1)
        .map_err(|e| format!("Backup failed: {}", e))?;

    log::info!("Store backed up to {}", backup_path.display());
    Ok(Some(backup_path))
}

/// Snapshot the store before a live consolidation, reversal or repair.
pub fn backup_before_run(store: &SqliteStore) -> Result<Option<PathBuf>, String> {
    backup_connection(store.conn_ref(), "pre-consolidation")
}
