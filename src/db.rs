use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

/// Opens (creating if needed) the cache database and brings its schema up to date.
pub fn bootstrap<P: AsRef<Path>>(db_path: P) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "cache database ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

/// In-memory database with the same schema, for tests and dry runs.
pub fn in_memory() -> AppResult<DatabaseContext> {
    let connection = Connection::open_in_memory()?;
    run_migrations(&connection)?;
    Ok(DatabaseContext {
        connection,
        path: PathBuf::from(":memory:"),
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS geocode_cache (
            normalized_key TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            status TEXT NOT NULL,
            lat REAL,
            lng REAL,
            raw_json TEXT NOT NULL,
            inserted_at TEXT NOT NULL
        );
        "#,
    )?;
    ensure_column(connection, "geocode_cache", "raw_json TEXT NOT NULL DEFAULT 'null'")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("nested").join("test.db")).unwrap();

        let count: i64 = ctx
            .connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = 'geocode_cache'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(ctx.path.ends_with("test.db"));
        assert!(ctx.path.exists());
    }

    #[test]
    fn adds_missing_columns_to_older_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE geocode_cache (
                    normalized_key TEXT PRIMARY KEY,
                    address TEXT NOT NULL,
                    status TEXT NOT NULL,
                    lat REAL,
                    lng REAL,
                    inserted_at TEXT NOT NULL
                );",
            )
            .unwrap();
        }

        let ctx = bootstrap(&path).unwrap();
        assert!(column_exists(&ctx.connection, "geocode_cache", "raw_json").unwrap());
    }

    #[test]
    fn reopening_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("again.db");
        drop(bootstrap(&path).unwrap());
        assert!(bootstrap(&path).is_ok());
    }
}
