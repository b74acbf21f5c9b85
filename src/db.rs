use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub struct DatabaseBootstrap {
    pub context: DatabaseContext,
    /// Set when an unreadable store was moved aside and recreated.
    pub quarantined: Option<PathBuf>,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseBootstrap> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    match establish_context(&db_path) {
        Ok(context) => {
            info!(
                target: "database_bootstrap",
                path = %db_path.display(),
                "catalog database ready"
            );
            Ok(DatabaseBootstrap {
                context,
                quarantined: None,
            })
        }
        Err(AppError::Database(err)) if should_attempt_recovery(&err, &db_path) => {
            warn!(
                target: "database_bootstrap",
                path = %db_path.display(),
                error = %err,
                "catalog database unreadable; moving it aside"
            );
            let quarantined = quarantine_store(&db_path)?;
            let context = establish_context(&db_path)?;
            Ok(DatabaseBootstrap {
                context,
                quarantined: Some(quarantined),
            })
        }
        Err(err) => Err(err),
    }
}

/// In-memory catalog with the full schema, for tests and dry runs.
pub fn open_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    apply_pragmas(&connection)?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn establish_context(db_path: &Path) -> AppResult<DatabaseContext> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    apply_pragmas(&connection)?;
    run_migrations(&connection)?;

    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn apply_pragmas(connection: &Connection) -> AppResult<()> {
    connection.pragma_update(None, "foreign_keys", "ON")?;
    connection.busy_timeout(Duration::from_secs(5))?;
    let _mode: String = connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            rug_no TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL DEFAULT '',
            collection TEXT NOT NULL DEFAULT '',
            price REAL,
            width REAL,
            length REAL,
            qty INTEGER NOT NULL DEFAULT 0,
            photo_ref TEXT NOT NULL DEFAULT '',
            remote_row INTEGER,
            synced_marker TEXT,
            last_modified INTEGER NOT NULL DEFAULT 1,
            dirty INTEGER NOT NULL DEFAULT 1 CHECK (dirty IN (0, 1)),
            deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            synced_at TEXT
        );

        CREATE TABLE IF NOT EXISTS sync_cursor (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            revision INTEGER NOT NULL DEFAULT 0,
            committed_at TEXT,
            remote_fingerprint TEXT,
            rows_seen INTEGER NOT NULL DEFAULT 0,
            in_flight_revision INTEGER,
            planned_batches INTEGER,
            committed_batches INTEGER
        );

        CREATE TABLE IF NOT EXISTS conflict_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL,
            field TEXT NOT NULL,
            local_value TEXT NOT NULL,
            remote_value TEXT NOT NULL,
            row_index INTEGER,
            session_revision INTEGER NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_items_dirty ON items(dirty);
        CREATE INDEX IF NOT EXISTS idx_conflict_audit_item ON conflict_audit(item_id);
        "#,
    )?;

    connection.execute(
        "INSERT OR IGNORE INTO sync_cursor (id, revision, rows_seen) VALUES (1, 0, 0)",
        [],
    )?;
    Ok(())
}

fn should_attempt_recovery(err: &SqliteError, db_path: &Path) -> bool {
    if !db_path.exists() {
        return false;
    }

    match err {
        SqliteError::SqliteFailure(code, message) => {
            matches!(code.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
                || message
                    .as_deref()
                    .map(|msg| msg.contains("database disk image is malformed"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn quarantine_store(db_path: &Path) -> AppResult<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let target = sibling_with_suffix(db_path, &format!(".corrupt-{stamp}"));
    std::fs::rename(db_path, &target)?;
    remove_if_exists(&sibling_with_suffix(db_path, "-wal"))?;
    remove_if_exists(&sibling_with_suffix(db_path, "-shm"))?;
    Ok(target)
}

pub(crate) fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(err)),
    }
}

pub(crate) fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(suffix);
    path.with_file_name(name)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
