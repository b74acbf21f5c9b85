use std::path::Path;

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::info;

use crate::db::now_timestamp;
use crate::errors::AppResult;
use crate::schema::FieldConflict;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub item_id: String,
    pub field: String,
    pub local_value: String,
    pub remote_value: String,
    pub row_index: Option<i64>,
    pub session_revision: i64,
    pub recorded_at: String,
}

/// Stores the local values a remote-wins resolution is about to overwrite.
pub fn record(
    connection: &Connection,
    item_id: &str,
    row_index: Option<usize>,
    session_revision: i64,
    conflicts: &[FieldConflict],
) -> AppResult<usize> {
    let recorded_at = now_timestamp();
    let mut stmt = connection.prepare_cached(
        "INSERT INTO conflict_audit
            (item_id, field, local_value, remote_value, row_index, session_revision, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for conflict in conflicts {
        stmt.execute(params![
            item_id,
            conflict.field,
            conflict.local,
            conflict.remote,
            row_index.map(|row| row as i64),
            session_revision,
            recorded_at
        ])?;
        info!(
            target: "conflicts",
            item_id,
            field = conflict.field,
            row = ?row_index,
            session_revision,
            "remote value replaced a local edit"
        );
    }
    Ok(conflicts.len())
}

pub fn recent(connection: &Connection, limit: usize) -> AppResult<Vec<ConflictRecord>> {
    let mut stmt = connection.prepare(
        "SELECT id, item_id, field, local_value, remote_value, row_index, session_revision,
            recorded_at
        FROM conflict_audit
        ORDER BY id DESC
        LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(ConflictRecord {
                id: row.get(0)?,
                item_id: row.get(1)?,
                field: row.get(2)?,
                local_value: row.get(3)?,
                remote_value: row.get(4)?,
                row_index: row.get(5)?,
                session_revision: row.get(6)?,
                recorded_at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count(connection: &Connection) -> AppResult<usize> {
    let total: i64 =
        connection.query_row("SELECT COUNT(*) FROM conflict_audit", [], |row| row.get(0))?;
    Ok(total as usize)
}

/// Writes the whole trail, oldest first, as CSV.
pub fn export_csv(connection: &Connection, path: &Path) -> AppResult<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "id",
        "item_id",
        "field",
        "local_value",
        "remote_value",
        "row_index",
        "session_revision",
        "recorded_at",
    ])?;

    let mut stmt = connection.prepare(
        "SELECT id, item_id, field, local_value, remote_value, row_index, session_revision,
            recorded_at
        FROM conflict_audit ORDER BY id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut written = 0;
    while let Some(row) = rows.next()? {
        let row_index: Option<i64> = row.get(5)?;
        writer.write_record([
            row.get::<_, i64>(0)?.to_string(),
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row_index.map(|r| r.to_string()).unwrap_or_default(),
            row.get::<_, i64>(6)?.to_string(),
            row.get::<_, String>(7)?,
        ])?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use tempfile::tempdir;

    fn conflict(field: &'static str, local: &str, remote: &str) -> FieldConflict {
        FieldConflict {
            field,
            local: local.into(),
            remote: remote.into(),
        }
    }

    #[test]
    fn records_one_row_per_field() {
        let conn = open_in_memory().unwrap();
        let stored = record(
            &conn,
            "rb-1",
            Some(4),
            2,
            &[conflict("Price", "1250", "990"), conflict("Qty", "1", "0")],
        )
        .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(count(&conn).unwrap(), 2);

        let recent = recent(&conn, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].field, "Qty");
        assert_eq!(recent[0].row_index, Some(4));
    }

    #[test]
    fn exports_csv_with_commas_quoted() {
        let conn = open_in_memory().unwrap();
        record(&conn, "rb-9", Some(3), 1, &[conflict("Name", "Tabriz, fine", "Tabriz")]).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("exports/conflicts.csv");
        assert_eq!(export_csv(&conn, &path).unwrap(), 1);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "rb-9");
        assert_eq!(&rows[0][3], "Tabriz, fine");
    }
}
