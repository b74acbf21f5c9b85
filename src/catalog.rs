use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{thread_rng, RngCore};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::now_timestamp;
use crate::errors::{AppError, AppResult};
use crate::schema;

const ITEM_ID_PREFIX: &str = "rb-";

/// The user-editable part of an item; what sync compares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFields {
    pub rug_no: String,
    pub name: String,
    pub collection: String,
    pub price: Option<f64>,
    pub width: Option<f64>,
    pub length: Option<f64>,
    pub qty: i64,
    pub photo: String,
}

impl ItemFields {
    /// Trimmed copy whose values the sheet parser will read back unchanged.
    pub fn normalized(&self) -> AppResult<Self> {
        let fields = Self {
            rug_no: self.rug_no.trim().to_string(),
            name: self.name.trim().to_string(),
            collection: self.collection.trim().to_string(),
            price: self.price,
            width: self.width,
            length: self.length,
            qty: self.qty,
            photo: self.photo.trim().to_string(),
        };
        schema::check_fields(&fields).map_err(|(field, reason)| AppError::InvalidItem {
            field: field.to_string(),
            reason,
        })?;
        Ok(fields)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryItem {
    pub id: String,
    pub fields: ItemFields,
    pub remote_row: Option<usize>,
    pub synced_marker: Option<String>,
    /// Per-item logical clock, bumped by every local mutation.
    pub last_modified: i64,
    pub dirty: bool,
    pub deleted: bool,
    pub updated_at: String,
    pub synced_at: Option<String>,
}

impl InventoryItem {
    pub fn is_synced(&self) -> bool {
        self.synced_marker.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InFlight {
    pub session_revision: i64,
    pub planned_batches: usize,
    pub committed_batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCursor {
    pub revision: i64,
    pub committed_at: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub rows_seen: usize,
    pub in_flight: Option<InFlight>,
}

pub fn new_item_id() -> String {
    let mut bytes = [0_u8; 9];
    thread_rng().fill_bytes(&mut bytes);
    format!("{ITEM_ID_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

const ITEM_COLUMNS: &str = "id, rug_no, name, collection, price, width, length, qty, photo_ref, \
     remote_row, synced_marker, last_modified, dirty, deleted, updated_at, synced_at";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<InventoryItem> {
    let remote_row: Option<i64> = row.get(9)?;
    Ok(InventoryItem {
        id: row.get(0)?,
        fields: ItemFields {
            rug_no: row.get(1)?,
            name: row.get(2)?,
            collection: row.get(3)?,
            price: row.get(4)?,
            width: row.get(5)?,
            length: row.get(6)?,
            qty: row.get(7)?,
            photo: row.get(8)?,
        },
        remote_row: remote_row.and_then(|r| usize::try_from(r).ok()),
        synced_marker: row.get(10)?,
        last_modified: row.get(11)?,
        dirty: row.get::<_, i64>(12)? != 0,
        deleted: row.get::<_, i64>(13)? != 0,
        updated_at: row.get(14)?,
        synced_at: row.get(15)?,
    })
}

pub fn create_item(connection: &Connection, fields: &ItemFields) -> AppResult<InventoryItem> {
    let fields = fields.normalized()?;
    let id = new_item_id();
    connection.execute(
        "INSERT INTO items (id, rug_no, name, collection, price, width, length, qty, photo_ref,
            last_modified, dirty, deleted, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, 1, 0, ?10)",
        params![
            id,
            fields.rug_no,
            fields.name,
            fields.collection,
            fields.price,
            fields.width,
            fields.length,
            fields.qty,
            fields.photo,
            now_timestamp()
        ],
    )?;
    require_item(connection, &id)
}

pub fn update_item(
    connection: &Connection,
    id: &str,
    fields: &ItemFields,
) -> AppResult<InventoryItem> {
    let fields = fields.normalized()?;
    let changed = connection.execute(
        "UPDATE items SET rug_no = ?2, name = ?3, collection = ?4, price = ?5, width = ?6,
            length = ?7, qty = ?8, photo_ref = ?9, last_modified = last_modified + 1,
            dirty = 1, updated_at = ?10
        WHERE id = ?1 AND deleted = 0",
        params![
            id,
            fields.rug_no,
            fields.name,
            fields.collection,
            fields.price,
            fields.width,
            fields.length,
            fields.qty,
            fields.photo,
            now_timestamp()
        ],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("item {id}")));
    }
    require_item(connection, id)
}

/// Deletes an item. Items that were ever synced leave a tombstone so the
/// deletion reaches the sheet; never-synced items are removed outright.
pub fn delete_item(connection: &Connection, id: &str) -> AppResult<()> {
    let item = get_item(connection, id)?
        .filter(|item| !item.deleted)
        .ok_or_else(|| AppError::NotFound(format!("item {id}")))?;
    if item.is_synced() || item.remote_row.is_some() {
        connection.execute(
            "UPDATE items SET deleted = 1, dirty = 1, last_modified = last_modified + 1,
                updated_at = ?2
            WHERE id = ?1",
            params![id, now_timestamp()],
        )?;
    } else {
        connection.execute("DELETE FROM items WHERE id = ?1", [id])?;
    }
    Ok(())
}

pub fn get_item(connection: &Connection, id: &str) -> AppResult<Option<InventoryItem>> {
    connection
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
            [id],
            item_from_row,
        )
        .optional()
        .map_err(AppError::from)
}

fn require_item(connection: &Connection, id: &str) -> AppResult<InventoryItem> {
    get_item(connection, id)?.ok_or_else(|| AppError::NotFound(format!("item {id}")))
}

/// Live items, ordered by creation.
pub fn list_items(connection: &Connection) -> AppResult<Vec<InventoryItem>> {
    let mut stmt = connection.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM items WHERE deleted = 0 ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every row including tombstones, as the reconciler sees them.
pub fn snapshot(connection: &Connection) -> AppResult<Vec<InventoryItem>> {
    let mut stmt = connection.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM items ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn dirty_count(connection: &Connection) -> AppResult<usize> {
    let count: i64 =
        connection.query_row("SELECT COUNT(*) FROM items WHERE dirty = 1", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Records a confirmed remote write. `dirty` is cleared only when the item
/// was not edited after the snapshot taken at `expected_seq`.
pub fn mark_synced(
    connection: &Connection,
    id: &str,
    expected_seq: i64,
    remote_row: usize,
    marker: &str,
) -> AppResult<bool> {
    let now = now_timestamp();
    connection.execute(
        "UPDATE items SET remote_row = ?2, synced_marker = ?3, synced_at = ?4 WHERE id = ?1",
        params![id, remote_row as i64, marker, now],
    )?;
    let cleared = connection.execute(
        "UPDATE items SET dirty = 0 WHERE id = ?1 AND last_modified = ?2",
        params![id, expected_seq],
    )?;
    Ok(cleared > 0)
}

/// Replaces local values with the sheet's. Skipped (returns false) when the
/// item changed after the snapshot; the bookkeeping is still refreshed so the
/// newer local edit is pushed next session.
pub fn overwrite_from_remote(
    connection: &Connection,
    id: &str,
    expected_seq: i64,
    fields: &ItemFields,
    remote_row: usize,
    marker: &str,
) -> AppResult<bool> {
    let now = now_timestamp();
    let changed = connection.execute(
        "UPDATE items SET rug_no = ?3, name = ?4, collection = ?5, price = ?6, width = ?7,
            length = ?8, qty = ?9, photo_ref = ?10, remote_row = ?11, synced_marker = ?12,
            deleted = 0, dirty = 0, updated_at = ?13, synced_at = ?13
        WHERE id = ?1 AND last_modified = ?2",
        params![
            id,
            expected_seq,
            fields.rug_no,
            fields.name,
            fields.collection,
            fields.price,
            fields.width,
            fields.length,
            fields.qty,
            fields.photo,
            remote_row as i64,
            marker,
            now
        ],
    )?;
    if changed == 0 {
        connection.execute(
            "UPDATE items SET remote_row = ?2, synced_marker = ?3, synced_at = ?4 WHERE id = ?1",
            params![id, remote_row as i64, marker, now],
        )?;
    }
    Ok(changed > 0)
}

pub fn import_item(
    connection: &Connection,
    id: &str,
    fields: &ItemFields,
    remote_row: usize,
    marker: &str,
) -> AppResult<bool> {
    let now = now_timestamp();
    let inserted = connection.execute(
        "INSERT OR IGNORE INTO items (id, rug_no, name, collection, price, width, length, qty,
            photo_ref, remote_row, synced_marker, last_modified, dirty, deleted, updated_at,
            synced_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, 0, 0, ?12, ?12)",
        params![
            id,
            fields.rug_no,
            fields.name,
            fields.collection,
            fields.price,
            fields.width,
            fields.length,
            fields.qty,
            fields.photo,
            remote_row as i64,
            marker,
            now
        ],
    )?;
    Ok(inserted > 0)
}

/// Physically removes an item (purged tombstone or a remote deletion),
/// unless it changed after the snapshot.
pub fn remove_item(connection: &Connection, id: &str, expected_seq: i64) -> AppResult<bool> {
    let removed = connection.execute(
        "DELETE FROM items WHERE id = ?1 AND last_modified = ?2",
        params![id, expected_seq],
    )?;
    Ok(removed > 0)
}

pub fn load_cursor(connection: &Connection) -> AppResult<SyncCursor> {
    let cursor = connection
        .query_row(
            "SELECT revision, committed_at, remote_fingerprint, rows_seen, in_flight_revision,
                planned_batches, committed_batches
            FROM sync_cursor WHERE id = 1",
            [],
            |row| {
                let in_flight_revision: Option<i64> = row.get(4)?;
                let planned: Option<i64> = row.get(5)?;
                let committed: Option<i64> = row.get(6)?;
                Ok(SyncCursor {
                    revision: row.get(0)?,
                    committed_at: row.get(1)?,
                    remote_fingerprint: row.get(2)?,
                    rows_seen: row.get::<_, i64>(3)? as usize,
                    in_flight: in_flight_revision.map(|session_revision| InFlight {
                        session_revision,
                        planned_batches: planned.unwrap_or(0) as usize,
                        committed_batches: committed.unwrap_or(0) as usize,
                    }),
                })
            },
        )
        .optional()?;
    Ok(cursor.unwrap_or_default())
}

pub fn record_progress(connection: &Connection, progress: &InFlight) -> AppResult<()> {
    connection.execute(
        "UPDATE sync_cursor SET in_flight_revision = ?1, planned_batches = ?2,
            committed_batches = ?3
        WHERE id = 1",
        params![
            progress.session_revision,
            progress.planned_batches as i64,
            progress.committed_batches as i64
        ],
    )?;
    Ok(())
}

/// Advances the cursor at the end of a fully successful session.
pub fn commit_cursor(
    connection: &Connection,
    revision: i64,
    remote_fingerprint: &str,
    rows_seen: usize,
) -> AppResult<SyncCursor> {
    connection.execute(
        "UPDATE sync_cursor SET revision = ?1, committed_at = ?2, remote_fingerprint = ?3,
            rows_seen = ?4, in_flight_revision = NULL, planned_batches = NULL,
            committed_batches = NULL
        WHERE id = 1",
        params![revision, now_timestamp(), remote_fingerprint, rows_seen as i64],
    )?;
    load_cursor(connection)
}

/// Forgets every sync mapping. The next session rebuilds it from `ItemId`s.
pub fn reset_sync(connection: &mut Connection) -> AppResult<()> {
    let tx = connection.transaction()?;
    tx.execute("DELETE FROM items WHERE deleted = 1 AND synced_marker IS NULL", [])?;
    tx.execute(
        "UPDATE items SET remote_row = NULL, synced_marker = NULL, synced_at = NULL
        WHERE deleted = 0",
        [],
    )?;
    tx.execute(
        "UPDATE sync_cursor SET revision = 0, committed_at = NULL, remote_fingerprint = NULL,
            rows_seen = 0, in_flight_revision = NULL, planned_batches = NULL,
            committed_batches = NULL
        WHERE id = 1",
        [],
    )?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_fields(name: &str) -> ItemFields {
    ItemFields {
        rug_no: format!("RN-{name}"),
        name: name.to_string(),
        collection: "Heriz".into(),
        price: Some(1250.0),
        width: Some(2.4),
        length: Some(3.1),
        qty: 1,
        photo: String::new(),
    }
}
