//! Layout of the inventory worksheet and the row-level projection of items.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::catalog::ItemFields;
use crate::errors::SyncError;

pub const HEADERS: [&str; 11] = [
    "ItemId",
    "RugNo",
    "Name",
    "Collection",
    "Price",
    "Width",
    "Length",
    "Qty",
    "Photo",
    "Deleted",
    "SyncMarker",
];

pub const COLUMN_COUNT: usize = HEADERS.len();
pub const FIRST_DATA_ROW: usize = 2;
const DELETED_COLUMN: usize = 9;
const MARKER_COLUMN: usize = 10;
const MARKER_HASH_LEN: usize = 16;

/// Zero-based column index to its A1 letters (`0 -> A`, `26 -> AA`).
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

pub fn quote_title(title: &str) -> String {
    let simple = title
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && title.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        title.to_string()
    } else {
        format!("'{}'", title.replace('\'', "''"))
    }
}

pub fn row_range(title: &str, row: usize) -> String {
    let last = column_letter(COLUMN_COUNT - 1);
    format!("{}!A{row}:{last}{row}", quote_title(title))
}

/// Range covering the header plus one row beyond `max_rows`, so an oversized
/// sheet is detectable without reading it whole.
pub fn table_range(title: &str, max_rows: usize) -> String {
    let last = column_letter(COLUMN_COUNT - 1);
    format!("{}!A1:{last}{}", quote_title(title), max_rows + 2)
}

/// Accepts a bare spreadsheet id or any Google Sheets URL.
pub fn parse_spreadsheet_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(idx) = trimmed.find("/spreadsheets/d/") {
        let rest = &trimmed[idx + "/spreadsheets/d/".len()..];
        let id: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        return (!id.is_empty()).then_some(id);
    }
    trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        .then(|| trimmed.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Nothing on the sheet yet; the header is written with the first batch.
    Empty,
    Valid,
}

pub fn check_header(table: &[Vec<String>]) -> Result<HeaderState, SyncError> {
    let Some(header) = table.first() else {
        return Ok(HeaderState::Empty);
    };
    if table.len() == 1 && header.iter().all(|cell| cell.trim().is_empty()) {
        return Ok(HeaderState::Empty);
    }
    for (index, expected) in HEADERS.iter().enumerate() {
        let found = header.get(index).map(|cell| cell.trim()).unwrap_or("");
        if found != *expected {
            return Err(SyncError::RemoteSchemaMismatch {
                column: index + 1,
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
    }
    Ok(HeaderState::Valid)
}

pub fn header_cells() -> Vec<String> {
    HEADERS.iter().map(|h| h.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    pub row: usize,
    pub item_id: String,
    pub fields: ItemFields,
    pub deleted: bool,
    pub marker: Option<String>,
}

impl RemoteRow {
    pub fn content_hash(&self) -> String {
        content_hash(&self.item_id, &self.fields, self.deleted)
    }

    /// The marker was written by this engine and the cells still match it.
    pub fn marker_is_valid(&self) -> bool {
        self.marker
            .as_deref()
            .and_then(marker_hash)
            .map(|hash| hash == self.content_hash())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowRejection {
    pub row: usize,
    pub column: String,
    pub reason: String,
}

impl RowRejection {
    fn new(row: usize, column: usize, reason: impl Into<String>) -> Self {
        Self {
            row,
            column: HEADERS[column].to_string(),
            reason: reason.into(),
        }
    }
}

/// Parses one data row. Blank rows yield `Ok(None)`.
pub fn parse_row(row: usize, cells: &[String]) -> Result<Option<RemoteRow>, RowRejection> {
    if cells.iter().all(|cell| cell.trim().is_empty()) {
        return Ok(None);
    }
    let cell = |index: usize| cells.get(index).map(|c| c.trim()).unwrap_or("");

    let fields = ItemFields {
        rug_no: cell(1).to_string(),
        name: cell(2).to_string(),
        collection: cell(3).to_string(),
        price: parse_decimal(cell(4)).map_err(|reason| RowRejection::new(row, 4, reason))?,
        width: parse_decimal(cell(5)).map_err(|reason| RowRejection::new(row, 5, reason))?,
        length: parse_decimal(cell(6)).map_err(|reason| RowRejection::new(row, 6, reason))?,
        qty: parse_quantity(cell(7)).map_err(|reason| RowRejection::new(row, 7, reason))?,
        photo: cell(8).to_string(),
    };
    let deleted = parse_flag(cell(DELETED_COLUMN))
        .map_err(|reason| RowRejection::new(row, DELETED_COLUMN, reason))?;
    let marker = Some(cell(MARKER_COLUMN).to_string()).filter(|m| !m.is_empty());

    Ok(Some(RemoteRow {
        row,
        item_id: cell(0).to_string(),
        fields,
        deleted,
        marker,
    }))
}

/// Applies the row parser's numeric rules to local values, so anything kept
/// locally reads back from the sheet. Returns the offending column and reason.
pub fn check_fields(fields: &ItemFields) -> Result<(), (&'static str, String)> {
    let cells = field_cells(fields);
    for column in [4, 5, 6] {
        parse_decimal(&cells[column - 1]).map_err(|reason| (HEADERS[column], reason))?;
    }
    parse_quantity(&cells[6]).map_err(|reason| (HEADERS[7], reason))?;
    Ok(())
}

pub fn render_row(item_id: &str, fields: &ItemFields, deleted: bool, marker: &str) -> Vec<String> {
    let mut cells = Vec::with_capacity(COLUMN_COUNT);
    cells.push(item_id.to_string());
    cells.extend(field_cells(fields));
    cells.push(render_flag(deleted));
    cells.push(marker.to_string());
    cells
}

/// Canonical text of the data columns `RugNo..=Photo`.
pub fn field_cells(fields: &ItemFields) -> Vec<String> {
    vec![
        fields.rug_no.clone(),
        fields.name.clone(),
        fields.collection.clone(),
        render_decimal(fields.price),
        render_decimal(fields.width),
        render_decimal(fields.length),
        fields.qty.to_string(),
        fields.photo.clone(),
    ]
}

pub fn content_hash(item_id: &str, fields: &ItemFields, deleted: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item_id.as_bytes());
    for cell in field_cells(fields) {
        hasher.update([0x1f]);
        hasher.update(cell.as_bytes());
    }
    hasher.update([0x1f]);
    hasher.update(render_flag(deleted).as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()[..MARKER_HASH_LEN]
        .to_string()
}

pub fn make_marker(revision: i64, hash: &str) -> String {
    format!("{revision}.{hash}")
}

pub fn marker_hash(marker: &str) -> Option<&str> {
    let (revision, hash) = marker.split_once('.')?;
    (revision.parse::<i64>().is_ok() && hash.len() == MARKER_HASH_LEN).then_some(hash)
}

/// Digest of the whole fetched table; equal fingerprints mean no remote edits.
pub fn table_fingerprint(table: &[Vec<String>]) -> String {
    let mut hasher = Sha256::new();
    let populated = table
        .iter()
        .rposition(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|last| last + 1)
        .unwrap_or(0);
    for row in &table[..populated] {
        let used = row
            .iter()
            .rposition(|cell| !cell.trim().is_empty())
            .map(|last| last + 1)
            .unwrap_or(0);
        for cell in &row[..used] {
            hasher.update(cell.trim().as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0x1e]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldConflict {
    pub field: &'static str,
    pub local: String,
    pub remote: String,
}

/// Field-by-field differences between a local item and its remote row.
pub fn diff_fields(
    local: &ItemFields,
    local_deleted: bool,
    remote: &ItemFields,
    remote_deleted: bool,
) -> Vec<FieldConflict> {
    let mut conflicts: Vec<FieldConflict> = field_cells(local)
        .into_iter()
        .zip(field_cells(remote))
        .enumerate()
        .filter(|(_, (l, r))| l != r)
        .map(|(offset, (local, remote))| FieldConflict {
            field: HEADERS[offset + 1],
            local,
            remote,
        })
        .collect();
    if local_deleted != remote_deleted {
        conflicts.push(FieldConflict {
            field: HEADERS[DELETED_COLUMN],
            local: render_flag(local_deleted),
            remote: render_flag(remote_deleted),
        });
    }
    conflicts
}

fn render_decimal(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn render_flag(value: bool) -> String {
    if value { "TRUE" } else { "FALSE" }.to_string()
}

fn parse_decimal(raw: &str) -> Result<Option<f64>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | ' '))
        .collect();
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(Some(value)),
        _ => Err(format!("'{raw}' is not a non-negative number")),
    }
}

fn parse_quantity(raw: &str) -> Result<i64, String> {
    if raw.is_empty() {
        return Ok(0);
    }
    if let Ok(value) = raw.parse::<i64>() {
        if value >= 0 {
            return Ok(value);
        }
    }
    match raw.parse::<f64>() {
        Ok(value) if value >= 0.0 && value.fract() == 0.0 && value < i64::MAX as f64 => {
            Ok(value as i64)
        }
        _ => Err(format!("'{raw}' is not a whole, non-negative quantity")),
    }
}

fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "" | "false" | "0" | "no" | "n" => Ok(false),
        "true" | "1" | "yes" | "y" | "x" => Ok(true),
        _ => Err(format!("'{raw}' is not TRUE or FALSE")),
    }
}
