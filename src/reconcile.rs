//! Diffing of the local catalog against the fetched sheet.
//!
//! Planning is pure: it reads a snapshot of items and the raw table and
//! returns the remote writes to perform plus the local effect each one
//! unlocks. Nothing is applied here.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::catalog::{InventoryItem, ItemFields};
use crate::errors::SyncError;
use crate::schema::{
    self, check_header, content_hash, diff_fields, make_marker, parse_row, render_row,
    FieldConflict, HeaderState, RemoteRow, RowRejection, FIRST_DATA_ROW,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Appended,
    Pushed,
    Tombstoned,
    Linked,
    Pulled,
    Conflict,
    RemoteDeleted,
    Purged,
    Imported,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocalEffect {
    /// The sheet now holds the local state: record row and marker.
    Synced {
        item_id: String,
        expected_seq: i64,
        row: usize,
        marker: String,
    },
    /// Remote wins: replace local values, auditing `conflicts` first.
    Overwrite {
        item_id: String,
        expected_seq: i64,
        fields: ItemFields,
        row: usize,
        marker: String,
        conflicts: Vec<FieldConflict>,
    },
    Import {
        item_id: String,
        fields: ItemFields,
        row: usize,
        marker: String,
    },
    Remove {
        item_id: String,
        expected_seq: i64,
        row: Option<usize>,
        conflicts: Vec<FieldConflict>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub change: Change,
    pub effect: LocalEffect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub row: usize,
    pub cells: Vec<String>,
    pub planned: PlannedChange,
}

#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub session_revision: i64,
    pub header: HeaderState,
    /// Remote writes ordered by row.
    pub writes: Vec<PlannedWrite>,
    /// Effects that need no remote write.
    pub local_only: Vec<PlannedChange>,
    pub rejected: Vec<RowRejection>,
    pub rows_seen: usize,
}

impl SyncPlan {
    pub fn needs_header(&self) -> bool {
        self.header == HeaderState::Empty && !self.writes.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.local_only.is_empty()
    }

    /// Splits writes into consecutive batches of at most `batch_size`.
    pub fn batches(&self, batch_size: usize) -> Vec<&[PlannedWrite]> {
        self.writes.chunks(batch_size.max(1)).collect()
    }

    /// The table as it will look once every write has landed.
    pub fn projected_table(&self, table: &[Vec<String>]) -> Vec<Vec<String>> {
        let mut projected: Vec<Vec<String>> = if self.header == HeaderState::Empty {
            vec![schema::header_cells()]
        } else {
            table.to_vec()
        };
        for write in &self.writes {
            let index = write.row - 1;
            if projected.len() <= index {
                projected.resize(index + 1, Vec::new());
            }
            projected[index] = write.cells.clone();
        }
        projected
    }
}

pub struct Planner<F>
where
    F: FnMut() -> String,
{
    session_revision: i64,
    max_rows: usize,
    mint_id: F,
    writes: Vec<PlannedWrite>,
    local_only: Vec<PlannedChange>,
}

impl<F> Planner<F>
where
    F: FnMut() -> String,
{
    pub fn new(session_revision: i64, max_rows: usize, mint_id: F) -> Self {
        Self {
            session_revision,
            max_rows,
            mint_id,
            writes: Vec::new(),
            local_only: Vec::new(),
        }
    }

    pub fn plan(
        mut self,
        items: &[InventoryItem],
        table: &[Vec<String>],
    ) -> Result<SyncPlan, SyncError> {
        let header = check_header(table)?;
        let data_rows: &[Vec<String>] = match header {
            HeaderState::Empty => &[],
            HeaderState::Valid => &table[1..],
        };
        if data_rows.len() > self.max_rows {
            return Err(SyncError::RemoteTooLarge {
                rows: data_rows.len(),
                limit: self.max_rows,
            });
        }

        let mut rejected = Vec::new();
        // Ids whose row exists but could not be read; their items wait for a fix.
        let mut unreadable: HashSet<&str> = HashSet::new();
        let mut by_id: HashMap<&str, RemoteRow> = HashMap::new();
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        let mut ordered_ids: Vec<String> = Vec::new();
        let mut unidentified = Vec::new();
        for (offset, cells) in data_rows.iter().enumerate() {
            let row = FIRST_DATA_ROW + offset;
            match parse_row(row, cells) {
                Ok(None) => {}
                Ok(Some(remote)) if remote.item_id.is_empty() => unidentified.push(remote),
                Ok(Some(remote)) => {
                    if let Some(first) = first_seen.get(&remote.item_id) {
                        rejected.push(RowRejection {
                            row,
                            column: schema::HEADERS[0].to_string(),
                            reason: format!(
                                "duplicate ItemId '{}' (first seen on row {first})",
                                remote.item_id
                            ),
                        });
                        continue;
                    }
                    first_seen.insert(remote.item_id.clone(), row);
                    ordered_ids.push(remote.item_id.clone());
                    let key = cells[0].trim();
                    by_id.insert(key, remote);
                }
                Err(rejection) => {
                    let id = cells.first().map(|cell| cell.trim()).unwrap_or("");
                    if !id.is_empty() {
                        unreadable.insert(id);
                    }
                    rejected.push(rejection);
                }
            }
        }

        let mut next_free_row = FIRST_DATA_ROW + data_rows.len();
        let mut matched: HashSet<&str> = HashSet::new();
        for item in items {
            match by_id.get(item.id.as_str()) {
                Some(remote) => {
                    matched.insert(item.id.as_str());
                    self.plan_matched(item, remote);
                }
                None if unreadable.contains(item.id.as_str()) => {}
                None if item.deleted => self.local(
                    Change::Purged,
                    LocalEffect::Remove {
                        item_id: item.id.clone(),
                        expected_seq: item.last_modified,
                        row: None,
                        conflicts: Vec::new(),
                    },
                ),
                None => {
                    let row = next_free_row;
                    next_free_row += 1;
                    self.push_local_state(item, row, Change::Appended);
                }
            }
        }

        for id in &ordered_ids {
            if matched.contains(id.as_str()) {
                continue;
            }
            if let Some(remote) = by_id.get(id.as_str()) {
                if !remote.deleted {
                    self.plan_import(remote.item_id.clone(), remote);
                }
            }
        }
        for remote in &unidentified {
            if !remote.deleted {
                let id = (self.mint_id)();
                self.plan_import(id, remote);
            }
        }

        self.writes.sort_by_key(|write| write.row);
        Ok(SyncPlan {
            session_revision: self.session_revision,
            header,
            writes: self.writes,
            local_only: self.local_only,
            rejected,
            rows_seen: data_rows.len(),
        })
    }

    fn plan_matched(&mut self, item: &InventoryItem, remote: &RemoteRow) {
        let conflicts = diff_fields(&item.fields, item.deleted, &remote.fields, remote.deleted);
        let remote_changed =
            item.synced_marker.as_deref() != remote.marker.as_deref() || !remote.marker_is_valid();

        if conflicts.is_empty() {
            let bookkeeping_stale = item.dirty
                || item.remote_row != Some(remote.row)
                || item.synced_marker.as_deref() != remote.marker.as_deref();
            if item.deleted {
                self.local(
                    Change::Purged,
                    LocalEffect::Remove {
                        item_id: item.id.clone(),
                        expected_seq: item.last_modified,
                        row: Some(remote.row),
                        conflicts: Vec::new(),
                    },
                );
            } else if !remote.marker_is_valid() {
                self.push_local_state(item, remote.row, Change::Linked);
            } else if bookkeeping_stale {
                self.local(
                    Change::Linked,
                    LocalEffect::Synced {
                        item_id: item.id.clone(),
                        expected_seq: item.last_modified,
                        row: remote.row,
                        marker: remote.marker.clone().unwrap_or_default(),
                    },
                );
            }
            return;
        }

        match (item.dirty, remote_changed) {
            (true, false) if item.deleted => {
                let marker = self.marker_for(&item.id, &item.fields, true);
                self.write(
                    remote.row,
                    render_row(&item.id, &item.fields, true, &marker),
                    Change::Tombstoned,
                    LocalEffect::Remove {
                        item_id: item.id.clone(),
                        expected_seq: item.last_modified,
                        row: Some(remote.row),
                        conflicts: Vec::new(),
                    },
                );
            }
            (true, false) => self.push_local_state(item, remote.row, Change::Pushed),
            (dirty, _) => {
                let (change, conflicts) = if dirty {
                    (Change::Conflict, conflicts)
                } else {
                    (Change::Pulled, Vec::new())
                };
                self.accept_remote(item, remote, change, conflicts);
            }
        }
    }

    fn accept_remote(
        &mut self,
        item: &InventoryItem,
        remote: &RemoteRow,
        change: Change,
        conflicts: Vec<FieldConflict>,
    ) {
        let change = if remote.deleted && change == Change::Pulled {
            Change::RemoteDeleted
        } else {
            change
        };
        if remote.deleted {
            self.local(
                change,
                LocalEffect::Remove {
                    item_id: item.id.clone(),
                    expected_seq: item.last_modified,
                    row: Some(remote.row),
                    conflicts,
                },
            );
            return;
        }

        let (marker, stamp) = self.remote_marker(&item.id, remote);
        let effect = LocalEffect::Overwrite {
            item_id: item.id.clone(),
            expected_seq: item.last_modified,
            fields: remote.fields.clone(),
            row: remote.row,
            marker: marker.clone(),
            conflicts,
        };
        if stamp {
            let cells = render_row(&item.id, &remote.fields, false, &marker);
            self.write(remote.row, cells, change, effect);
        } else {
            self.local(change, effect);
        }
    }

    fn plan_import(&mut self, item_id: String, remote: &RemoteRow) {
        let needs_stamp = remote.item_id != item_id || !remote.marker_is_valid();
        let marker = if needs_stamp {
            self.marker_for(&item_id, &remote.fields, false)
        } else {
            remote.marker.clone().unwrap_or_default()
        };
        let effect = LocalEffect::Import {
            item_id: item_id.clone(),
            fields: remote.fields.clone(),
            row: remote.row,
            marker: marker.clone(),
        };
        if needs_stamp {
            let cells = render_row(&item_id, &remote.fields, false, &marker);
            self.write(remote.row, cells, Change::Imported, effect);
        } else {
            self.local(Change::Imported, effect);
        }
    }

    fn push_local_state(&mut self, item: &InventoryItem, row: usize, change: Change) {
        let marker = self.marker_for(&item.id, &item.fields, false);
        let cells = render_row(&item.id, &item.fields, false, &marker);
        self.write(
            row,
            cells,
            change,
            LocalEffect::Synced {
                item_id: item.id.clone(),
                expected_seq: item.last_modified,
                row,
                marker,
            },
        );
    }

    /// Keeps a valid remote marker, or mints one that must be stamped.
    fn remote_marker(&self, item_id: &str, remote: &RemoteRow) -> (String, bool) {
        match remote.marker.as_ref() {
            Some(marker) if remote.marker_is_valid() => (marker.clone(), false),
            _ => (self.marker_for(item_id, &remote.fields, remote.deleted), true),
        }
    }

    fn marker_for(&self, item_id: &str, fields: &ItemFields, deleted: bool) -> String {
        make_marker(self.session_revision, &content_hash(item_id, fields, deleted))
    }

    fn write(&mut self, row: usize, cells: Vec<String>, change: Change, effect: LocalEffect) {
        self.writes.push(PlannedWrite {
            row,
            cells,
            planned: PlannedChange { change, effect },
        });
    }

    fn local(&mut self, change: Change, effect: LocalEffect) {
        self.local_only.push(PlannedChange { change, effect });
    }
}

/// Convenience wrapper using random ids for unidentified rows.
pub fn plan(
    items: &[InventoryItem],
    table: &[Vec<String>],
    session_revision: i64,
    max_rows: usize,
) -> Result<SyncPlan, SyncError> {
    Planner::new(session_revision, max_rows, crate::catalog::new_item_id).plan(items, table)
}
