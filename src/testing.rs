//! In-memory [`SheetStore`] with fault injection for engine tests.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::errors::{AppError, AppResult, CredentialError};
use crate::sync::{RowWrite, SheetStore, SheetTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Quota,
    Network,
    AuthExpired,
}

impl Fault {
    fn error(self) -> AppError {
        match self {
            Fault::Quota => AppError::QuotaExceeded {
                retry_after: Duration::ZERO,
            },
            Fault::Network => AppError::Network("connection reset by peer".into()),
            Fault::AuthExpired => AppError::Credential(CredentialError::AuthExpired),
        }
    }
}

pub(crate) struct MemorySheet {
    rows: Mutex<Vec<Vec<String>>>,
    write_attempts: Mutex<usize>,
    faults: Mutex<Vec<(usize, usize, Fault)>>,
    write_calls: Mutex<Vec<Vec<usize>>>,
    held: watch::Sender<bool>,
}

impl Default for MemorySheet {
    fn default() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            rows: Mutex::new(Vec::new()),
            write_attempts: Mutex::new(0),
            faults: Mutex::new(Vec::new()),
            write_calls: Mutex::new(Vec::new()),
            held,
        }
    }
}

impl MemorySheet {
    pub(crate) fn seed(&self, rows: Vec<Vec<String>>) {
        *self.rows.lock() = rows;
    }

    pub(crate) fn table(&self) -> Vec<Vec<String>> {
        self.rows.lock().clone()
    }

    /// Overwrites one cell as a person editing the sheet would.
    pub(crate) fn edit_cell(&self, row: usize, column: usize, value: &str) {
        let mut rows = self.rows.lock();
        let cells = &mut rows[row - 1];
        if cells.len() <= column {
            cells.resize(column + 1, String::new());
        }
        cells[column] = value.to_string();
    }

    /// Write attempts `first..first + count` (1-based) fail with `fault`.
    pub(crate) fn fail_call(&self, first: usize, count: usize, fault: Fault) {
        self.faults.lock().push((first, count, fault));
    }

    /// Row numbers of each successful write call.
    pub(crate) fn write_calls(&self) -> Vec<Vec<usize>> {
        self.write_calls.lock().clone()
    }

    pub(crate) fn rows_written(&self) -> Vec<usize> {
        self.write_calls.lock().iter().flatten().copied().collect()
    }

    /// Parks every write until [`MemorySheet::release_writes`].
    pub(crate) fn hold_writes(&self) {
        self.held.send_replace(true);
    }

    pub(crate) fn release_writes(&self) {
        self.held.send_replace(false);
    }

    fn next_fault(&self) -> Option<Fault> {
        let attempt = {
            let mut attempts = self.write_attempts.lock();
            *attempts += 1;
            *attempts
        };
        self.faults
            .lock()
            .iter()
            .find(|(first, count, _)| attempt >= *first && attempt < first + count)
            .map(|(_, _, fault)| *fault)
    }

    async fn wait_until_released(&self) {
        let mut held = self.held.subscribe();
        loop {
            let parked = *held.borrow_and_update();
            if !parked || held.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl SheetStore for MemorySheet {
    async fn fetch_table(&self, _target: &SheetTarget, max_rows: usize) -> AppResult<Vec<Vec<String>>> {
        let rows = self.rows.lock();
        let limit = (max_rows + 2).min(rows.len());
        Ok(rows[..limit]
            .iter()
            .map(|row| {
                let used = row
                    .iter()
                    .rposition(|cell| !cell.is_empty())
                    .map(|last| last + 1)
                    .unwrap_or(0);
                row[..used].to_vec()
            })
            .collect())
    }

    async fn write_rows(&self, _target: &SheetTarget, writes: &[RowWrite]) -> AppResult<()> {
        self.wait_until_released().await;
        if let Some(fault) = self.next_fault() {
            return Err(fault.error());
        }
        let mut rows = self.rows.lock();
        for write in writes {
            let index = write.row - 1;
            if rows.len() <= index {
                rows.resize(index + 1, Vec::new());
            }
            rows[index] = write.cells.clone();
        }
        self.write_calls
            .lock()
            .push(writes.iter().map(|write| write.row).collect());
        Ok(())
    }
}
