//! One reconciliation session: fetch, diff, apply in batches, commit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit;
use crate::backoff::{BackoffPolicy, Clock, SystemClock};
use crate::catalog::{self, InFlight};
use crate::config::AppConfig;
use crate::credentials::CredentialCheck;
use crate::errors::{AppResult, SyncError};
use crate::journal::SyncJournal;
use crate::reconcile::{self, Change, LocalEffect, PlannedChange, PlannedWrite};
use crate::sanitize_error_copy;
use crate::schema::{header_cells, table_fingerprint};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetTarget {
    pub spreadsheet_id: String,
    pub worksheet: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWrite {
    pub row: usize,
    pub cells: Vec<String>,
}

/// Where the remote rows live. Implemented by the Google client and by the
/// in-memory sheet used in tests.
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// Header row plus up to `max_rows + 1` data rows.
    async fn fetch_table(&self, target: &SheetTarget, max_rows: usize) -> AppResult<Vec<Vec<String>>>;
    /// Writes whole rows; replaying the same call is harmless.
    async fn write_rows(&self, target: &SheetTarget, writes: &[RowWrite]) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Fetching,
    Diffing,
    Applying,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub revision: i64,
    pub appended: usize,
    pub updated: usize,
    pub deleted: usize,
    pub imported: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub rejected_rows: usize,
    pub batches: usize,
    pub retries: u32,
    pub duration_ms: u64,
}

impl SyncReport {
    fn count(&mut self, change: Change) {
        match change {
            Change::Appended => self.appended += 1,
            Change::Pushed => self.updated += 1,
            Change::Tombstoned | Change::RemoteDeleted => self.deleted += 1,
            Change::Imported => self.imported += 1,
            Change::Pulled => self.pulled += 1,
            Change::Conflict | Change::Linked | Change::Purged => {}
        }
    }
}

pub struct SyncEngine {
    db: Arc<Mutex<Connection>>,
    store: Arc<dyn SheetStore>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
    batch_size: usize,
    max_rows: usize,
    journal: Option<SyncJournal>,
    credential_check: Option<Arc<dyn CredentialCheck>>,
    running: Arc<AtomicBool>,
    cancel: watch::Sender<bool>,
    state: watch::Sender<SessionState>,
}

/// The engine's single session slot, held until dropped.
#[must_use = "the session slot is released as soon as the guard is dropped"]
pub struct SessionGuard {
    slot: Arc<AtomicBool>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(db: Arc<Mutex<Connection>>, store: Arc<dyn SheetStore>, config: &AppConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            db,
            store,
            clock: Arc::new(SystemClock),
            policy: config.backoff_policy(),
            batch_size: config.sync_batch_size.max(1),
            max_rows: config.sync_max_rows,
            journal: None,
            credential_check: None,
            running: Arc::new(AtomicBool::new(false)),
            cancel,
            state,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_journal(mut self, journal: SyncJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs `check` before every session; a failure ends the session
    /// before the sheet is touched.
    pub fn with_credential_check(mut self, check: Arc<dyn CredentialCheck>) -> Self {
        self.credential_check = Some(check);
        self
    }

    /// Claims the session slot, or fails with `AlreadyRunning`.
    pub fn try_begin(&self) -> Result<SessionGuard, SyncError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::AlreadyRunning)?;
        Ok(SessionGuard {
            slot: Arc::clone(&self.running),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Asks the running session to stop at its next batch boundary.
    pub fn request_cancel(&self) {
        if self.is_running() {
            info!(target: "sync", "cancellation requested");
            self.cancel.send_replace(true);
        }
    }

    /// Forgets all sync bookkeeping; refused while a session runs.
    pub fn reset_sync(&self) -> AppResult<()> {
        let _slot = self.try_begin()?;
        catalog::reset_sync(&mut self.db.lock())?;
        info!(target: "sync", "sync state reset");
        self.journal_event("sync_reset", json!({}));
        Ok(())
    }

    pub async fn run(&self, target: &SheetTarget) -> AppResult<SyncReport> {
        let slot = self.try_begin()?;
        self.run_claimed(slot, target).await
    }

    /// Runs a session in a slot already claimed with [`SyncEngine::try_begin`].
    pub async fn run_claimed(
        &self,
        slot: SessionGuard,
        target: &SheetTarget,
    ) -> AppResult<SyncReport> {
        debug_assert!(Arc::ptr_eq(&slot.slot, &self.running));
        let _slot = slot;
        self.cancel.send_replace(false);
        let started = Instant::now();

        let result = self.run_session(target).await;
        match &result {
            Ok(report) => {
                self.state.send_replace(SessionState::Committed);
                info!(
                    target: "sync",
                    revision = report.revision,
                    appended = report.appended,
                    updated = report.updated,
                    deleted = report.deleted,
                    imported = report.imported,
                    pulled = report.pulled,
                    conflicts = report.conflicts,
                    rejected = report.rejected_rows,
                    batches = report.batches,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sync session committed"
                );
            }
            Err(err) => {
                self.state.send_replace(SessionState::Failed);
                warn!(target: "sync", error = %err, class = ?err.class(), "sync session failed");
                self.journal_event(
                    "session_failed",
                    json!({
                        "class": err.class(),
                        "error": sanitize_error_copy(&err.to_string()),
                    }),
                );
            }
        }
        result.map(|mut report| {
            report.duration_ms = started.elapsed().as_millis() as u64;
            report
        })
    }

    async fn run_session(&self, target: &SheetTarget) -> AppResult<SyncReport> {
        if let Some(check) = &self.credential_check {
            check.check()?;
        }
        self.state.send_replace(SessionState::Fetching);
        let cursor = catalog::load_cursor(&self.db.lock())?;
        let session_revision = cursor.revision + 1;
        let mut report = SyncReport {
            revision: cursor.revision,
            ..SyncReport::default()
        };
        self.journal_event(
            "session_started",
            json!({ "revision": session_revision, "worksheet": target.worksheet }),
        );

        let max_rows = self.max_rows;
        let table = self
            .with_retries(&mut report.retries, || {
                self.store.fetch_table(target, max_rows)
            })
            .await?;

        self.state.send_replace(SessionState::Diffing);
        // Edits made from here on carry a newer edit sequence and wait for the next session.
        let items = catalog::snapshot(&self.db.lock())?;
        let fingerprint = table_fingerprint(&table);
        let nothing_dirty = !items.iter().any(|item| item.dirty);
        if nothing_dirty
            && cursor.in_flight.is_none()
            && cursor.remote_fingerprint.as_deref() == Some(fingerprint.as_str())
        {
            debug!(target: "sync", revision = cursor.revision, "sheet unchanged and nothing dirty");
            return Ok(report);
        }

        let plan = reconcile::plan(&items, &table, session_revision, self.max_rows)?;
        report.rejected_rows = plan.rejected.len();
        for rejection in &plan.rejected {
            warn!(
                target: "sync",
                row = rejection.row,
                column = %rejection.column,
                reason = %rejection.reason,
                "skipping unreadable sheet row"
            );
        }

        if !plan.local_only.is_empty() {
            let mut conn = self.db.lock();
            let tx = conn.transaction()?;
            for planned in &plan.local_only {
                apply_effect(&tx, planned, session_revision, &mut report)?;
            }
            tx.commit()?;
        }

        self.state.send_replace(SessionState::Applying);
        let batches = plan.batches(self.batch_size);
        let planned = batches.len();
        let mut progress = InFlight {
            session_revision,
            planned_batches: planned,
            committed_batches: 0,
        };
        if planned > 0 {
            catalog::record_progress(&self.db.lock(), &progress)?;
        }

        for (index, batch) in batches.iter().enumerate() {
            if self.cancel_requested() {
                return Err(SyncError::Cancelled {
                    committed: index,
                    planned,
                }
                .into());
            }
            let mut writes: Vec<RowWrite> = Vec::with_capacity(batch.len() + 1);
            if index == 0 && plan.needs_header() {
                writes.push(RowWrite {
                    row: 1,
                    cells: header_cells(),
                });
            }
            writes.extend(batch.iter().map(|write| RowWrite {
                row: write.row,
                cells: write.cells.clone(),
            }));

            self.write_batch(target, &writes, &mut report.retries)
                .await
                .map_err(|source| SyncError::BatchFailed {
                    batch: index + 1,
                    first_row: writes.first().map(|w| w.row).unwrap_or(0),
                    last_row: writes.last().map(|w| w.row).unwrap_or(0),
                    source: Box::new(source),
                })?;

            progress.committed_batches = index + 1;
            self.commit_batch(batch, &progress, &mut report)?;
            report.batches += 1;
            debug!(
                target: "sync",
                batch = index + 1,
                planned,
                rows = batch.len(),
                "batch committed"
            );
            self.journal_event(
                "batch_committed",
                json!({
                    "revision": session_revision,
                    "batch": index + 1,
                    "planned": planned,
                    "rows": batch.len(),
                }),
            );
        }

        let projected = plan.projected_table(&table);
        let rows_seen = projected.len().saturating_sub(1);
        let committed = catalog::commit_cursor(
            &self.db.lock(),
            session_revision,
            &table_fingerprint(&projected),
            rows_seen,
        )?;
        report.revision = committed.revision;
        self.journal_event(
            "session_committed",
            json!({
                "revision": report.revision,
                "appended": report.appended,
                "updated": report.updated,
                "deleted": report.deleted,
                "imported": report.imported,
                "pulled": report.pulled,
                "conflicts": report.conflicts,
                "rejected_rows": report.rejected_rows,
                "batches": report.batches,
            }),
        );
        Ok(report)
    }

    async fn write_batch(
        &self,
        target: &SheetTarget,
        writes: &[RowWrite],
        retries: &mut u32,
    ) -> AppResult<()> {
        self.with_retries(retries, || self.store.write_rows(target, writes))
            .await
    }

    /// Runs `op`, retrying transient failures with backoff. The wait between
    /// attempts goes through the clock and is cut short by cancellation.
    async fn with_retries<T, F, Fut>(&self, retries: &mut u32, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut backoff = self.policy.start();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    let Some(delay) =
                        backoff.record_failure(&self.policy, self.clock.now(), err.suggested_wait())
                    else {
                        return Err(err);
                    };
                    *retries += 1;
                    warn!(
                        target: "sync",
                        attempt = backoff.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; backing off"
                    );
                    if self.pause(delay).await {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Sleeps for `delay` unless cancelled first. Returns true when cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        let cancel = self.cancel.subscribe();
        tokio::select! {
            _ = self.clock.sleep(delay) => {}
            _ = wait_for_cancel(cancel) => {}
        }
        self.cancel_requested()
    }

    fn cancel_requested(&self) -> bool {
        let requested = *self.cancel.borrow();
        requested
    }

    fn commit_batch(
        &self,
        batch: &[PlannedWrite],
        progress: &InFlight,
        report: &mut SyncReport,
    ) -> AppResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for write in batch {
            apply_effect(&tx, &write.planned, progress.session_revision, report)?;
        }
        catalog::record_progress(&tx, progress)?;
        tx.commit()?;
        Ok(())
    }

    fn journal_event(&self, event: &str, payload: serde_json::Value) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record(event, payload) {
                warn!(target: "sync", ?err, event, "failed to append journal entry");
            }
        }
    }
}

async fn wait_for_cancel(mut cancel: watch::Receiver<bool>) {
    loop {
        let requested = *cancel.borrow_and_update();
        if requested {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Applies one planned local effect inside the caller's transaction.
fn apply_effect(
    conn: &Connection,
    planned: &PlannedChange,
    session_revision: i64,
    report: &mut SyncReport,
) -> AppResult<()> {
    let applied = match &planned.effect {
        LocalEffect::Synced {
            item_id,
            expected_seq,
            row,
            marker,
        } => {
            if !catalog::mark_synced(conn, item_id, *expected_seq, *row, marker)? {
                debug!(target: "sync", item_id = %item_id, "item edited during sync; stays dirty");
            }
            true
        }
        LocalEffect::Overwrite {
            item_id,
            expected_seq,
            fields,
            row,
            marker,
            conflicts,
        } => {
            let applied =
                catalog::overwrite_from_remote(conn, item_id, *expected_seq, fields, *row, marker)?;
            if applied && !conflicts.is_empty() {
                audit::record(conn, item_id, Some(*row), session_revision, conflicts)?;
            }
            applied
        }
        LocalEffect::Import {
            item_id,
            fields,
            row,
            marker,
        } => catalog::import_item(conn, item_id, fields, *row, marker)?,
        LocalEffect::Remove {
            item_id,
            expected_seq,
            row,
            conflicts,
        } => {
            let applied = catalog::remove_item(conn, item_id, *expected_seq)?;
            if applied && !conflicts.is_empty() {
                audit::record(conn, item_id, *row, session_revision, conflicts)?;
            }
            applied
        }
    };

    if !applied {
        debug!(
            target: "sync",
            change = ?planned.change,
            "local effect skipped; item changed after the snapshot"
        );
        return Ok(());
    }
    if planned.change == Change::Conflict {
        report.conflicts += 1;
    }
    report.count(planned.change);
    Ok(())
}
