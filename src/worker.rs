//! Runs sync sessions off the caller's thread and publishes their status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::audit;
use crate::errors::{AppError, AppResult, ErrorClass};
use crate::sanitize_error_copy;
use crate::sync::{SessionGuard, SessionState, SheetTarget, SyncEngine, SyncReport};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusError {
    pub class: ErrorClass,
    pub message: String,
    pub guidance: String,
}

impl From<&AppError> for StatusError {
    fn from(err: &AppError) -> Self {
        Self {
            class: err.class(),
            message: sanitize_error_copy(&err.to_string()),
            guidance: err.guidance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SessionState,
    pub running: bool,
    pub last_error: Option<StatusError>,
    pub conflict_count: usize,
    pub last_report: Option<SyncReport>,
    pub last_success_at: Option<DateTime<Utc>>,
}

pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    db: Arc<Mutex<Connection>>,
    status: watch::Sender<SyncStatus>,
}

impl SyncWorker {
    pub fn new(engine: Arc<SyncEngine>, db: Arc<Mutex<Connection>>) -> AppResult<Self> {
        let conflict_count = audit::count(&db.lock())?;
        let (status, _) = watch::channel(SyncStatus {
            state: SessionState::Idle,
            running: false,
            last_error: None,
            conflict_count,
            last_report: None,
            last_success_at: None,
        });
        Ok(Self { engine, db, status })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Starts a session in the background. The session slot is claimed
    /// before this returns, so a second call fails until the session ends.
    pub fn start(self: &Arc<Self>, target: SheetTarget) -> AppResult<JoinHandle<()>> {
        let slot = self.engine.try_begin()?;
        self.status.send_modify(|status| status.running = true);
        let worker = Arc::clone(self);
        Ok(tokio::spawn(async move {
            if let Err(err) = worker.run_claimed(slot, target).await {
                debug!(target: "sync", error = %err, "background session ended with an error");
            }
        }))
    }

    pub fn request_cancel(&self) {
        self.engine.request_cancel();
    }

    /// Runs one session on the current task, relaying engine state changes.
    pub async fn run_now(&self, target: SheetTarget) -> AppResult<SyncReport> {
        let slot = self.engine.try_begin()?;
        self.run_claimed(slot, target).await
    }

    async fn run_claimed(&self, slot: SessionGuard, target: SheetTarget) -> AppResult<SyncReport> {
        let mut states = self.engine.subscribe_state();
        let run = self.engine.run_claimed(slot, &target);
        tokio::pin!(run);
        let mut relaying = true;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                changed = states.changed(), if relaying => {
                    if changed.is_err() {
                        relaying = false;
                        continue;
                    }
                    let state = *states.borrow_and_update();
                    self.status.send_modify(|status| {
                        status.state = state;
                        status.running = true;
                    });
                }
            }
        };

        let conflict_count = audit::count(&self.db.lock()).unwrap_or_else(|err| {
            warn!(target: "sync", ?err, "could not count conflict audit rows");
            self.status.borrow().conflict_count
        });
        self.status.send_modify(|status| {
            status.running = false;
            status.conflict_count = conflict_count;
            match &result {
                Ok(report) => {
                    status.state = SessionState::Committed;
                    status.last_error = None;
                    status.last_report = Some(report.clone());
                    status.last_success_at = Some(Utc::now());
                }
                Err(err) => {
                    status.state = SessionState::Failed;
                    status.last_error = Some(StatusError::from(err));
                }
            }
        });
        result
    }

    /// One auto-sync tick: runs a session unless one is already going or
    /// sync is not configured.
    pub async fn auto_sync_tick<F>(&self, target: &F) -> Option<AppResult<SyncReport>>
    where
        F: Fn() -> Option<SheetTarget>,
    {
        let Ok(slot) = self.engine.try_begin() else {
            debug!(target: "sync", "auto-sync tick skipped; session in progress");
            return None;
        };
        let target = target()?;
        Some(self.run_claimed(slot, target).await)
    }

    /// Ticks every `period` until the handle is aborted.
    pub fn spawn_auto_sync<F>(self: &Arc<Self>, period: Duration, target: F) -> JoinHandle<()>
    where
        F: Fn() -> Option<SheetTarget> + Send + Sync + 'static,
    {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Some(Err(err)) = worker.auto_sync_tick(&target).await {
                    warn!(target: "sync", error = %err, "auto-sync session failed");
                }
            }
        })
    }
}
