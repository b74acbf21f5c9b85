//! The API a front end calls. Every failure comes back as a
//! [`CommandError`] carrying the error class and guidance copy.

use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::access::{AccessReport, AccessVerifier};
use crate::audit::{self, ConflictRecord};
use crate::auth::{ServiceAccountSession, TokenSource};
use crate::catalog::{self, InventoryItem, ItemFields, SyncCursor};
use crate::config::PublicAppConfig;
use crate::credentials::{CredentialIdentity, CredentialStore};
use crate::drive::{DriveBackup, DriveBackupReport};
use crate::errors::{AppError, ErrorClass, SyncError, UpdateError};
use crate::journal::JournalEntry;
use crate::sanitize_error_copy;
use crate::settings::{SyncSettings, UpdateSyncSettingsPayload};
use crate::sync::SessionState;
use crate::updater::{InstallReport, UpdatePackage};
use crate::worker::SyncStatus;
use crate::AppState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub class: ErrorClass,
    pub message: String,
    pub guidance: String,
}

impl From<AppError> for CommandError {
    fn from(err: AppError) -> Self {
        Self {
            class: err.class(),
            message: sanitize_error_copy(&err.to_string()),
            guidance: err.guidance(),
        }
    }
}

impl From<UpdateError> for CommandError {
    fn from(err: UpdateError) -> Self {
        AppError::from(err).into()
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.message, self.guidance)
    }
}

impl std::error::Error for CommandError {}

pub type CommandResult<T> = Result<T, CommandError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundationHealth {
    pub db_path: String,
    pub db_quarantined: Option<String>,
    pub journal_path: String,
    pub connected: bool,
    pub pending_changes: usize,
    pub cursor: SyncCursor,
    pub config: PublicAppConfig,
}

pub fn foundation_health(state: &AppState) -> CommandResult<FoundationHealth> {
    let (pending_changes, cursor) = {
        let db = state.connection();
        let conn = db.lock();
        (catalog::dirty_count(&conn)?, catalog::load_cursor(&conn)?)
    };
    Ok(FoundationHealth {
        db_path: state.db_path().to_string_lossy().to_string(),
        db_quarantined: state
            .db_quarantined()
            .map(|path| path.to_string_lossy().to_string()),
        journal_path: state.journal().path().to_string_lossy().to_string(),
        connected: state.is_connected(),
        pending_changes,
        cursor,
        config: state.config().public_profile(),
    })
}

/// Loads the key file, proves the token endpoint accepts it, and checks the
/// scopes it actually granted. On success the key path and fingerprint are
/// remembered.
pub async fn validate_credential(
    state: &AppState,
    key_path: &Path,
) -> CommandResult<CredentialIdentity> {
    let credential = CredentialStore::load(key_path).map_err(AppError::from)?;
    let identity = credential.identity();

    let session = ServiceAccountSession::new(
        credential,
        state.config().token_endpoint_override.as_deref(),
        state.config().http_timeout(),
    )?;
    session.access_token().await?;
    CredentialStore::validate_granted(session.credential(), session.granted_scopes())
        .map_err(AppError::from)?;
    state.attach_session(session)?;
    state.update_settings(|settings| {
        settings.remember_credential(key_path, &identity.fingerprint);
        Ok(())
    })?;
    info!(
        target: "credentials",
        client_email = %identity.client_email,
        "service account validated"
    );
    Ok(identity)
}

pub fn forget_credential(state: &AppState) -> CommandResult<()> {
    state.detach_tokens()?;
    state.update_settings(|settings| {
        settings.forget_credential();
        Ok(())
    })?;
    Ok(())
}

/// Checks access to the configured spreadsheet, worksheet, and Drive folder.
pub async fn check_access(state: &AppState) -> CommandResult<AccessReport> {
    let settings = state.settings();
    let target = settings.sheet_target().map_err(AppError::from)?;
    let verifier = AccessVerifier::new(state.google_client()?, state.config());
    let report = verifier
        .verify(
            &target.spreadsheet_id,
            &target.worksheet,
            settings.drive_folder_id.as_deref(),
        )
        .await?;
    Ok(report)
}

/// Starts a session in the background and returns immediately.
pub async fn start_sync(state: &AppState) -> CommandResult<SyncStatus> {
    let worker = state
        .worker()
        .ok_or_else(|| AppError::from(crate::errors::CredentialError::NotConfigured))?;
    let target = state.settings().sheet_target().map_err(AppError::from)?;
    worker.start(target)?;
    Ok(worker.status())
}

/// Uploads a snapshot of the catalog to the configured Drive folder.
pub async fn backup_to_drive(state: &AppState) -> CommandResult<DriveBackupReport> {
    let folder_id = state
        .settings()
        .drive_folder_id
        .ok_or_else(|| AppError::from(SyncError::NotConfigured("the Drive folder".into())))?;
    let backup = DriveBackup::new(
        state.google_client()?,
        state.connection(),
        state.config().backups_dir(),
    )
    .with_journal(state.journal().clone());
    Ok(backup.backup_catalog(&folder_id).await?)
}

/// Runs a session to completion on the calling task.
pub async fn sync_now(state: &AppState) -> CommandResult<crate::sync::SyncReport> {
    let worker = state
        .worker()
        .ok_or_else(|| AppError::from(crate::errors::CredentialError::NotConfigured))?;
    let target = state.settings().sheet_target().map_err(AppError::from)?;
    Ok(worker.run_now(target).await?)
}

pub fn get_sync_status(state: &AppState) -> CommandResult<SyncStatus> {
    if let Some(worker) = state.worker() {
        return Ok(worker.status());
    }
    let conflict_count = audit::count(&state.connection().lock())?;
    Ok(SyncStatus {
        state: SessionState::Idle,
        running: false,
        last_error: None,
        conflict_count,
        last_report: None,
        last_success_at: None,
    })
}

pub fn cancel_sync(state: &AppState) -> CommandResult<()> {
    if let Some(worker) = state.worker() {
        worker.request_cancel();
    }
    Ok(())
}

pub fn reset_sync(state: &AppState) -> CommandResult<()> {
    match state.worker() {
        Some(worker) => worker.engine().reset_sync()?,
        None => catalog::reset_sync(&mut state.connection().lock())?,
    }
    Ok(())
}

pub fn get_settings(state: &AppState) -> SyncSettings {
    state.settings()
}

pub fn update_settings(
    state: &AppState,
    payload: UpdateSyncSettingsPayload,
) -> CommandResult<SyncSettings> {
    let running = state
        .worker()
        .is_some_and(|worker| worker.engine().is_running());
    if running && (payload.spreadsheet.is_some() || payload.worksheet.is_some()) {
        return Err(AppError::from(SyncError::AlreadyRunning).into());
    }
    Ok(state.update_settings(|settings| settings.apply_patch(&payload))?)
}

pub async fn check_for_update(state: &AppState) -> CommandResult<Option<UpdatePackage>> {
    let updater = state.updater()?;
    Ok(updater.check_for_update().await?)
}

/// Installs `package`; the new version takes over on the next start.
pub async fn apply_update(state: &AppState, package: UpdatePackage) -> CommandResult<InstallReport> {
    let updater = state.updater()?;
    Ok(updater.apply_update(&package).await?)
}

pub fn list_items(state: &AppState) -> CommandResult<Vec<InventoryItem>> {
    Ok(catalog::list_items(&state.connection().lock())?)
}

pub fn create_item(state: &AppState, fields: ItemFields) -> CommandResult<InventoryItem> {
    Ok(catalog::create_item(&state.connection().lock(), &fields)?)
}

pub fn update_item(state: &AppState, id: &str, fields: ItemFields) -> CommandResult<InventoryItem> {
    Ok(catalog::update_item(&state.connection().lock(), id, &fields)?)
}

pub fn delete_item(state: &AppState, id: &str) -> CommandResult<()> {
    Ok(catalog::delete_item(&state.connection().lock(), id)?)
}

pub fn recent_conflicts(state: &AppState, limit: usize) -> CommandResult<Vec<ConflictRecord>> {
    Ok(audit::recent(&state.connection().lock(), limit)?)
}

pub fn export_conflicts(state: &AppState, path: &Path) -> CommandResult<usize> {
    Ok(audit::export_csv(&state.connection().lock(), path)?)
}

pub fn recent_journal(state: &AppState, limit: usize) -> CommandResult<Vec<JournalEntry>> {
    Ok(state.journal().recent(limit)?)
}
