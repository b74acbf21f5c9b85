pub mod access;
pub mod audit;
pub mod auth;
pub mod backoff;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod db;
pub mod drive;
pub mod errors;
pub mod google;
pub mod journal;
pub mod reconcile;
pub mod schema;
pub mod settings;
pub mod sync;
pub mod updater;
pub mod worker;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection as SqlConnection;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::TokenSource;
use crate::credentials::{CredentialCheck, KeyFileCheck};
use crate::db::{bootstrap, DatabaseBootstrap, DatabaseContext};
use crate::errors::{CredentialError, SyncError};

pub use crate::access::{AccessReport, AccessVerifier};
pub use crate::auth::{ServiceAccountSession, StaticTokenSource};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::credentials::{Credential, CredentialIdentity, CredentialStore};
pub use crate::drive::{DriveBackup, DriveBackupReport};
pub use crate::errors::{AppError, AppResult, ErrorClass};
pub use crate::google::GoogleClient;
pub use crate::journal::SyncJournal;
pub use crate::settings::{SyncSettings, UpdateSyncSettingsPayload};
pub use crate::sync::{SessionState, SheetStore, SheetTarget, SyncEngine, SyncReport};
pub use crate::updater::{BatchOutcome, UpdatePackage, Updater};
pub use crate::worker::{SyncStatus, SyncWorker};

/// Everything a front end needs: catalog, settings, journal, and the sync
/// worker once a credential has been validated.
pub struct AppState {
    config: AppConfig,
    db: Arc<Mutex<SqlConnection>>,
    db_path: PathBuf,
    db_quarantined: Option<PathBuf>,
    settings_path: PathBuf,
    settings: Arc<Mutex<SyncSettings>>,
    journal: SyncJournal,
    link: Mutex<Option<GoogleLink>>,
}

/// A validated credential wired through to a client and a worker.
struct GoogleLink {
    tokens: Arc<dyn TokenSource>,
    client: GoogleClient,
    worker: Arc<SyncWorker>,
    auto_sync: Option<JoinHandle<()>>,
}

impl Drop for GoogleLink {
    fn drop(&mut self) {
        self.tokens.invalidate();
        if let Some(handle) = self.auto_sync.take() {
            handle.abort();
        }
    }
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        std::fs::create_dir_all(&config.data_dir)?;
        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            quarantined,
        } = bootstrap(&config.data_dir, &config.database_file_name)?;
        let settings_path = settings::settings_path(&config.data_dir);
        let settings = SyncSettings::load(&settings_path, &config)?;
        let journal = SyncJournal::new(config.logs_dir(), &config)?;

        if let Err(err) = journal.record(
            "app_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "quarantined": quarantined.is_some(),
            }),
        ) {
            warn!(?err, "failed to record app start in journal");
        }

        let state = Self {
            config,
            db: Arc::new(Mutex::new(connection)),
            db_path: path,
            db_quarantined: quarantined,
            settings_path,
            settings: Arc::new(Mutex::new(settings)),
            journal,
            link: Mutex::new(None),
        };
        state.restore_credential();
        Ok(state)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn connection(&self) -> Arc<Mutex<SqlConnection>> {
        Arc::clone(&self.db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn db_quarantined(&self) -> Option<&Path> {
        self.db_quarantined.as_deref()
    }

    pub fn journal(&self) -> &SyncJournal {
        &self.journal
    }

    pub fn settings(&self) -> SyncSettings {
        self.settings.lock().clone()
    }

    /// Applies `change` to the settings and writes them out.
    pub fn update_settings<F>(&self, change: F) -> AppResult<SyncSettings>
    where
        F: FnOnce(&mut SyncSettings) -> AppResult<()>,
    {
        let updated = {
            let mut settings = self.settings.lock();
            let mut draft = settings.clone();
            change(&mut draft)?;
            draft.persist(&self.settings_path)?;
            *settings = draft.clone();
            draft
        };
        self.configure_auto_sync();
        Ok(updated)
    }

    /// Replaces the active Google session. Refused while a sync runs.
    pub fn attach_tokens(&self, tokens: Arc<dyn TokenSource>) -> AppResult<()> {
        self.link(tokens, None)
    }

    /// Attaches a service-account session. Each sync session re-reads its key
    /// file first and stops if the file changed or a needed scope is gone.
    pub fn attach_session(&self, session: ServiceAccountSession) -> AppResult<()> {
        let credential = session.credential().clone();
        let tokens: Arc<dyn TokenSource> = Arc::new(session);
        let check = KeyFileCheck::new(&credential, Arc::clone(&tokens));
        self.link(tokens, Some(Arc::new(check)))
    }

    fn link(
        &self,
        tokens: Arc<dyn TokenSource>,
        check: Option<Arc<dyn CredentialCheck>>,
    ) -> AppResult<()> {
        let client = GoogleClient::new(&self.config, Arc::clone(&tokens))?;
        let mut engine = SyncEngine::new(
            Arc::clone(&self.db),
            Arc::new(client.clone()),
            &self.config,
        )
        .with_journal(self.journal.clone());
        if let Some(check) = check {
            engine = engine.with_credential_check(check);
        }
        let worker = Arc::new(SyncWorker::new(Arc::new(engine), Arc::clone(&self.db))?);
        {
            let mut link = self.link.lock();
            if link.as_ref().is_some_and(|link| link.worker.engine().is_running()) {
                return Err(SyncError::AlreadyRunning.into());
            }
            *link = Some(GoogleLink {
                tokens,
                client,
                worker,
                auto_sync: None,
            });
        }
        self.configure_auto_sync();
        Ok(())
    }

    pub fn detach_tokens(&self) -> AppResult<()> {
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(|link| link.worker.engine().is_running()) {
            return Err(SyncError::AlreadyRunning.into());
        }
        *link = None;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    pub fn google_client(&self) -> AppResult<GoogleClient> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.client.clone())
            .ok_or_else(|| CredentialError::NotConfigured.into())
    }

    pub fn worker(&self) -> Option<Arc<SyncWorker>> {
        self.link.lock().as_ref().map(|link| Arc::clone(&link.worker))
    }

    pub fn updater(&self) -> AppResult<Updater> {
        Ok(Updater::new(&self.config)?.with_journal(self.journal.clone()))
    }

    /// Starts or stops the periodic sync to match the settings. Needs a
    /// running tokio runtime; outside one it does nothing.
    fn configure_auto_sync(&self) {
        let mut link = self.link.lock();
        let Some(link) = link.as_mut() else {
            return;
        };
        if let Some(handle) = link.auto_sync.take() {
            handle.abort();
        }
        let (enabled, interval) = {
            let settings = self.settings.lock();
            (settings.auto_sync, settings.auto_sync_interval_secs)
        };
        if !enabled || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let settings = Arc::clone(&self.settings);
        link.auto_sync = Some(link.worker.spawn_auto_sync(
            std::time::Duration::from_secs(interval),
            move || settings.lock().sheet_target().ok(),
        ));
        info!(target: "sync", interval_secs = interval, "auto-sync enabled");
    }

    /// Re-opens the remembered key file without any network call. A key
    /// that changed on disk since it was validated is not trusted.
    fn restore_credential(&self) {
        let (path, expected) = {
            let settings = self.settings.lock();
            match (&settings.credential_path, &settings.credential_fingerprint) {
                (Some(path), Some(fingerprint)) => (path.clone(), fingerprint.clone()),
                _ => return,
            }
        };
        let credential = match CredentialStore::load(&path) {
            Ok(credential) if credential.fingerprint() == expected => credential,
            Ok(_) => {
                warn!(target: "credentials", path = %path.display(), "key file changed since validation");
                return;
            }
            Err(err) => {
                warn!(target: "credentials", error = %err, "remembered key file is unusable");
                return;
            }
        };
        let session = match ServiceAccountSession::new(
            credential,
            self.config.token_endpoint_override.as_deref(),
            self.config.http_timeout(),
        ) {
            Ok(session) => session,
            Err(err) => {
                warn!(target: "credentials", error = %err, "could not restore session");
                return;
            }
        };
        if let Err(err) = self.attach_session(session) {
            warn!(target: "credentials", error = %err, "could not restore session");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,rugbase=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}

/// Makes error text safe to show or journal: bearer tokens, raw access
/// tokens, and URL query strings are replaced.
pub fn sanitize_error_copy(message: &str) -> String {
    let mut redact_next = false;
    message
        .split(' ')
        .map(|word| {
            if redact_next {
                redact_next = false;
                return "[redacted]".to_string();
            }
            if word.eq_ignore_ascii_case("bearer") {
                redact_next = true;
                return word.to_string();
            }
            if word.trim_start_matches(['"', '\'', '(']).starts_with("ya29.") {
                return "[redacted]".to_string();
            }
            match (word.find("://"), word.find('?')) {
                (Some(scheme), Some(query)) if query > scheme => {
                    format!("{}?[redacted]", &word[..query])
                }
                _ => word.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use tempfile::tempdir;

    #[test]
    fn strips_tokens_and_query_strings() {
        let raw = "request to https://sheets.googleapis.com/v4/x?access_token=abc failed: Bearer ya29.secret rejected";
        let clean = sanitize_error_copy(raw);
        assert_eq!(
            clean,
            "request to https://sheets.googleapis.com/v4/x?[redacted] failed: Bearer [redacted] rejected"
        );
        assert_eq!(sanitize_error_copy("token ya29.abc leaked"), "token [redacted] leaked");
        assert_eq!(sanitize_error_copy("what? nothing"), "what? nothing");
    }

    #[test]
    fn initialize_creates_store_settings_and_journal() {
        let dir = tempdir().unwrap();
        let state = AppState::initialize(test_config(dir.path())).unwrap();
        assert!(state.db_path().exists());
        assert!(settings::settings_path(dir.path()).exists());
        assert!(state.journal().path().exists());
        assert!(!state.is_connected());
        assert!(matches!(
            state.google_client().err(),
            Some(AppError::Credential(CredentialError::NotConfigured))
        ));
        let events = state.journal().recent(10).unwrap();
        assert_eq!(events.last().unwrap().event, "app_start");
    }

    #[test]
    fn changed_key_file_is_not_restored() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("sa.json");
        std::fs::write(
            &key_path,
            credentials::fixtures::key_json("sync@rugbase.iam.gserviceaccount.com"),
        )
        .unwrap();
        {
            let state = AppState::initialize(test_config(dir.path())).unwrap();
            state
                .update_settings(|settings| {
                    settings.remember_credential(&key_path, "stale-fingerprint");
                    Ok(())
                })
                .unwrap();
        }
        let state = AppState::initialize(test_config(dir.path())).unwrap();
        assert!(!state.is_connected());

        let bytes = std::fs::read(&key_path).unwrap();
        state
            .update_settings(|settings| {
                settings.remember_credential(&key_path, &credentials::fingerprint(&bytes));
                Ok(())
            })
            .unwrap();
        let state = AppState::initialize(test_config(dir.path())).unwrap();
        assert!(state.is_connected());
    }

    #[tokio::test]
    async fn restored_session_stops_once_the_key_file_changes() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("sa.json");
        let original = credentials::fixtures::key_json("sync@rugbase.iam.gserviceaccount.com");
        std::fs::write(&key_path, &original).unwrap();
        {
            let state = AppState::initialize(test_config(dir.path())).unwrap();
            state
                .update_settings(|settings| {
                    settings.remember_credential(
                        &key_path,
                        &credentials::fingerprint(original.as_bytes()),
                    );
                    Ok(())
                })
                .unwrap();
        }
        let state = AppState::initialize(test_config(dir.path())).unwrap();
        let worker = state.worker().unwrap();

        std::fs::write(
            &key_path,
            credentials::fixtures::key_json("other@rugbase.iam.gserviceaccount.com"),
        )
        .unwrap();
        let target = SheetTarget {
            spreadsheet_id: "sheet-1".into(),
            worksheet: "items".into(),
        };
        let err = worker.run_now(target).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Credential(CredentialError::KeyChanged { .. })
        ));
        assert_eq!(worker.status().last_error.unwrap().class, ErrorClass::Credential);
    }
}
