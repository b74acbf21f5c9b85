//! Catalog backups in the verified Drive folder.
//!
//! A backup is a `VACUUM INTO` copy of the live store, so it is consistent
//! even while the app keeps writing. Drive already holding the same bytes
//! (same md5) means there is nothing to upload.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::db::remove_if_exists;
use crate::errors::{AppError, AppResult, SyncError};
use crate::google::GoogleClient;
use crate::journal::SyncJournal;

pub const BACKUP_FILE_NAME: &str = "rugbase.db";
const SNAPSHOT_FILE_NAME: &str = "catalog-snapshot.db";
const SQLITE_MIME_TYPE: &str = "application/x-sqlite3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveBackupReport {
    pub file_id: String,
    pub name: String,
    pub md5: String,
    pub bytes: u64,
    pub uploaded: bool,
    pub checked_at: DateTime<Utc>,
}

pub struct DriveBackup {
    client: GoogleClient,
    db: Arc<Mutex<Connection>>,
    staging_dir: PathBuf,
    journal: Option<SyncJournal>,
}

impl DriveBackup {
    pub fn new(client: GoogleClient, db: Arc<Mutex<Connection>>, staging_dir: PathBuf) -> Self {
        Self {
            client,
            db,
            staging_dir,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: SyncJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Snapshots the catalog and stores it as `rugbase.db` in `folder_id`.
    pub async fn backup_catalog(&self, folder_id: &str) -> AppResult<DriveBackupReport> {
        let bytes = self.snapshot()?;
        self.upload_snapshot(folder_id, BACKUP_FILE_NAME, bytes).await
    }

    /// Creates or replaces `name` in `folder_id`; skipped when Drive reports
    /// the same md5 for the file already there.
    pub async fn upload_snapshot(
        &self,
        folder_id: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> AppResult<DriveBackupReport> {
        let folder_id = folder_id.trim();
        if folder_id.is_empty() {
            return Err(SyncError::NotConfigured("the Drive folder".into()).into());
        }
        let md5 = format!("{:x}", md5::compute(&bytes));
        let existing = self.client.drive_find_child(folder_id, name).await?;

        if let Some(file) = &existing {
            let unchanged = file
                .md5_checksum
                .as_deref()
                .is_some_and(|remote| remote.eq_ignore_ascii_case(&md5));
            if unchanged {
                info!(target: "drive", file_id = %file.id, %md5, "backup already current; upload skipped");
                return Ok(self.finish(file.id.clone(), name, md5, bytes.len(), false));
            }
        }

        let stored = self
            .client
            .drive_upload(
                folder_id,
                existing.as_ref().map(|file| file.id.as_str()),
                name,
                SQLITE_MIME_TYPE,
                &bytes,
            )
            .await?;
        if let Some(remote) = stored.md5_checksum.as_deref() {
            if !remote.eq_ignore_ascii_case(&md5) {
                warn!(target: "drive", file_id = %stored.id, %remote, expected = %md5, "backup checksum mismatch");
                return Err(AppError::Network(format!(
                    "Drive stored the backup with checksum {remote}, expected {md5}"
                )));
            }
        }
        info!(
            target: "drive",
            file_id = %stored.id,
            replaced = existing.is_some(),
            bytes = bytes.len(),
            "catalog backed up to Drive"
        );
        Ok(self.finish(stored.id, name, md5, bytes.len(), true))
    }

    fn snapshot(&self) -> AppResult<Vec<u8>> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let path = self.staging_dir.join(SNAPSHOT_FILE_NAME);
        remove_if_exists(&path)?;
        self.db
            .lock()
            .execute("VACUUM INTO ?1", [path.to_string_lossy().to_string()])?;
        let bytes = std::fs::read(&path)?;
        remove_if_exists(&path)?;
        debug!(target: "drive", bytes = bytes.len(), "catalog snapshot taken");
        Ok(bytes)
    }

    fn finish(
        &self,
        file_id: String,
        name: &str,
        md5: String,
        bytes: usize,
        uploaded: bool,
    ) -> DriveBackupReport {
        let report = DriveBackupReport {
            file_id,
            name: name.to_string(),
            md5,
            bytes: bytes as u64,
            uploaded,
            checked_at: Utc::now(),
        };
        if let Some(journal) = &self.journal {
            let payload = json!({
                "fileId": report.file_id,
                "md5": report.md5,
                "bytes": report.bytes,
                "uploaded": report.uploaded,
            });
            if let Err(err) = journal.record("drive_backup", payload) {
                warn!(target: "drive", ?err, "failed to journal drive backup");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use httptest::{matchers::*, responders::*, Expectation, Server};

    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::catalog::{self, sample_fields};
    use crate::config::test_config;
    use crate::db::open_in_memory;

    const FOLDER: &str = "folder-1";

    fn backup(server: &Server, staging: &Path) -> DriveBackup {
        let mut config = test_config(staging);
        config.drive_api_base = server.url("/drive/v3").to_string();
        let tokens = Arc::new(StaticTokenSource::new(
            "ya29.t",
            "sync@rugbase.iam.gserviceaccount.com",
        ));
        let client = GoogleClient::new(&config, tokens).unwrap();
        let db = Arc::new(Mutex::new(open_in_memory().unwrap()));
        catalog::create_item(&db.lock(), &sample_fields("Heriz")).unwrap();
        DriveBackup::new(client, db, staging.join("backups"))
    }

    fn listing(files: serde_json::Value) -> Expectation {
        Expectation::matching(all_of![
            request::method_path("GET", "/drive/v3/files"),
            request::query(url_decoded(contains(("q", matches("'folder-1' in parents"))))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({ "files": files })))
    }

    #[tokio::test]
    async fn identical_backup_is_not_uploaded_again() {
        let server = Server::run();
        let dir = tempfile::tempdir().unwrap();
        let digest = format!("{:x}", md5::compute(b"catalog bytes"));
        server.expect(listing(json!([
            { "id": "file-9", "name": BACKUP_FILE_NAME, "md5Checksum": digest }
        ])));

        let report = backup(&server, dir.path())
            .upload_snapshot(FOLDER, BACKUP_FILE_NAME, b"catalog bytes".to_vec())
            .await
            .unwrap();
        assert!(!report.uploaded);
        assert_eq!(report.file_id, "file-9");
        assert_eq!(report.md5, digest);
    }

    #[tokio::test]
    async fn first_backup_creates_the_file_in_the_folder() {
        let server = Server::run();
        let dir = tempfile::tempdir().unwrap();
        let digest = format!("{:x}", md5::compute(b"catalog bytes"));
        server.expect(listing(json!([])));
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/upload/drive/v3/files"),
                request::query(url_decoded(contains(("uploadType", "multipart")))),
                request::headers(contains(("content-type", matches("^multipart/related; boundary=")))),
                request::body(matches("\"parents\":\\[\"folder-1\"\\]")),
                request::body(matches("catalog bytes")),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "id": "file-1",
                "name": BACKUP_FILE_NAME,
                "md5Checksum": digest
            }))),
        );

        let report = backup(&server, dir.path())
            .upload_snapshot(FOLDER, BACKUP_FILE_NAME, b"catalog bytes".to_vec())
            .await
            .unwrap();
        assert!(report.uploaded);
        assert_eq!(report.file_id, "file-1");
        assert_eq!(report.bytes, 13);
    }

    #[tokio::test]
    async fn changed_backup_replaces_the_existing_file() {
        let server = Server::run();
        let dir = tempfile::tempdir().unwrap();
        server.expect(listing(json!([
            { "id": "file-9", "name": BACKUP_FILE_NAME, "md5Checksum": "0".repeat(32) }
        ])));
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PATCH", "/upload/drive/v3/files/file-9"),
                request::query(url_decoded(contains(("uploadType", "multipart")))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({ "id": "file-9", "name": BACKUP_FILE_NAME }))),
        );

        let report = backup(&server, dir.path())
            .upload_snapshot(FOLDER, BACKUP_FILE_NAME, b"catalog bytes".to_vec())
            .await
            .unwrap();
        assert!(report.uploaded);
        assert_eq!(report.file_id, "file-9");
    }

    #[tokio::test]
    async fn upload_with_a_different_checksum_is_an_error() {
        let server = Server::run();
        let dir = tempfile::tempdir().unwrap();
        server.expect(listing(json!([])));
        server.expect(
            Expectation::matching(request::method_path("POST", "/upload/drive/v3/files"))
                .respond_with(json_encoded(json!({ "id": "file-1", "md5Checksum": "f".repeat(32) }))),
        );

        let err = backup(&server, dir.path())
            .upload_snapshot(FOLDER, BACKUP_FILE_NAME, b"catalog bytes".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn catalog_snapshot_is_a_sqlite_file_and_staging_is_cleaned() {
        let server = Server::run();
        let dir = tempfile::tempdir().unwrap();
        server.expect(listing(json!([])));
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/upload/drive/v3/files"),
                request::body(matches("SQLite format 3")),
            ])
            .times(1)
            .respond_with(json_encoded(json!({ "id": "file-1" }))),
        );

        let backup = backup(&server, dir.path());
        let report = backup.backup_catalog(FOLDER).await.unwrap();
        assert!(report.uploaded);
        assert!(report.bytes > 0);
        assert!(!dir.path().join("backups").join(SNAPSHOT_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn blank_folder_is_a_settings_error() {
        let server = Server::run();
        let dir = tempfile::tempdir().unwrap();
        let err = backup(&server, dir.path())
            .upload_snapshot("  ", BACKUP_FILE_NAME, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Sync(SyncError::NotConfigured(_))));
    }
}
