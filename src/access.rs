//! Read/write capability checks for the configured spreadsheet and Drive folder.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::backoff::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::errors::{AccessError, AppError, AppResult};
use crate::google::GoogleClient;
use crate::schema::parse_spreadsheet_id;

const SPREADSHEET_RESOURCE: &str = "spreadsheet";
const DRIVE_FOLDER_RESOURCE: &str = "Drive folder";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetAccess {
    pub spreadsheet_id: String,
    pub title: String,
    pub worksheet: String,
    pub can_edit: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveAccess {
    pub folder_id: String,
    pub name: String,
    pub is_folder: bool,
    pub can_edit: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessReport {
    pub account_email: String,
    pub sheet: SheetAccess,
    pub drive: Option<DriveAccess>,
    pub checked_at: DateTime<Utc>,
}

pub struct AccessVerifier {
    client: GoogleClient,
    clock: Arc<dyn Clock>,
    check_timeout: Duration,
    retry_delay: Duration,
}

impl AccessVerifier {
    pub fn new(client: GoogleClient, config: &AppConfig) -> Self {
        Self {
            client,
            clock: Arc::new(SystemClock),
            check_timeout: config.access_check_timeout(),
            retry_delay: Duration::from_millis(config.access_retry_delay_ms),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Confirms the service account can open `sheet_ref`, find `worksheet`
    /// in it, and edit it.
    pub async fn check_sheet_access(&self, sheet_ref: &str, worksheet: &str) -> AppResult<SheetAccess> {
        let spreadsheet_id = parse_spreadsheet_id(sheet_ref).ok_or_else(|| {
            AppError::Config(format!("'{sheet_ref}' is not a spreadsheet id or URL"))
        })?;
        let metadata = self
            .check_with_retry(SPREADSHEET_RESOURCE, || {
                self.client.spreadsheet_metadata(&spreadsheet_id)
            })
            .await?;
        let found = metadata
            .worksheet(worksheet)
            .ok_or_else(|| AccessError::WorksheetMissing {
                title: worksheet.to_string(),
            })?;

        let file = self
            .check_with_retry(SPREADSHEET_RESOURCE, || {
                self.client.drive_file(&spreadsheet_id, SPREADSHEET_RESOURCE)
            })
            .await?;
        if !file.can_edit {
            return Err(self.forbidden(SPREADSHEET_RESOURCE));
        }

        info!(
            target: "access",
            spreadsheet_id = %spreadsheet_id,
            worksheet = %found.title,
            "spreadsheet access verified"
        );
        Ok(SheetAccess {
            spreadsheet_id,
            title: metadata.title.clone(),
            worksheet: found.title.clone(),
            can_edit: file.can_edit,
        })
    }

    pub async fn check_drive_access(&self, folder_id: &str) -> AppResult<DriveAccess> {
        let folder_id = folder_id.trim();
        if folder_id.is_empty() {
            return Err(AppError::Config("Drive folder id is empty".into()));
        }
        let file = self
            .check_with_retry(DRIVE_FOLDER_RESOURCE, || {
                self.client.drive_file(folder_id, DRIVE_FOLDER_RESOURCE)
            })
            .await?;
        if !file.can_edit {
            return Err(self.forbidden(DRIVE_FOLDER_RESOURCE));
        }
        let is_folder = file.mime_type == FOLDER_MIME_TYPE;
        if !is_folder {
            warn!(target: "access", folder_id, mime_type = %file.mime_type, "Drive id is not a folder");
        }
        info!(target: "access", folder_id, "Drive folder access verified");
        Ok(DriveAccess {
            folder_id: file.id,
            name: file.name,
            is_folder,
            can_edit: file.can_edit,
        })
    }

    /// Sheet check, plus the Drive folder when one is configured.
    pub async fn verify(
        &self,
        sheet_ref: &str,
        worksheet: &str,
        drive_folder: Option<&str>,
    ) -> AppResult<AccessReport> {
        let sheet = self.check_sheet_access(sheet_ref, worksheet).await?;
        let drive = match drive_folder.filter(|id| !id.trim().is_empty()) {
            Some(folder) => Some(self.check_drive_access(folder).await?),
            None => None,
        };
        Ok(AccessReport {
            account_email: self.client.account_email().to_string(),
            sheet,
            drive,
            checked_at: self.clock.now(),
        })
    }

    /// One bounded call with at most one retry on network trouble.
    async fn check_with_retry<T, F, Fut>(&self, resource: &str, call: F) -> AppResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut retried = false;
        loop {
            let outcome = match tokio::time::timeout(self.check_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Network(format!(
                    "no answer within {}s",
                    self.check_timeout.as_secs().max(1)
                ))),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(AppError::Network(message)) if !retried => {
                    warn!(target: "access", resource, %message, "access check failed; retrying once");
                    retried = true;
                    self.clock.sleep(self.retry_delay).await;
                }
                Err(AppError::Network(message)) => {
                    return Err(AccessError::Network {
                        resource: resource.to_string(),
                        message,
                    }
                    .into())
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn forbidden(&self, resource: &str) -> AppError {
        AccessError::Forbidden {
            resource: resource.to_string(),
            account_email: self.client.account_email().to_string(),
        }
        .into()
    }
}
