use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0} was not found")]
    NotFound(String),
    #[error("{field} is invalid: {reason}")]
    InvalidItem { field: String, reason: String },
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error("network request failed: {0}")]
    Network(String),
    #[error("Google API quota exceeded; retry in {}s", .retry_after.as_secs())]
    QuotaExceeded { retry_after: Duration },
    #[error("Google API returned {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("service account key file is invalid: {0}")]
    InvalidKeyFile(String),
    #[error("service account key is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("credential lacks required scopes: {}", .missing.join(", "))]
    InsufficientScope { missing: Vec<String> },
    #[error("service account key file {path} changed since it was validated")]
    KeyChanged { path: String },
    #[error("access token expired or was revoked; validate the credential again")]
    AuthExpired,
    #[error("token endpoint rejected the service account: {0}")]
    Rejected(String),
    #[error("no credential configured; choose a service account key in Sync Settings")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{resource} is not shared with {account_email}")]
    NotShared {
        resource: String,
        account_email: String,
    },
    #[error("{account_email} is not allowed to edit {resource}")]
    Forbidden {
        resource: String,
        account_email: String,
    },
    #[error("worksheet '{title}' was not found in the spreadsheet")]
    WorksheetMissing { title: String },
    #[error("could not reach Google while checking {resource}: {message}")]
    Network { resource: String, message: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync session is already running")]
    AlreadyRunning,
    #[error("remote sheet has {rows} rows, above the limit of {limit}")]
    RemoteTooLarge { rows: usize, limit: usize },
    #[error("remote header does not match the expected layout (column {column}: expected '{expected}', found '{found}')")]
    RemoteSchemaMismatch {
        column: usize,
        expected: String,
        found: String,
    },
    #[error("batch {batch} (rows {first_row}-{last_row}) failed: {source}")]
    BatchFailed {
        batch: usize,
        first_row: usize,
        last_row: usize,
        #[source]
        source: Box<AppError>,
    },
    #[error("sync cancelled after {committed} of {planned} batches")]
    Cancelled { committed: usize, planned: usize },
    #[error("sync settings are incomplete: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update source is misconfigured: {0}")]
    Configuration(String),
    #[error("could not read update manifest: {0}")]
    Manifest(String),
    #[error("update download failed: {0}")]
    Download(String),
    #[error("checksum mismatch for update package (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("update install failed: {0}")]
    Install(String),
    #[error("new version failed to start and was rolled back: {0}")]
    RolledBack(String),
}

/// Coarse taxonomy surfaced to the UI and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Credential,
    Access,
    Network,
    Quota,
    Conflict,
    Schema,
    Update,
    Busy,
    Validation,
    Internal,
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Credential(_) => ErrorClass::Credential,
            AppError::Access(AccessError::Network { .. }) | AppError::Network(_) => {
                ErrorClass::Network
            }
            AppError::Access(_) => ErrorClass::Access,
            AppError::QuotaExceeded { .. } => ErrorClass::Quota,
            AppError::InvalidItem { .. } => ErrorClass::Validation,
            AppError::Update(_) => ErrorClass::Update,
            AppError::Sync(SyncError::AlreadyRunning) => ErrorClass::Busy,
            AppError::Sync(SyncError::RemoteSchemaMismatch { .. })
            | AppError::Sync(SyncError::RemoteTooLarge { .. }) => ErrorClass::Schema,
            AppError::Sync(SyncError::BatchFailed { source, .. }) => source.class(),
            AppError::Sync(SyncError::NotConfigured(_)) => ErrorClass::Credential,
            AppError::Sync(SyncError::Cancelled { .. }) => ErrorClass::Busy,
            AppError::Api { status, .. } if *status >= 500 => ErrorClass::Network,
            _ => ErrorClass::Internal,
        }
    }

    /// Network and quota failures are worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Network | ErrorClass::Quota)
    }

    pub fn suggested_wait(&self) -> Option<Duration> {
        match self {
            AppError::QuotaExceeded { retry_after } => {
                Some(*retry_after).filter(|wait| !wait.is_zero())
            }
            AppError::Sync(SyncError::BatchFailed { source, .. }) => source.suggested_wait(),
            _ => None,
        }
    }

    pub fn guidance(&self) -> String {
        match self {
            AppError::Credential(CredentialError::AuthExpired) => {
                "Verify the service account key again, then restart the sync.".into()
            }
            AppError::Credential(CredentialError::NotConfigured) => {
                "Choose a service account JSON key in Sync Settings.".into()
            }
            AppError::Credential(CredentialError::KeyChanged { .. }) => {
                "The key file was replaced. Validate it again in Sync Settings.".into()
            }
            AppError::Credential(CredentialError::InsufficientScope { missing }) => format!(
                "The service account's token lacks {}. Enable the Sheets and Drive APIs for its project, then validate the key again.",
                missing.join(" and ")
            ),
            AppError::Credential(_) => {
                "Download a fresh JSON key for the service account from the Google Cloud console."
                    .into()
            }
            AppError::Access(AccessError::NotShared { account_email, .. })
            | AppError::Access(AccessError::Forbidden { account_email, .. }) => format!(
                "Share the spreadsheet and Drive folder with {account_email} as an Editor."
            ),
            AppError::Access(AccessError::WorksheetMissing { title }) => {
                format!("Create a worksheet named '{title}' or fix the title in Sync Settings.")
            }
            AppError::InvalidItem { field, .. } => {
                format!("Enter a non-negative number for {field}, then save again.")
            }
            AppError::Sync(SyncError::Cancelled { .. }) => {
                "Sync stopped early. Finished batches are kept; the next sync completes the rest."
                    .into()
            }
            AppError::Sync(SyncError::NotConfigured(missing)) => {
                format!("Fill in {missing} in Sync Settings.")
            }
            _ => match self.class() {
                ErrorClass::Network => "Check the internet connection and try again later.".into(),
                ErrorClass::Quota => match self.suggested_wait() {
                    Some(wait) => format!(
                        "Google is rate limiting requests; wait about {}s and retry.",
                        wait.as_secs().max(1)
                    ),
                    None => "Google is rate limiting requests; retry later.".into(),
                },
                ErrorClass::Schema => {
                    "The sheet layout changed. Restore the header row or reset sync.".into()
                }
                ErrorClass::Busy => "A sync is already in progress.".into(),
                ErrorClass::Update => {
                    "The update was not installed; the current version is still in place.".into()
                }
                _ => "Unexpected error; see the log for details.".into(),
            },
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return AppError::Network(crate::sanitize_error_copy(&err.to_string()));
        }
        match err.status() {
            Some(status) => AppError::Api {
                status: status.as_u16(),
                message: crate::sanitize_error_copy(&err.to_string()),
            },
            None => AppError::Network(crate::sanitize_error_copy(&err.to_string())),
        }
    }
}
