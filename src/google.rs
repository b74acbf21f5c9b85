use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::TokenSource;
use crate::config::AppConfig;
use crate::credentials::{DRIVE_SCOPE, SHEETS_SCOPE};
use crate::errors::{AccessError, AppError, AppResult, CredentialError};
use crate::sanitize_error_copy;
use crate::schema::{row_range, table_range};
use crate::sync::{RowWrite, SheetStore, SheetTarget};

const RATE_LIMIT_REASONS: &[&str] = &[
    "ratelimitexceeded",
    "userratelimitexceeded",
    "rate_limit_exceeded",
    "quotaexceeded",
    "resource_exhausted",
];

const SCOPE_REASONS: &[&str] = &[
    "access_token_scope_insufficient",
    "insufficientpermissions",
    "insufficient authentication scopes",
];

/// Thin client for the Sheets v4 and Drive v3 REST APIs.
#[derive(Clone)]
pub struct GoogleClient {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    sheets_api_base: String,
    drive_api_base: String,
    drive_upload_base: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorksheetInfo {
    pub sheet_id: i64,
    pub title: String,
    pub row_count: Option<u64>,
    pub column_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpreadsheetMetadata {
    pub spreadsheet_id: String,
    pub title: String,
    pub worksheets: Vec<WorksheetInfo>,
}

impl SpreadsheetMetadata {
    /// Case-insensitive lookup; Sheets itself treats titles that way.
    pub fn worksheet(&self, title: &str) -> Option<&WorksheetInfo> {
        let wanted = title.trim().to_lowercase();
        self.worksheets
            .iter()
            .find(|sheet| sheet.title.trim().to_lowercase() == wanted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriveFileInfo {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub can_edit: bool,
    pub trashed: bool,
}

/// A file stored in a Drive folder, as files.list and uploads report it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveStoredFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub md5_checksum: Option<String>,
}

impl GoogleClient {
    pub fn new(config: &AppConfig, tokens: Arc<dyn TokenSource>) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("rugbase/", env!("CARGO_PKG_VERSION")))
            .timeout(config.http_timeout())
            .build()?;
        Ok(Self {
            http,
            tokens,
            sheets_api_base: config.sheets_api_base.trim_end_matches('/').to_string(),
            drive_api_base: config.drive_api_base.trim_end_matches('/').to_string(),
            drive_upload_base: upload_base(&config.drive_api_base)?,
        })
    }

    pub fn account_email(&self) -> &str {
        self.tokens.account_email()
    }

    pub async fn spreadsheet_metadata(&self, spreadsheet_id: &str) -> AppResult<SpreadsheetMetadata> {
        let mut url = self.api_url(&self.sheets_api_base, &["spreadsheets", spreadsheet_id])?;
        url.query_pairs_mut().append_pair(
            "fields",
            "spreadsheetId,properties.title,sheets.properties(sheetId,title,gridProperties)",
        );
        let response = self
            .send("spreadsheet", || self.http.get(url.clone()))
            .await?;
        let raw: SpreadsheetRaw = response.json().await?;
        Ok(SpreadsheetMetadata {
            spreadsheet_id: raw.spreadsheet_id.unwrap_or_else(|| spreadsheet_id.to_string()),
            title: raw.properties.map(|p| p.title).unwrap_or_default(),
            worksheets: raw
                .sheets
                .into_iter()
                .map(|sheet| WorksheetInfo {
                    sheet_id: sheet.properties.sheet_id,
                    title: sheet.properties.title,
                    row_count: sheet.properties.grid_properties.as_ref().and_then(|g| g.row_count),
                    column_count: sheet
                        .properties
                        .grid_properties
                        .as_ref()
                        .and_then(|g| g.column_count),
                })
                .collect(),
        })
    }

    pub async fn drive_file(&self, file_id: &str, resource: &str) -> AppResult<DriveFileInfo> {
        let mut url = self.api_url(&self.drive_api_base, &["files", file_id])?;
        url.query_pairs_mut()
            .append_pair("fields", "id,name,mimeType,trashed,capabilities(canEdit)")
            .append_pair("supportsAllDrives", "true");
        let response = self.send(resource, || self.http.get(url.clone())).await?;
        let raw: DriveFileRaw = response.json().await?;
        Ok(DriveFileInfo {
            id: raw.id,
            name: raw.name,
            mime_type: raw.mime_type,
            can_edit: raw.capabilities.map(|c| c.can_edit).unwrap_or(false),
            trashed: raw.trashed,
        })
    }

    /// Newest non-trashed file called `name` directly inside `folder_id`.
    pub async fn drive_find_child(
        &self,
        folder_id: &str,
        name: &str,
    ) -> AppResult<Option<DriveStoredFile>> {
        let mut url = self.api_url(&self.drive_api_base, &["files"])?;
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            drive_literal(name),
            drive_literal(folder_id)
        );
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("fields", "files(id,name,md5Checksum)")
            .append_pair("orderBy", "modifiedTime desc")
            .append_pair("pageSize", "1")
            .append_pair("supportsAllDrives", "true")
            .append_pair("includeItemsFromAllDrives", "true");
        let response = self.send("Drive folder", || self.http.get(url.clone())).await?;
        let raw: DriveFileListRaw = response.json().await?;
        Ok(raw.files.into_iter().next())
    }

    /// Multipart upload: creates the file in `folder_id`, or replaces the
    /// content of `existing_id`.
    pub async fn drive_upload(
        &self,
        folder_id: &str,
        existing_id: Option<&str>,
        name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> AppResult<DriveStoredFile> {
        let (mut url, metadata) = match existing_id {
            Some(id) => (
                self.api_url(&self.drive_upload_base, &["files", id])?,
                json!({ "name": name, "mimeType": mime_type }),
            ),
            None => (
                self.api_url(&self.drive_upload_base, &["files"])?,
                json!({ "name": name, "mimeType": mime_type, "parents": [folder_id] }),
            ),
        };
        url.query_pairs_mut()
            .append_pair("uploadType", "multipart")
            .append_pair("supportsAllDrives", "true")
            .append_pair("fields", "id,name,md5Checksum");

        let boundary = format!("rugbase-part-{:x}", md5::compute(bytes));
        let body = multipart_related(&boundary, &metadata, mime_type, bytes);
        let content_type = format!("multipart/related; boundary={boundary}");
        let response = self
            .send("Drive folder", || {
                let request = match existing_id {
                    Some(_) => self.http.patch(url.clone()),
                    None => self.http.post(url.clone()),
                };
                request
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(body.clone())
            })
            .await?;
        Ok(response.json().await?)
    }

    pub async fn values_get(&self, spreadsheet_id: &str, range: &str) -> AppResult<Vec<Vec<String>>> {
        let mut url =
            self.api_url(&self.sheets_api_base, &["spreadsheets", spreadsheet_id, "values", range])?;
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "FORMATTED_VALUE");
        let response = self.send("spreadsheet", || self.http.get(url.clone())).await?;
        let raw: ValueRangeRaw = response.json().await?;
        Ok(raw
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    pub async fn values_batch_update(
        &self,
        spreadsheet_id: &str,
        data: Vec<(String, Vec<String>)>,
    ) -> AppResult<usize> {
        let url = self.api_url(
            &self.sheets_api_base,
            &["spreadsheets", spreadsheet_id, "values:batchUpdate"],
        )?;
        let body = json!({
            "valueInputOption": "RAW",
            "data": data
                .iter()
                .map(|(range, cells)| json!({
                    "range": range,
                    "majorDimension": "ROWS",
                    "values": [cells],
                }))
                .collect::<Vec<_>>(),
        });
        let response = self
            .send("spreadsheet", || self.http.post(url.clone()).json(&body))
            .await?;
        let raw: BatchUpdateRaw = response.json().await.unwrap_or_default();
        Ok(raw.total_updated_rows.unwrap_or(data.len()))
    }

    fn api_url(&self, base: &str, segments: &[&str]) -> AppResult<Url> {
        let mut url = Url::parse(base)
            .map_err(|err| AppError::Config(format!("invalid Google API base URL: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config("invalid Google API base URL".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends with a bearer token. A 401 invalidates the token and retries once.
    async fn send<F>(&self, resource: &str, build: F) -> AppResult<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut refreshed = false;
        loop {
            let token = self.tokens.access_token().await?;
            let response = build().bearer_auth(token.expose_secret()).send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                debug!(target: "credentials", resource, "access token refused; minting a new one");
                self.tokens.invalidate();
                refreshed = true;
                continue;
            }
            return Err(self.classify_failure(response, resource).await);
        }
    }

    async fn classify_failure(&self, response: Response, resource: &str) -> AppError {
        let status = response.status();
        let scope = if response.url().as_str().starts_with(&self.sheets_api_base) {
            SHEETS_SCOPE
        } else {
            DRIVE_SCOPE
        };
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let error = classify_status(
            status,
            retry_after,
            &body,
            resource,
            self.tokens.account_email(),
            scope,
        );
        warn!(
            target: "access",
            resource,
            status = status.as_u16(),
            error = %error,
            "google request failed"
        );
        error
    }
}

pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
    resource: &str,
    account_email: &str,
    scope: &str,
) -> AppError {
    let lowered = body.to_ascii_lowercase();
    let rate_limited = RATE_LIMIT_REASONS.iter().any(|reason| lowered.contains(reason));
    let scope_missing = SCOPE_REASONS.iter().any(|reason| lowered.contains(reason));
    match status {
        StatusCode::UNAUTHORIZED => AppError::Credential(CredentialError::AuthExpired),
        StatusCode::TOO_MANY_REQUESTS => AppError::QuotaExceeded {
            retry_after: retry_after.unwrap_or(Duration::ZERO),
        },
        StatusCode::FORBIDDEN if rate_limited => AppError::QuotaExceeded {
            retry_after: retry_after.unwrap_or(Duration::ZERO),
        },
        StatusCode::FORBIDDEN if scope_missing => {
            AppError::Credential(CredentialError::InsufficientScope {
                missing: vec![scope.to_string()],
            })
        }
        StatusCode::FORBIDDEN => AppError::Access(AccessError::Forbidden {
            resource: resource.to_string(),
            account_email: account_email.to_string(),
        }),
        StatusCode::NOT_FOUND => AppError::Access(AccessError::NotShared {
            resource: resource.to_string(),
            account_email: account_email.to_string(),
        }),
        status if status.is_server_error() => {
            AppError::Network(format!("{resource} request returned {status}"))
        }
        status => AppError::Api {
            status: status.as_u16(),
            message: sanitize_error_copy(&google_error_message(body).unwrap_or_else(|| body.to_string())),
        },
    }
}

/// Upload endpoint for a Drive API base: `https://host/drive/v3` becomes
/// `https://host/upload/drive/v3`.
fn upload_base(drive_api_base: &str) -> AppResult<String> {
    let mut url = Url::parse(drive_api_base.trim_end_matches('/'))
        .map_err(|err| AppError::Config(format!("invalid Google API base URL: {err}")))?;
    let path = format!("/upload{}", url.path());
    url.set_path(&path);
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn drive_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related(boundary: &str, metadata: &Value, mime_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{boundary}\r\nContent-Type: {mime_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn google_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetStore for GoogleClient {
    async fn fetch_table(&self, target: &SheetTarget, max_rows: usize) -> AppResult<Vec<Vec<String>>> {
        self.values_get(&target.spreadsheet_id, &table_range(&target.worksheet, max_rows))
            .await
    }

    async fn write_rows(&self, target: &SheetTarget, writes: &[RowWrite]) -> AppResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let data = writes
            .iter()
            .map(|write| (row_range(&target.worksheet, write.row), write.cells.clone()))
            .collect();
        self.values_batch_update(&target.spreadsheet_id, data).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpreadsheetRaw {
    spreadsheet_id: Option<String>,
    properties: Option<SpreadsheetPropertiesRaw>,
    #[serde(default)]
    sheets: Vec<SheetRaw>,
}

#[derive(Deserialize)]
struct SpreadsheetPropertiesRaw {
    title: String,
}

#[derive(Deserialize)]
struct SheetRaw {
    properties: SheetPropertiesRaw,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetPropertiesRaw {
    sheet_id: i64,
    title: String,
    grid_properties: Option<GridPropertiesRaw>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridPropertiesRaw {
    row_count: Option<u64>,
    column_count: Option<u64>,
}

#[derive(Deserialize)]
struct ValueRangeRaw {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateRaw {
    total_updated_rows: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileRaw {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    trashed: bool,
    capabilities: Option<DriveCapabilitiesRaw>,
}

#[derive(Deserialize)]
struct DriveFileListRaw {
    #[serde(default)]
    files: Vec<DriveStoredFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveCapabilitiesRaw {
    #[serde(default)]
    can_edit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMAIL: &str = "sync@rugbase.iam.gserviceaccount.com";

    #[test]
    fn classifies_google_statuses() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "", "spreadsheet", EMAIL, SHEETS_SCOPE),
            AppError::Credential(CredentialError::AuthExpired)
        ));
        assert!(matches!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(17)),
                "",
                "spreadsheet",
                EMAIL,
                SHEETS_SCOPE
            ),
            AppError::QuotaExceeded { retry_after } if retry_after == Duration::from_secs(17)
        ));
        let rate_limited = r#"{"error":{"code":403,"errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, rate_limited, "spreadsheet", EMAIL, SHEETS_SCOPE),
            AppError::QuotaExceeded { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, "{}", "Drive folder", EMAIL, DRIVE_SCOPE),
            AppError::Access(AccessError::Forbidden { ref resource, .. }) if resource == "Drive folder"
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, "", "spreadsheet", EMAIL, SHEETS_SCOPE),
            AppError::Access(AccessError::NotShared { ref account_email, .. }) if account_email == EMAIL
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, "", "spreadsheet", EMAIL, SHEETS_SCOPE).is_transient());
    }

    #[test]
    fn wrong_scope_is_a_credential_failure() {
        let body = r#"{"error":{"code":403,"message":"Request had insufficient authentication scopes.","status":"PERMISSION_DENIED","details":[{"reason":"ACCESS_TOKEN_SCOPE_INSUFFICIENT"}]}}"#;
        let err = classify_status(StatusCode::FORBIDDEN, None, body, "Drive folder", EMAIL, DRIVE_SCOPE);
        assert!(matches!(
            err,
            AppError::Credential(CredentialError::InsufficientScope { ref missing })
                if missing == &[DRIVE_SCOPE]
        ));
        assert_eq!(err.class(), crate::errors::ErrorClass::Credential);

        let legacy = r#"{"error":{"code":403,"errors":[{"reason":"insufficientPermissions"}]}}"#;
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, legacy, "spreadsheet", EMAIL, SHEETS_SCOPE),
            AppError::Credential(CredentialError::InsufficientScope { ref missing })
                if missing == &[SHEETS_SCOPE]
        ));

        let file = r#"{"error":{"code":403,"errors":[{"reason":"insufficientFilePermissions"}]}}"#;
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, file, "Drive folder", EMAIL, DRIVE_SCOPE),
            AppError::Access(AccessError::Forbidden { .. })
        ));
    }

    #[test]
    fn upload_base_sits_beside_the_api_base() {
        assert_eq!(
            upload_base("https://www.googleapis.com/drive/v3").unwrap(),
            "https://www.googleapis.com/upload/drive/v3"
        );
        assert_eq!(
            upload_base("http://127.0.0.1:9/drive/v3/").unwrap(),
            "http://127.0.0.1:9/upload/drive/v3"
        );
        assert_eq!(drive_literal("it's"), "it\\'s");
    }

    #[test]
    fn surfaces_google_error_message_for_other_statuses() {
        let body = r#"{"error":{"code":400,"message":"Unable to parse range: items!A1:K9"}}"#;
        match classify_status(StatusCode::BAD_REQUEST, None, body, "spreadsheet", EMAIL, SHEETS_SCOPE) {
            AppError::Api { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("Unable to parse range"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn worksheet_lookup_ignores_case() {
        let metadata = SpreadsheetMetadata {
            spreadsheet_id: "abc".into(),
            title: "Stock".into(),
            worksheets: vec![WorksheetInfo {
                sheet_id: 0,
                title: "Items".into(),
                row_count: Some(1000),
                column_count: Some(26),
            }],
        };
        assert!(metadata.worksheet("items").is_some());
        assert!(metadata.worksheet("archive").is_none());
    }

    #[test]
    fn renders_non_string_cells() {
        assert_eq!(cell_text(json!(12.5)), "12.5");
        assert_eq!(cell_text(json!(true)), "true");
        assert_eq!(cell_text(Value::Null), "");
    }
}
