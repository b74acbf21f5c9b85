use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, SyncError};
use crate::schema::parse_spreadsheet_id;
use crate::sync::SheetTarget;

const DEFAULT_WORKSHEET: &str = "items";
const MIN_AUTO_SYNC_SECS: u64 = 10;

/// User-editable sync settings, stored as `settings.json` in the data dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub spreadsheet_id: Option<String>,
    pub worksheet: String,
    pub drive_folder_id: Option<String>,
    pub credential_path: Option<PathBuf>,
    pub credential_fingerprint: Option<String>,
    pub auto_sync: bool,
    pub auto_sync_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSyncSettingsPayload {
    pub spreadsheet: Option<String>,
    pub worksheet: Option<String>,
    pub drive_folder_id: Option<String>,
    pub auto_sync: Option<bool>,
    pub auto_sync_interval_secs: Option<u64>,
}

impl SyncSettings {
    pub fn load(path: &Path, config: &AppConfig) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(settings) => Ok(settings),
                Err(err) => {
                    warn!(
                        target: "settings",
                        error = ?err,
                        "failed to parse settings file; regenerating defaults"
                    );
                    let defaults = Self::from_config(config);
                    defaults.persist(path)?;
                    Ok(defaults)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let defaults = Self::from_config(config);
                defaults.persist(path)?;
                Ok(defaults)
            }
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    /// Applies a partial update. A spreadsheet URL is reduced to its id.
    pub fn apply_patch(&mut self, payload: &UpdateSyncSettingsPayload) -> AppResult<()> {
        if let Some(spreadsheet) = payload.spreadsheet.as_deref() {
            self.spreadsheet_id = if spreadsheet.trim().is_empty() {
                None
            } else {
                Some(parse_spreadsheet_id(spreadsheet).ok_or_else(|| {
                    AppError::Config(format!("'{spreadsheet}' is not a spreadsheet id or URL"))
                })?)
            };
        }
        if let Some(worksheet) = payload.worksheet.as_deref() {
            let worksheet = worksheet.trim();
            self.worksheet = if worksheet.is_empty() {
                DEFAULT_WORKSHEET.to_string()
            } else {
                worksheet.to_string()
            };
        }
        if let Some(folder) = payload.drive_folder_id.as_deref() {
            let folder = folder.trim();
            self.drive_folder_id = (!folder.is_empty()).then(|| folder.to_string());
        }
        if let Some(enabled) = payload.auto_sync {
            self.auto_sync = enabled;
        }
        if let Some(secs) = payload.auto_sync_interval_secs {
            self.auto_sync_interval_secs = secs.max(MIN_AUTO_SYNC_SECS);
        }
        Ok(())
    }

    pub fn remember_credential(&mut self, path: &Path, fingerprint: &str) {
        self.credential_path = Some(path.to_path_buf());
        self.credential_fingerprint = Some(fingerprint.to_string());
    }

    pub fn forget_credential(&mut self) {
        self.credential_path = None;
        self.credential_fingerprint = None;
    }

    pub fn sheet_target(&self) -> Result<SheetTarget, SyncError> {
        let spreadsheet_id = self
            .spreadsheet_id
            .clone()
            .ok_or_else(|| SyncError::NotConfigured("the spreadsheet".into()))?;
        Ok(SheetTarget {
            spreadsheet_id,
            worksheet: self.worksheet.clone(),
        })
    }

    fn from_config(config: &AppConfig) -> Self {
        Self {
            spreadsheet_id: None,
            worksheet: DEFAULT_WORKSHEET.to_string(),
            drive_folder_id: None,
            credential_path: None,
            credential_fingerprint: None,
            auto_sync: false,
            auto_sync_interval_secs: config.auto_sync_interval_secs,
        }
    }
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use tempfile::tempdir;

    #[test]
    fn loads_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let path = settings_path(dir.path());
        let settings = SyncSettings::load(&path, &config).unwrap();
        assert_eq!(settings.worksheet, "items");
        assert!(path.exists());
        assert!(matches!(
            settings.sheet_target(),
            Err(SyncError::NotConfigured(_))
        ));
    }

    #[test]
    fn regenerates_malformed_file() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let path = settings_path(dir.path());
        fs::write(&path, "{ broken").unwrap();
        let settings = SyncSettings::load(&path, &config).unwrap();
        assert_eq!(settings.auto_sync_interval_secs, config.auto_sync_interval_secs);
        let reparsed: SyncSettings =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reparsed, settings);
    }

    #[test]
    fn patch_normalises_urls_and_persists() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let path = settings_path(dir.path());
        let mut settings = SyncSettings::load(&path, &config).unwrap();
        settings
            .apply_patch(&UpdateSyncSettingsPayload {
                spreadsheet: Some(
                    "https://docs.google.com/spreadsheets/d/1AbC-d_9/edit#gid=0".into(),
                ),
                worksheet: Some("  Stock ".into()),
                auto_sync_interval_secs: Some(1),
                ..Default::default()
            })
            .unwrap();
        settings.remember_credential(Path::new("/keys/sa.json"), "abc123");
        settings.persist(&path).unwrap();

        let roundtrip = SyncSettings::load(&path, &config).unwrap();
        assert_eq!(roundtrip.spreadsheet_id.as_deref(), Some("1AbC-d_9"));
        assert_eq!(roundtrip.worksheet, "Stock");
        assert_eq!(roundtrip.auto_sync_interval_secs, MIN_AUTO_SYNC_SECS);
        assert_eq!(roundtrip.credential_fingerprint.as_deref(), Some("abc123"));

        let target = roundtrip.sheet_target().unwrap();
        assert_eq!(target.spreadsheet_id, "1AbC-d_9");
    }

    #[test]
    fn rejects_garbage_spreadsheet_reference() {
        let mut settings = SyncSettings::from_config(&test_config(Path::new(".")));
        let err = settings
            .apply_patch(&UpdateSyncSettingsPayload {
                spreadsheet: Some("not a sheet!".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
