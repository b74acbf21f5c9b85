use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

use crate::backoff::BackoffPolicy;

const APP_DIR_NAME: &str = "RugBase";
const DEFAULT_JOURNAL_MAX_BYTES: u64 = 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;
const DEFAULT_BATCH_SIZE: usize = 100;
const MAX_BATCH_SIZE: usize = 500;
const DEFAULT_MAX_ROWS: usize = 50_000;
const MIN_AUTO_SYNC_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub sheets_api_base: String,
    pub drive_api_base: String,
    pub token_endpoint_override: Option<String>,
    pub http_timeout_ms: u64,
    pub access_check_timeout_ms: u64,
    pub access_retry_delay_ms: u64,
    pub sync_batch_size: usize,
    pub sync_max_rows: usize,
    pub sync_backoff_base_ms: u64,
    pub sync_backoff_cap_ms: u64,
    pub sync_max_retries: u32,
    pub auto_sync_interval_secs: u64,
    pub update_manifest_url: Option<String>,
    pub update_install_path: Option<PathBuf>,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub database_file_name: String,
    pub sheets_api_base: String,
    pub drive_api_base: String,
    pub has_token_endpoint_override: bool,
    pub sync_batch_size: usize,
    pub sync_max_rows: usize,
    pub sync_max_retries: u32,
    pub auto_sync_interval_secs: u64,
    pub has_update_source: bool,
    pub version: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            data_dir: env::var_os("RUGBASE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "rugbase.db".to_string()),
            sheets_api_base: env::var("SHEETS_API_BASE")
                .unwrap_or_else(|_| "https://sheets.googleapis.com/v4".to_string()),
            drive_api_base: env::var("DRIVE_API_BASE")
                .unwrap_or_else(|_| "https://www.googleapis.com/drive/v3".to_string()),
            token_endpoint_override: non_empty("GOOGLE_TOKEN_ENDPOINT"),
            http_timeout_ms: parse_u64("HTTP_TIMEOUT_MS", 30_000),
            access_check_timeout_ms: parse_u64("ACCESS_CHECK_TIMEOUT_MS", 10_000),
            access_retry_delay_ms: parse_u64("ACCESS_RETRY_DELAY_MS", 1_000),
            sync_batch_size: parse_usize("SYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE)
                .clamp(1, MAX_BATCH_SIZE),
            sync_max_rows: parse_usize("SYNC_MAX_ROWS", DEFAULT_MAX_ROWS).max(1),
            sync_backoff_base_ms: parse_u64("SYNC_BACKOFF_BASE_MS", 2_000),
            sync_backoff_cap_ms: parse_u64("SYNC_BACKOFF_CAP_MS", 60_000),
            sync_max_retries: parse_u32("SYNC_MAX_RETRIES", 5),
            auto_sync_interval_secs: parse_u64("AUTO_SYNC_INTERVAL_SECS", 300)
                .max(MIN_AUTO_SYNC_SECS),
            update_manifest_url: non_empty("UPDATE_MANIFEST_URL"),
            update_install_path: env::var_os("UPDATE_INSTALL_PATH").map(PathBuf::from),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            sheets_api_base: self.sheets_api_base.clone(),
            drive_api_base: self.drive_api_base.clone(),
            has_token_endpoint_override: self.token_endpoint_override.is_some(),
            sync_batch_size: self.sync_batch_size,
            sync_max_rows: self.sync_max_rows,
            sync_max_retries: self.sync_max_retries,
            auto_sync_interval_secs: self.auto_sync_interval_secs,
            has_update_source: self.update_manifest_url.is_some(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.sync_backoff_base_ms),
            Duration::from_millis(self.sync_backoff_cap_ms),
            self.sync_max_retries,
        )
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms.max(1))
    }

    pub fn access_check_timeout(&self) -> Duration {
        Duration::from_millis(self.access_check_timeout_ms.max(1))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.data_dir.join("updates")
    }

    /// Staging area for catalog snapshots on their way to Drive.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        database_file_name: "test.db".into(),
        sheets_api_base: "http://127.0.0.1:9/v4".into(),
        drive_api_base: "http://127.0.0.1:9/drive/v3".into(),
        token_endpoint_override: None,
        http_timeout_ms: 2_000,
        access_check_timeout_ms: 1_000,
        access_retry_delay_ms: 10,
        sync_batch_size: DEFAULT_BATCH_SIZE,
        sync_max_rows: DEFAULT_MAX_ROWS,
        sync_backoff_base_ms: 2_000,
        sync_backoff_cap_ms: 60_000,
        sync_max_retries: 5,
        auto_sync_interval_secs: 300,
        update_manifest_url: None,
        update_install_path: None,
        journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
        journal_max_files: DEFAULT_JOURNAL_MAX_FILES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_sync_tuning_from_env() {
        env::set_var("RUGBASE_DATA_DIR", "/tmp/rugbase-config-test");
        env::set_var("SYNC_BATCH_SIZE", "5000");
        env::set_var("SYNC_MAX_ROWS", "1200");
        env::set_var("AUTO_SYNC_INTERVAL_SECS", "1");
        env::set_var("UPDATE_MANIFEST_URL", "https://updates.rugbase.app/latest.json");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/rugbase-config-test"));
        assert_eq!(config.sync_batch_size, MAX_BATCH_SIZE);
        assert_eq!(config.sync_max_rows, 1200);
        assert_eq!(config.auto_sync_interval_secs, MIN_AUTO_SYNC_SECS);
        assert!(public.has_update_source);
        assert_eq!(public.version, env!("CARGO_PKG_VERSION"));

        for key in [
            "RUGBASE_DATA_DIR",
            "SYNC_BATCH_SIZE",
            "SYNC_MAX_ROWS",
            "AUTO_SYNC_INTERVAL_SECS",
            "UPDATE_MANIFEST_URL",
        ] {
            env::remove_var(key);
        }
    }
}
