//! Update checker and installer.
//!
//! A JSON manifest names the latest version, where to get it, and its
//! checksum. Packages are staged under the data dir, verified, and swapped in
//! by rename. The previous binary stays next to the target as
//! `<name>.previous` until the new one has been seen to start.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::sibling_with_suffix;
use crate::errors::UpdateError;
use crate::journal::SyncJournal;
use crate::sanitize_error_copy;

const STATE_FILE_NAME: &str = "update-state.json";
const PLACEHOLDER_MARKERS: &[&str] = &["example.com", "your-account", "your-org", "YOUR_"];
const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "digest", rename_all = "lowercase")]
pub enum Checksum {
    Sha256(String),
    Md5(String),
}

impl Checksum {
    fn expected(&self) -> &str {
        match self {
            Checksum::Sha256(digest) | Checksum::Md5(digest) => digest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePackage {
    pub version: String,
    pub url: String,
    pub checksum: Checksum,
    pub notes_url: Option<String>,
}

#[derive(Deserialize)]
struct ManifestRaw {
    version: String,
    url: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    notes_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub version: String,
    pub target: PathBuf,
    pub backup: Option<PathBuf>,
}

/// Marker left behind by an install until the new version confirms startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingInstall {
    pub version: String,
    pub previous_version: String,
    pub target: PathBuf,
    pub backup: Option<PathBuf>,
    pub installed_at: DateTime<Utc>,
}

/// Result of a non-interactive `--batch-update` run.
#[derive(Debug)]
pub enum BatchOutcome {
    UpToDate { version: String },
    Installed { version: String },
    Failed(UpdateError),
}

impl BatchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            BatchOutcome::UpToDate { .. } | BatchOutcome::Installed { .. } => 0,
            BatchOutcome::Failed(err) => exit_code_for(err),
        }
    }
}

pub fn exit_code_for(err: &UpdateError) -> i32 {
    match err {
        UpdateError::Configuration(_) | UpdateError::Manifest(_) => 1,
        UpdateError::Download(_) => 2,
        UpdateError::ChecksumMismatch { .. } => 3,
        UpdateError::Install(_) | UpdateError::RolledBack(_) => 4,
    }
}

pub struct Updater {
    http: Client,
    manifest_source: Option<String>,
    install_path: PathBuf,
    staging_dir: PathBuf,
    state_path: PathBuf,
    current_version: String,
    launch_timeout: Duration,
    journal: Option<SyncJournal>,
}

impl Updater {
    pub fn new(config: &AppConfig) -> Result<Self, UpdateError> {
        let install_path = match &config.update_install_path {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|err| {
                UpdateError::Configuration(format!("cannot locate the running executable: {err}"))
            })?,
        };
        let http = Client::builder()
            .user_agent(concat!("rugbase/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.http_timeout())
            .build()
            .map_err(|err| UpdateError::Configuration(err.to_string()))?;
        Ok(Self {
            http,
            manifest_source: config.update_manifest_url.clone(),
            install_path,
            staging_dir: config.updates_dir(),
            state_path: config.data_dir.join(STATE_FILE_NAME),
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            journal: None,
        })
    }

    pub fn with_current_version(mut self, version: impl Into<String>) -> Self {
        self.current_version = version.into();
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_journal(mut self, journal: SyncJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub async fn fetch_manifest(&self) -> Result<UpdatePackage, UpdateError> {
        let source = self
            .manifest_source
            .as_deref()
            .filter(|source| !source.trim().is_empty())
            .ok_or_else(|| {
                UpdateError::Configuration("UPDATE_MANIFEST_URL is not set".into())
            })?;

        let body = if is_remote(source) {
            let response = self
                .http
                .get(source)
                .timeout(MANIFEST_TIMEOUT)
                .send()
                .await
                .map_err(|err| manifest_error(&err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(manifest_error(&format!("{source} returned {status}")));
            }
            response
                .text()
                .await
                .map_err(|err| manifest_error(&err.to_string()))?
        } else {
            tokio::fs::read_to_string(source)
                .await
                .map_err(|err| manifest_error(&format!("{source}: {err}")))?
        };

        let raw: ManifestRaw = serde_json::from_str(body.trim_start_matches('\u{feff}'))
            .map_err(|err| manifest_error(&err.to_string()))?;
        let version = raw.version.trim().to_string();
        if version.is_empty() {
            return Err(manifest_error("manifest has an empty version"));
        }
        let checksum = match (non_blank(raw.sha256), non_blank(raw.md5)) {
            (Some(sha256), _) => Checksum::Sha256(sha256.to_ascii_lowercase()),
            (None, Some(md5)) => Checksum::Md5(md5.to_ascii_lowercase()),
            (None, None) => return Err(manifest_error("manifest carries no sha256 or md5")),
        };
        let url = resolve_package_url(source, raw.url.trim());
        ensure_real_url(&url)?;
        Ok(UpdatePackage {
            version,
            url,
            checksum,
            notes_url: non_blank(raw.notes_url),
        })
    }

    /// The advertised package when it is newer than the running version.
    pub async fn check_for_update(&self) -> Result<Option<UpdatePackage>, UpdateError> {
        let package = self.fetch_manifest().await?;
        let newer = compare_versions(&package.version, &self.current_version) == Ordering::Greater;
        info!(
            target: "updater",
            current = %self.current_version,
            latest = %package.version,
            newer,
            "update check finished"
        );
        Ok(newer.then_some(package))
    }

    /// Downloads into the staging dir and verifies the checksum. Nothing
    /// outside the staging dir is touched.
    pub async fn download(&self, package: &UpdatePackage) -> Result<PathBuf, UpdateError> {
        ensure_real_url(&package.url)?;
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|err| UpdateError::Download(err.to_string()))?;
        let staged = self.staging_dir.join(format!(
            "{}-{}",
            self.package_stem(),
            safe_version_tag(&package.version)
        ));
        let part = sibling_with_suffix(&staged, ".part");

        let result = self.stream_to(&package.url, &part, &package.checksum).await;
        let actual = match result {
            Ok(actual) => actual,
            Err(err) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(err);
            }
        };
        if !actual.eq_ignore_ascii_case(package.checksum.expected()) {
            let _ = tokio::fs::remove_file(&part).await;
            warn!(target: "updater", version = %package.version, "checksum mismatch; package discarded");
            return Err(UpdateError::ChecksumMismatch {
                expected: package.checksum.expected().to_string(),
                actual,
            });
        }
        tokio::fs::rename(&part, &staged)
            .await
            .map_err(|err| UpdateError::Download(err.to_string()))?;
        info!(target: "updater", version = %package.version, path = %staged.display(), "package staged");
        Ok(staged)
    }

    /// Download, verify, and swap in `package`. The new binary is confirmed
    /// on its next start via [`Updater::confirm_startup`].
    pub async fn apply_update(&self, package: &UpdatePackage) -> Result<InstallReport, UpdateError> {
        let staged = self.download(package).await?;
        let report = self.install(&staged, &package.version)?;
        let _ = fs::remove_file(&staged);
        self.journal_event(
            "update_applied",
            json!({ "version": package.version, "previous": self.current_version }),
        );
        Ok(report)
    }

    /// Runs `<target> --version` and rolls back when it does not exit cleanly.
    pub async fn verify_launch(&self) -> Result<(), UpdateError> {
        let launched = tokio::time::timeout(
            self.launch_timeout,
            Command::new(&self.install_path)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;
        let failure = match launched {
            Ok(Ok(status)) if status.success() => return Ok(()),
            Ok(Ok(status)) => format!("new version exited with {status}"),
            Ok(Err(err)) => format!("new version could not start: {err}"),
            Err(_) => format!(
                "new version did not answer within {}s",
                self.launch_timeout.as_secs()
            ),
        };
        warn!(target: "updater", reason = %failure, "launch check failed; rolling back");
        self.rollback()?;
        Err(UpdateError::RolledBack(failure))
    }

    /// Puts `<target>.previous` back in place.
    pub fn rollback(&self) -> Result<(), UpdateError> {
        let backup = sibling_with_suffix(&self.install_path, ".previous");
        if !backup.exists() {
            return Err(UpdateError::Install("no previous version to restore".into()));
        }
        if self.install_path.exists() {
            fs::remove_file(&self.install_path).map_err(install_error)?;
        }
        fs::rename(&backup, &self.install_path).map_err(install_error)?;
        let _ = fs::remove_file(&self.state_path);
        info!(target: "updater", target = %self.install_path.display(), "previous version restored");
        self.journal_event("update_rolled_back", json!({ "target": self.install_path }));
        Ok(())
    }

    /// Called once the application has started cleanly. Drops the backup
    /// and the pending-install marker. Returns the confirmed install, if any.
    pub fn confirm_startup(&self) -> Result<Option<PendingInstall>, UpdateError> {
        let Some(pending) = self.pending_install()? else {
            return Ok(None);
        };
        if let Some(backup) = &pending.backup {
            if backup.exists() {
                fs::remove_file(backup).map_err(install_error)?;
            }
        }
        fs::remove_file(&self.state_path).map_err(install_error)?;
        info!(target: "updater", version = %pending.version, "update confirmed");
        Ok(Some(pending))
    }

    pub fn pending_install(&self) -> Result<Option<PendingInstall>, UpdateError> {
        match fs::read_to_string(&self.state_path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|err| UpdateError::Install(format!("unreadable update state: {err}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(install_error(err)),
        }
    }

    /// Full check, download, install, launch check. Never panics; the
    /// outcome maps to a process exit code.
    pub async fn batch_update(&self) -> BatchOutcome {
        let package = match self.check_for_update().await {
            Ok(Some(package)) => package,
            Ok(None) => {
                return BatchOutcome::UpToDate {
                    version: self.current_version.clone(),
                }
            }
            Err(err) => return BatchOutcome::Failed(err),
        };
        if let Err(err) = self.apply_update(&package).await {
            return BatchOutcome::Failed(err);
        }
        if let Err(err) = self.verify_launch().await {
            return BatchOutcome::Failed(err);
        }
        if let Err(err) = self.confirm_startup() {
            warn!(target: "updater", error = %err, "could not clear update marker");
        }
        BatchOutcome::Installed {
            version: package.version,
        }
    }

    fn install(&self, staged: &Path, version: &str) -> Result<InstallReport, UpdateError> {
        let target = &self.install_path;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(install_error)?;
        }
        let incoming = sibling_with_suffix(target, ".incoming");
        fs::copy(staged, &incoming).map_err(install_error)?;
        copy_permissions(target, &incoming)?;

        let backup = sibling_with_suffix(target, ".previous");
        let had_previous = target.exists();
        if had_previous {
            if backup.exists() {
                fs::remove_file(&backup).map_err(install_error)?;
            }
            if let Err(err) = fs::rename(target, &backup) {
                let _ = fs::remove_file(&incoming);
                return Err(install_error(err));
            }
        }
        if let Err(err) = fs::rename(&incoming, target) {
            if had_previous {
                let _ = fs::rename(&backup, target);
            }
            let _ = fs::remove_file(&incoming);
            return Err(install_error(err));
        }

        let backup = had_previous.then_some(backup);
        let pending = PendingInstall {
            version: version.to_string(),
            previous_version: self.current_version.clone(),
            target: target.clone(),
            backup: backup.clone(),
            installed_at: Utc::now(),
        };
        let encoded = serde_json::to_string_pretty(&pending)
            .map_err(|err| UpdateError::Install(err.to_string()))?;
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).map_err(install_error)?;
        }
        fs::write(&self.state_path, encoded).map_err(install_error)?;
        info!(target: "updater", version, target = %target.display(), "update installed");
        Ok(InstallReport {
            version: version.to_string(),
            target: target.clone(),
            backup,
        })
    }

    async fn stream_to(
        &self,
        source: &str,
        destination: &Path,
        checksum: &Checksum,
    ) -> Result<String, UpdateError> {
        let mut hasher = PackageHasher::new(checksum);
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|err| UpdateError::Download(err.to_string()))?;

        if is_remote(source) {
            let response = self
                .http
                .get(source)
                .send()
                .await
                .map_err(|err| download_error(&err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(download_error(&format!("server returned {status}")));
            }
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| download_error(&err.to_string()))?;
                hasher.update(&chunk);
                file.write_all(&chunk)
                    .await
                    .map_err(|err| UpdateError::Download(err.to_string()))?;
            }
        } else {
            let bytes = tokio::fs::read(source)
                .await
                .map_err(|err| download_error(&format!("{source}: {err}")))?;
            hasher.update(&bytes);
            file.write_all(&bytes)
                .await
                .map_err(|err| UpdateError::Download(err.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|err| UpdateError::Download(err.to_string()))?;
        Ok(hasher.finish())
    }

    fn package_stem(&self) -> String {
        self.install_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "rugbase".into())
    }

    fn journal_event(&self, event: &str, payload: serde_json::Value) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record(event, payload) {
                warn!(target: "updater", ?err, event, "failed to append journal entry");
            }
        }
    }
}

enum PackageHasher {
    Sha256(Sha256),
    Md5(md5::Context),
}

impl PackageHasher {
    fn new(checksum: &Checksum) -> Self {
        match checksum {
            Checksum::Sha256(_) => PackageHasher::Sha256(Sha256::new()),
            Checksum::Md5(_) => PackageHasher::Md5(md5::Context::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            PackageHasher::Sha256(hasher) => hasher.update(bytes),
            PackageHasher::Md5(context) => context.consume(bytes),
        }
    }

    fn finish(self) -> String {
        match self {
            PackageHasher::Sha256(hasher) => {
                hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
            }
            PackageHasher::Md5(context) => format!("{:x}", context.compute()),
        }
    }
}

/// Dotted version ordering: numeric parts numerically, others
/// case-insensitively; `-`, `_` and `/` count as separators.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left = version_key(left);
    let right = version_key(right);
    for (a, b) in left.iter().zip(right.iter()) {
        let ordering = match (a, b) {
            (VersionPart::Number(a), VersionPart::Number(b)) => a.cmp(b),
            (VersionPart::Text(a), VersionPart::Text(b)) => a.cmp(b),
            (VersionPart::Number(_), VersionPart::Text(_)) => Ordering::Greater,
            (VersionPart::Text(_), VersionPart::Number(_)) => Ordering::Less,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

#[derive(Debug, PartialEq, Eq)]
enum VersionPart {
    Number(u64),
    Text(String),
}

fn version_key(value: &str) -> Vec<VersionPart> {
    value
        .trim()
        .trim_start_matches(['v', 'V'])
        .split(['.', '-', '_', '/'])
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<u64>() {
            Ok(number) => VersionPart::Number(number),
            Err(_) => VersionPart::Text(part.to_lowercase()),
        })
        .collect()
}

fn safe_version_tag(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn is_remote(source: &str) -> bool {
    source.contains("://")
}

/// Package paths in a local manifest are relative to the manifest.
fn resolve_package_url(manifest_source: &str, url: &str) -> String {
    if is_remote(url) || is_remote(manifest_source) || Path::new(url).is_absolute() {
        return url.to_string();
    }
    Path::new(manifest_source)
        .parent()
        .map(|dir| dir.join(url).to_string_lossy().to_string())
        .unwrap_or_else(|| url.to_string())
}

fn ensure_real_url(url: &str) -> Result<(), UpdateError> {
    if url.is_empty() {
        return Err(UpdateError::Configuration(
            "update manifest has no download url".into(),
        ));
    }
    if PLACEHOLDER_MARKERS.iter().any(|marker| url.contains(marker)) {
        return Err(UpdateError::Configuration(
            "update download url still uses a placeholder value".into(),
        ));
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn manifest_error(message: &str) -> UpdateError {
    UpdateError::Manifest(sanitize_error_copy(message))
}

fn download_error(message: &str) -> UpdateError {
    UpdateError::Download(sanitize_error_copy(message))
}

fn install_error(err: std::io::Error) -> UpdateError {
    UpdateError::Install(err.to_string())
}

#[cfg(unix)]
fn copy_permissions(from: &Path, to: &Path) -> Result<(), UpdateError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(from)
        .map(|meta| meta.permissions().mode())
        .unwrap_or(0o755);
    fs::set_permissions(to, fs::Permissions::from_mode(mode | 0o100)).map_err(install_error)
}

#[cfg(not(unix))]
fn copy_permissions(_from: &Path, _to: &Path) -> Result<(), UpdateError> {
    Ok(())
}
