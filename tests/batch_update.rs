use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use httptest::matchers::request;
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::{tempdir, TempDir};

use rugbase::errors::UpdateError;
use rugbase::{AppConfig, BatchOutcome, Updater};

const OLD_BUILD: &str = "#!/bin/sh\necho rugbase 1.0.0\n";

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

struct Install {
    _dir: TempDir,
    target: PathBuf,
    updater: Updater,
}

fn config(data_dir: &Path, manifest_url: String, target: &Path) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        database_file_name: "rugbase.db".into(),
        sheets_api_base: "http://127.0.0.1:9/v4".into(),
        drive_api_base: "http://127.0.0.1:9/drive/v3".into(),
        token_endpoint_override: None,
        http_timeout_ms: 5_000,
        access_check_timeout_ms: 5_000,
        access_retry_delay_ms: 10,
        sync_batch_size: 100,
        sync_max_rows: 1_000,
        sync_backoff_base_ms: 2_000,
        sync_backoff_cap_ms: 60_000,
        sync_max_retries: 5,
        auto_sync_interval_secs: 300,
        update_manifest_url: Some(manifest_url),
        update_install_path: Some(target.to_path_buf()),
        journal_max_bytes: 1024 * 1024,
        journal_max_files: 5,
    }
}

/// Serves a manifest for version 2.0.0 pointing at `package`, advertising
/// `advertised_sha256`, over an installed 1.0.0 script.
fn install(server: &Server, package: &'static str, advertised_sha256: String) -> Install {
    server.expect(
        Expectation::matching(request::method_path("GET", "/latest.json")).respond_with(
            json_encoded(json!({
                "version": "2.0.0",
                "url": server.url("/downloads/rugbase-2.0.0").to_string(),
                "sha256": advertised_sha256,
            })),
        ),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/downloads/rugbase-2.0.0"))
            .respond_with(status_code(200).body(package)),
    );

    let dir = tempdir().unwrap();
    let target = dir.path().join("bin").join("rugbase");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, OLD_BUILD).unwrap();
    make_executable(&target);

    let config = config(
        &dir.path().join("data"),
        server.url("/latest.json").to_string(),
        &target,
    );
    let updater = Updater::new(&config)
        .unwrap()
        .with_current_version("1.0.0")
        .with_launch_timeout(Duration::from_secs(10));
    Install {
        _dir: dir,
        target,
        updater,
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

fn backup_of(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap().to_os_string();
    name.push(".previous");
    target.with_file_name(name)
}

#[tokio::test]
async fn checksum_mismatch_exits_3_and_keeps_running_version() {
    let server = Server::run();
    let fx = install(&server, "tampered build", sha256_hex(b"genuine build"));

    let outcome = fx.updater.batch_update().await;
    assert!(matches!(
        outcome,
        BatchOutcome::Failed(UpdateError::ChecksumMismatch { .. })
    ));
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(fs::read_to_string(&fx.target).unwrap(), OLD_BUILD);
    assert!(!backup_of(&fx.target).exists());
    assert!(fx.updater.pending_install().unwrap().is_none());
}

#[tokio::test]
async fn current_version_is_left_alone() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/latest.json")).respond_with(
            json_encoded(json!({
                "version": "1.0.0",
                "url": server.url("/downloads/rugbase-1.0.0").to_string(),
                "md5": "0123456789abcdef0123456789abcdef",
            })),
        ),
    );
    let dir = tempdir().unwrap();
    let target = dir.path().join("rugbase");
    fs::write(&target, OLD_BUILD).unwrap();
    let config = config(dir.path(), server.url("/latest.json").to_string(), &target);
    let updater = Updater::new(&config).unwrap().with_current_version("1.0.0");

    let outcome = updater.batch_update().await;
    assert!(matches!(outcome, BatchOutcome::UpToDate { .. }));
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn unreachable_download_exits_2() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/latest.json")).respond_with(
            json_encoded(json!({
                "version": "2.0.0",
                "url": server.url("/downloads/missing").to_string(),
                "sha256": sha256_hex(b"whatever"),
            })),
        ),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/downloads/missing"))
            .respond_with(status_code(404)),
    );
    let dir = tempdir().unwrap();
    let target = dir.path().join("rugbase");
    fs::write(&target, OLD_BUILD).unwrap();
    let config = config(dir.path(), server.url("/latest.json").to_string(), &target);
    let updater = Updater::new(&config).unwrap().with_current_version("1.0.0");

    let outcome = updater.batch_update().await;
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(fs::read_to_string(&target).unwrap(), OLD_BUILD);
}

#[cfg(unix)]
#[tokio::test]
async fn healthy_update_is_installed_and_confirmed() {
    const NEW_BUILD: &str = "#!/bin/sh\necho rugbase 2.0.0\n";
    let server = Server::run();
    let fx = install(&server, NEW_BUILD, sha256_hex(NEW_BUILD.as_bytes()));

    let outcome = fx.updater.batch_update().await;
    assert!(
        matches!(outcome, BatchOutcome::Installed { ref version } if version == "2.0.0"),
        "unexpected outcome: {outcome:?}"
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(fs::read_to_string(&fx.target).unwrap(), NEW_BUILD);
    assert!(!backup_of(&fx.target).exists());
    assert!(fx.updater.pending_install().unwrap().is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn build_that_fails_to_start_is_rolled_back() {
    const BROKEN_BUILD: &str = "#!/bin/sh\nexit 3\n";
    let server = Server::run();
    let fx = install(&server, BROKEN_BUILD, sha256_hex(BROKEN_BUILD.as_bytes()));

    let outcome = fx.updater.batch_update().await;
    assert!(matches!(
        outcome,
        BatchOutcome::Failed(UpdateError::RolledBack(_))
    ));
    assert_eq!(outcome.exit_code(), 4);
    assert_eq!(fs::read_to_string(&fx.target).unwrap(), OLD_BUILD);
    assert!(!backup_of(&fx.target).exists());
    assert!(fx.updater.pending_install().unwrap().is_none());
}
