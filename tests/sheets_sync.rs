use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{all_of, matches, request};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;

use rugbase::backoff::ManualClock;
use rugbase::catalog::{self, ItemFields};
use rugbase::commands;
use rugbase::db::open_in_memory;
use rugbase::errors::SyncError;
use rugbase::{
    AppConfig, AppError, AppState, ErrorClass, GoogleClient, SessionState, SheetTarget,
    StaticTokenSource, SyncEngine, UpdateSyncSettingsPayload,
};

const EMAIL: &str = "sync@rugbase-test.iam.gserviceaccount.com";
const TEST_RSA_KEY: &str = include_str!("fixtures/test_rsa_key.pem");

fn config(data_dir: &Path, server: &Server) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        database_file_name: "rugbase.db".into(),
        sheets_api_base: server.url("/v4").to_string(),
        drive_api_base: server.url("/drive/v3").to_string(),
        token_endpoint_override: Some(server.url("/token").to_string()),
        http_timeout_ms: 5_000,
        access_check_timeout_ms: 5_000,
        access_retry_delay_ms: 10,
        sync_batch_size: 100,
        sync_max_rows: 1_000,
        sync_backoff_base_ms: 2_000,
        sync_backoff_cap_ms: 60_000,
        sync_max_retries: 1,
        auto_sync_interval_secs: 300,
        update_manifest_url: None,
        update_install_path: None,
        journal_max_bytes: 1024 * 1024,
        journal_max_files: 5,
    }
}

fn fields(name: &str) -> ItemFields {
    ItemFields {
        rug_no: format!("RN-{name}"),
        name: name.to_string(),
        collection: "Kashan".into(),
        price: Some(980.0),
        width: Some(2.0),
        length: Some(3.0),
        qty: 1,
        photo: String::new(),
    }
}

fn target() -> SheetTarget {
    SheetTarget {
        spreadsheet_id: "sheet-1".into(),
        worksheet: "items".into(),
    }
}

#[tokio::test]
async fn validated_key_checks_access_and_syncs() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![request::method("POST"), request::path("/token")])
            .respond_with(json_encoded(json!({
                "access_token": "ya29.integration",
                "expires_in": 3600,
                "token_type": "Bearer"
            }))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path("/v4/spreadsheets/sheet-1")
        ])
        .respond_with(json_encoded(json!({
            "spreadsheetId": "sheet-1",
            "properties": { "title": "RugBase stock" },
            "sheets": [{ "properties": { "sheetId": 0, "title": "items" } }]
        }))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path("/drive/v3/files/sheet-1")
        ])
        .respond_with(json_encoded(json!({
            "id": "sheet-1",
            "name": "RugBase stock",
            "mimeType": "application/vnd.google-apps.spreadsheet",
            "capabilities": { "canEdit": true }
        }))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path(matches("^/v4/spreadsheets/sheet-1/values/items"))
        ])
        .respond_with(json_encoded(json!({ "range": "items!A1:K1002", "majorDimension": "ROWS" }))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method("POST"),
            request::path("/v4/spreadsheets/sheet-1/values:batchUpdate")
        ])
        .respond_with(json_encoded(json!({ "totalUpdatedRows": 3 }))),
    );

    let dir = tempdir().unwrap();
    let key_path = dir.path().join("service-account.json");
    std::fs::write(
        &key_path,
        json!({
            "type": "service_account",
            "project_id": "rugbase-test",
            "private_key_id": "key-42",
            "private_key": TEST_RSA_KEY,
            "client_email": EMAIL,
            "token_uri": "https://oauth2.googleapis.com/token"
        })
        .to_string(),
    )
    .unwrap();
    let state = AppState::initialize(config(&dir.path().join("data"), &server)).unwrap();

    let identity = commands::validate_credential(&state, &key_path).await.unwrap();
    assert_eq!(identity.client_email, EMAIL);
    assert_eq!(
        state.settings().credential_fingerprint.as_deref(),
        Some(identity.fingerprint.as_str())
    );

    commands::update_settings(
        &state,
        UpdateSyncSettingsPayload {
            spreadsheet: Some("https://docs.google.com/spreadsheets/d/sheet-1/edit".into()),
            ..Default::default()
        },
    )
    .unwrap();
    let access = commands::check_access(&state).await.unwrap();
    assert_eq!(access.account_email, EMAIL);
    assert!(access.sheet.can_edit);
    assert!(access.drive.is_none());

    commands::create_item(&state, fields("Isfahan")).unwrap();
    commands::create_item(&state, fields("Nain")).unwrap();
    let report = commands::sync_now(&state).await.unwrap();
    assert_eq!(report.appended, 2);
    assert_eq!(report.batches, 1);
    assert_eq!(report.revision, 1);

    let items = commands::list_items(&state).unwrap();
    assert!(items.iter().all(|item| !item.dirty && item.is_synced()));
    let mut rows: Vec<_> = items.iter().filter_map(|item| item.remote_row).collect();
    rows.sort_unstable();
    assert_eq!(rows, vec![2, 3]);

    let status = commands::get_sync_status(&state).unwrap();
    assert_eq!(status.state, SessionState::Committed);
    assert_eq!(status.conflict_count, 0);
    assert_eq!(commands::foundation_health(&state).unwrap().cursor.revision, 1);
    let events: Vec<String> = commands::recent_journal(&state, 20)
        .unwrap()
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert!(events.contains(&"session_committed".to_string()));

    let mut replaced = std::fs::read_to_string(&key_path).unwrap();
    replaced = replaced.replace("key-42", "key-43");
    std::fs::write(&key_path, replaced).unwrap();
    commands::create_item(&state, fields("Tabriz")).unwrap();
    let err = commands::sync_now(&state).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::Credential);
    assert!(err.message.contains("changed since it was validated"));
    assert_eq!(commands::foundation_health(&state).unwrap().pending_changes, 1);
}

#[tokio::test]
async fn quota_responses_back_off_by_retry_after_then_fail_the_batch() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", matches("/values/")))
            .respond_with(json_encoded(json!({}))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method("POST"),
            request::path("/v4/spreadsheets/sheet-1/values:batchUpdate")
        ])
        .times(2)
        .respond_with(
            status_code(429)
                .append_header("retry-after", "7")
                .body(r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#),
        ),
    );

    let dir = tempdir().unwrap();
    let config = config(dir.path(), &server);
    let db = Arc::new(Mutex::new(open_in_memory().unwrap()));
    let item = catalog::create_item(&db.lock(), &fields("Bidjar")).unwrap();
    let client = GoogleClient::new(&config, Arc::new(StaticTokenSource::new("ya29.q", EMAIL))).unwrap();
    let clock = ManualClock::default();
    let engine = SyncEngine::new(db.clone(), Arc::new(client), &config).with_clock(Arc::new(clock.clone()));

    let err = engine.run(&target()).await.unwrap_err();
    match &err {
        AppError::Sync(SyncError::BatchFailed {
            batch, first_row, ..
        }) => {
            assert_eq!(*batch, 1);
            assert_eq!(*first_row, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::Quota);
    assert_eq!(err.suggested_wait(), Some(Duration::from_secs(7)));
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(7)]);

    let conn = db.lock();
    assert!(catalog::get_item(&conn, &item.id).unwrap().unwrap().dirty);
    assert_eq!(catalog::load_cursor(&conn).unwrap().revision, 0);
}

#[tokio::test]
async fn refused_token_is_refreshed_once_then_reported() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", matches("/values/")))
            .times(2)
            .respond_with(status_code(401)),
    );

    let dir = tempdir().unwrap();
    let config = config(dir.path(), &server);
    let db = Arc::new(Mutex::new(open_in_memory().unwrap()));
    let tokens = Arc::new(StaticTokenSource::new("ya29.expired", EMAIL));
    let client = GoogleClient::new(&config, tokens.clone()).unwrap();
    let clock = ManualClock::default();
    let engine = SyncEngine::new(db, Arc::new(client), &config).with_clock(Arc::new(clock.clone()));

    let err = engine.run(&target()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Credential);
    assert_eq!(tokens.invalidations(), 1);
    assert!(clock.sleeps().is_empty());
    assert!(err.guidance().contains("Verify the service account key"));
}
