use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, Header};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credentials::Credential;
use crate::errors::{AppError, AppResult, CredentialError};
use crate::sanitize_error_copy;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Source of bearer tokens for Google API calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> AppResult<SecretString>;

    /// Drops any cached token so the next call mints a fresh one.
    fn invalidate(&self);

    fn account_email(&self) -> &str;

    /// Scopes the token endpoint reported for the latest token, when it said.
    fn granted_scopes(&self) -> Option<Vec<String>> {
        None
    }
}

struct CachedToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn new(value: String, expires_in: u64) -> Self {
        Self {
            value: SecretString::from(value),
            expires_at: Utc::now() + Duration::seconds(expires_in as i64),
        }
    }

    fn is_expired(&self) -> bool {
        let buffer = Duration::minutes(5);
        Utc::now() + buffer >= self.expires_at
    }
}

/// Authorised session for one service-account credential.
///
/// Tokens live only in memory and are discarded with the session.
pub struct ServiceAccountSession {
    http: Client,
    credential: Credential,
    token_endpoint: String,
    cached: Mutex<Option<CachedToken>>,
    granted: Mutex<Option<Vec<String>>>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenSuccessResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn default_expires_in() -> u64 {
    3600
}

impl ServiceAccountSession {
    pub fn new(
        credential: Credential,
        token_endpoint_override: Option<&str>,
        timeout: StdDuration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("rugbase/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        let token_endpoint = token_endpoint_override
            .map(str::to_string)
            .unwrap_or_else(|| credential.token_uri().to_string());
        Ok(Self {
            http,
            credential,
            token_endpoint,
            cached: Mutex::new(None),
            granted: Mutex::new(None),
        })
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn sign_out(&self) {
        *self.cached.lock() = None;
    }

    fn signed_assertion(&self) -> AppResult<String> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: self.credential.client_email(),
            scope: self.credential.scopes().join(" "),
            aud: &self.token_endpoint,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.credential.private_key_id().to_string());
        let key = self.credential.encoding_key()?;
        encode(&header, &claims, &key).map_err(|err| {
            AppError::Credential(CredentialError::InvalidKeyFile(format!(
                "could not sign token request: {err}"
            )))
        })
    }

    async fn fetch_token(&self) -> AppResult<CachedToken> {
        let assertion = self.signed_assertion()?;
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let success: TokenSuccessResponse = response.json().await?;
            debug!(
                target: "credentials",
                client_email = %self.credential.client_email(),
                expires_in = success.expires_in,
                scope = success.scope.as_deref().unwrap_or("-"),
                "access token issued"
            );
            if let Some(scope) = success.scope.as_deref() {
                *self.granted.lock() = Some(scope.split_whitespace().map(str::to_string).collect());
            }
            return Ok(CachedToken::new(success.access_token, success.expires_in));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::QuotaExceeded {
                retry_after: StdDuration::ZERO,
            });
        }
        if status.is_server_error() {
            return Err(AppError::Network(format!("token endpoint returned {status}")));
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<TokenErrorResponse>(&body)
            .map(|err| match err.error_description {
                Some(description) => format!("{}: {description}", err.error),
                None => err.error,
            })
            .unwrap_or_else(|_| format!("status {status}"));
        warn!(
            target: "credentials",
            client_email = %self.credential.client_email(),
            %status,
            "token request rejected"
        );
        Err(AppError::Credential(CredentialError::Rejected(
            sanitize_error_copy(&reason),
        )))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountSession {
    async fn access_token(&self) -> AppResult<SecretString> {
        {
            let cached = self.cached.lock();
            if let Some(token) = cached.as_ref().filter(|token| !token.is_expired()) {
                return Ok(token.value.clone());
            }
        }
        let fresh = self.fetch_token().await?;
        let value = fresh.value.clone();
        *self.cached.lock() = Some(fresh);
        Ok(value)
    }

    fn invalidate(&self) {
        self.sign_out();
    }

    fn account_email(&self) -> &str {
        self.credential.client_email()
    }

    fn granted_scopes(&self) -> Option<Vec<String>> {
        self.granted.lock().clone()
    }
}

/// Fixed token, for tests and offline tooling.
pub struct StaticTokenSource {
    token: SecretString,
    email: String,
    granted: Option<Vec<String>>,
    invalidations: Mutex<u32>,
}

impl StaticTokenSource {
    pub fn new(token: &str, email: &str) -> Self {
        Self {
            token: SecretString::from(token.to_string()),
            email: email.to_string(),
            granted: None,
            invalidations: Mutex::new(0),
        }
    }

    pub fn with_granted_scopes(mut self, scopes: &[&str]) -> Self {
        self.granted = Some(scopes.iter().map(|scope| scope.to_string()).collect());
        self
    }

    pub fn invalidations(&self) -> u32 {
        *self.invalidations.lock()
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> AppResult<SecretString> {
        Ok(SecretString::from(self.token.expose_secret().to_string()))
    }

    fn invalidate(&self) {
        *self.invalidations.lock() += 1;
    }

    fn account_email(&self) -> &str {
        &self.email
    }

    fn granted_scopes(&self) -> Option<Vec<String>> {
        self.granted.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use httptest::{matchers::*, responders::*, Expectation, Server};

    use super::*;
    use crate::credentials::{fixtures::key_json, CredentialStore, SHEETS_SCOPE};

    fn session(server: &Server) -> ServiceAccountSession {
        let credential = CredentialStore::parse(
            key_json("sync@rugbase.iam.gserviceaccount.com").as_bytes(),
            Path::new("k.json"),
        )
        .unwrap();
        let endpoint = server.url("/token").to_string();
        ServiceAccountSession::new(credential, Some(&endpoint), StdDuration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn exchanges_signed_assertion_and_caches_token() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(matches("grant-type%3Ajwt-bearer")),
                request::body(matches("assertion=ey")),
            ])
            .times(1)
            .respond_with(json_encoded(serde_json::json!({
                "access_token": "ya29.test-token",
                "expires_in": 3599,
                "token_type": "Bearer"
            }))),
        );

        let session = session(&server);
        let first = session.access_token().await.unwrap();
        let second = session.access_token().await.unwrap();
        assert_eq!(first.expose_secret(), "ya29.test-token");
        assert_eq!(second.expose_secret(), "ya29.test-token");
    }

    #[tokio::test]
    async fn records_the_scopes_google_granted() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token")).respond_with(
                json_encoded(serde_json::json!({
                    "access_token": "ya29.narrow",
                    "expires_in": 3599,
                    "scope": SHEETS_SCOPE
                })),
            ),
        );

        let session = session(&server);
        assert_eq!(session.granted_scopes(), None);
        session.access_token().await.unwrap();
        assert_eq!(session.granted_scopes(), Some(vec![SHEETS_SCOPE.to_string()]));

        let err = CredentialStore::validate_granted(session.credential(), session.granted_scopes())
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::InsufficientScope { ref missing }
                if missing == &[crate::credentials::DRIVE_SCOPE]
        ));
    }

    #[tokio::test]
    async fn invalidate_forces_a_new_exchange() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token"))
                .times(2)
                .respond_with(json_encoded(serde_json::json!({
                    "access_token": "ya29.again",
                    "expires_in": 3599
                }))),
        );

        let session = session(&server);
        session.access_token().await.unwrap();
        session.invalidate();
        session.access_token().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_grant_is_a_credential_rejection() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token")).respond_with(
                status_code(400).body(
                    r#"{"error":"invalid_grant","error_description":"Invalid JWT Signature."}"#,
                ),
            ),
        );

        let err = session(&server).access_token().await.unwrap_err();
        match err {
            AppError::Credential(CredentialError::Rejected(reason)) => {
                assert!(reason.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn token_expiry_keeps_a_five_minute_buffer() {
        assert!(CachedToken::new("t".into(), 120).is_expired());
        assert!(!CachedToken::new("t".into(), 3600).is_expired());
    }
}
