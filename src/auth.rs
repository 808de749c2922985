//! Access tokens for the Drive API from a service account key or a refresh token.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DriveError, Result};
use crate::models::{Credentials, ServiceAccountCredentials, TokenResponse};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Full Drive access; sync needs to read, write and trash.
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime requested for a signed assertion.
const ASSERTION_LIFETIME: u64 = 3600;

/// Assertion a service account signs to obtain a token (RFC 7523).
#[derive(Debug, Serialize)]
struct Assertion<'a> {
    /// Service account email.
    iss: &'a str,
    scope: &'a str,
    /// Token endpoint the assertion is sent to.
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: SystemTime,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > SystemTime::now() + EXPIRY_MARGIN
    }
}

/// Hands out bearer tokens for Drive requests.
///
/// Cheap to clone; clones share the cached token, and concurrent callers
/// wait on a single refresh instead of each starting their own.
#[derive(Clone)]
pub struct Authenticator {
    credentials: Arc<Credentials>,
    http: Client,
    token: Arc<Mutex<Option<AccessToken>>>,
}

impl Authenticator {
    /// Load a service account key or an authorized-user token file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(Self::new(serde_json::from_slice(&raw)?))
    }

    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Arc::new(credentials),
            http: Client::new(),
            token: Arc::new(Mutex::new(None)),
        }
    }

    /// A token valid for at least another minute.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut slot = self.token.lock().await;
        if let Some(token) = slot.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    async fn request_token(&self) -> Result<AccessToken> {
        let (token_uri, form) = match self.credentials.as_ref() {
            Credentials::ServiceAccount(sa) => {
                let uri = sa.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
                let assertion = sign_assertion(sa, uri)?;
                (
                    uri,
                    vec![("grant_type", JWT_BEARER_GRANT.to_string()), ("assertion", assertion)],
                )
            }
            Credentials::AuthorizedUser(user) => (
                user.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI),
                vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("client_id", user.client_id.clone()),
                    ("client_secret", user.client_secret.clone()),
                    ("refresh_token", user.refresh_token.clone()),
                ],
            ),
        };

        debug!(token_uri, "requesting access token");
        let response = self.http.post(token_uri).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::TokenRefreshError(format!("Status {status}: {body}")));
        }

        let granted: TokenResponse = response.json().await?;
        Ok(AccessToken {
            value: granted.access_token,
            expires_at: SystemTime::now() + Duration::from_secs(granted.expires_in),
        })
    }
}

fn sign_assertion(sa: &ServiceAccountCredentials, audience: &str) -> Result<String> {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| DriveError::TokenRefreshError(e.to_string()))?
        .as_secs();
    let assertion = Assertion {
        iss: &sa.client_email,
        scope: DRIVE_SCOPE,
        aud: audience,
        iat,
        exp: iat + ASSERTION_LIFETIME,
    };
    let key = EncodingKey::from_rsa_pem(sa.private_key.as_bytes())?;
    Ok(jsonwebtoken::encode(&Header::new(Algorithm::RS256), &assertion, &key)?)
}
