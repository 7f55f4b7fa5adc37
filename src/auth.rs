//! A4: the authentication boundary. `PrincipalVerifier` turns a bearer token
//! into a [`User`]; two implementations are shipped, a JWKS-backed verifier
//! for production and a shared-secret verifier for local development and
//! integration tests -- grounded on the reference system's split between its
//! HTTPS manifest fetches and test-fixture manifests (`gcp_oauth.rs`,
//! `manifest.rs`).

use crate::logging::event;
use crate::retries::retry_request;
use anyhow::Context;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// The authenticated principal behind a request, derived from a verified
/// bearer token's claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingOrMalformedHeader,
    #[error("token signature or claims are invalid: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token references an unknown key id")]
    UnknownKeyId,
    #[error("could not fetch signing keys: {0}")]
    KeySourceUnavailable(#[from] anyhow::Error),
}

/// Verifies a bearer token and extracts the principal it authenticates.
/// Implementations never mutate anything; they are pure verification.
#[async_trait]
pub trait PrincipalVerifier: std::fmt::Debug + Send + Sync {
    async fn verify(&self, bearer_token: &str) -> Result<User, AuthError>;
}

pub fn bearer_token(header_value: Option<&str>) -> Result<&str, AuthError> {
    header_value
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingOrMalformedHeader)
}

#[derive(Debug, Clone, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, rename = "name")]
    display_name: Option<String>,
}

/// An HMAC-signed-JWT verifier against one configured secret. Intended for
/// local development and integration tests, where standing up a JWKS
/// endpoint would be pure overhead.
#[derive(Debug)]
pub struct SharedSecretVerifier {
    secret: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: String) -> Self {
        SharedSecretVerifier { secret }
    }
}

#[async_trait]
impl PrincipalVerifier for SharedSecretVerifier {
    async fn verify(&self, bearer_token: &str) -> Result<User, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let data = decode::<Claims>(bearer_token, &key, &validation)?;
        Ok(User {
            id: data.claims.sub.clone(),
            display_name: data.claims.display_name.unwrap_or(data.claims.sub),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct JsonWebKey {
    kid: String,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonWebKeySet {
    keys: Vec<JsonWebKey>,
}

/// Validates a JWT's signature against a JSON Web Key Set fetched from
/// `jwks_url`, caching decoded keys and refreshing them on a timer so a key
/// rotation on the identity provider's side does not require a restart.
#[derive(Debug)]
pub struct JwksPrincipalVerifier {
    jwks_url: String,
    keys: Arc<RwLock<HashMap<String, DecodingKey>>>,
    logger: Logger,
}

impl JwksPrincipalVerifier {
    /// Fetches the JWKS once synchronously so startup fails fast on a bad
    /// URL, then spawns a background task to refresh it every
    /// `refresh_interval`.
    pub async fn new(jwks_url: String, refresh_interval: Duration, logger: Logger) -> anyhow::Result<Self> {
        let keys = Arc::new(RwLock::new(HashMap::new()));
        let verifier = JwksPrincipalVerifier { jwks_url, keys, logger };
        verifier.refresh().await?;
        verifier.spawn_refresh_loop(refresh_interval);
        Ok(verifier)
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        let url = self.jwks_url.clone();
        let logger = self.logger.clone();
        let jwks: JsonWebKeySet = tokio::task::spawn_blocking(move || fetch_jwks(&url, &logger))
            .await
            .context("jwks fetch task panicked")??;

        let mut decoded = HashMap::new();
        for key in jwks.keys {
            if key.kty != "RSA" {
                continue;
            }
            let (Some(n), Some(e)) = (key.n.as_deref(), key.e.as_deref()) else {
                continue;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(decoding_key) => {
                    decoded.insert(key.kid, decoding_key);
                }
                Err(error) => warn!(self.logger, "skipping malformed JWKS key"; "error" => error.to_string()),
            }
        }

        info!(self.logger, "refreshed JWKS"; "key_count" => decoded.len());
        *self.keys.write().await = decoded;
        Ok(())
    }

    fn spawn_refresh_loop(&self, interval: Duration) {
        let jwks_url = self.jwks_url.clone();
        let keys = self.keys.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let refresher = JwksPrincipalVerifier {
                    jwks_url: jwks_url.clone(),
                    keys: keys.clone(),
                    logger: logger.clone(),
                };
                if let Err(error) = refresher.refresh().await {
                    warn!(logger, "failed to refresh JWKS, keeping cached keys"; "error" => format!("{error:#}"));
                }
            }
        });
    }
}

fn fetch_jwks(url: &str, logger: &Logger) -> anyhow::Result<JsonWebKeySet> {
    retry_request(
        logger,
        || -> anyhow::Result<JsonWebKeySet> {
            let response = ureq::get(url).call().context("requesting JWKS")?;
            response.into_json().context("parsing JWKS response body")
        },
        |_| true,
    )
}

#[async_trait]
impl PrincipalVerifier for JwksPrincipalVerifier {
    async fn verify(&self, bearer_token: &str) -> Result<User, AuthError> {
        let header = decode_header(bearer_token)?;
        let kid = header.kid.ok_or(AuthError::UnknownKeyId)?;

        let keys = self.keys.read().await;
        let key = keys.get(&kid).ok_or(AuthError::UnknownKeyId)?;

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = true;
        let data = decode::<Claims>(bearer_token, key, &validation)?;

        info!(self.logger, "verified bearer token"; event::IDENTITY => data.claims.sub.clone());
        Ok(User {
            id: data.claims.sub.clone(),
            display_name: data.claims.display_name.unwrap_or(data.claims.sub),
        })
    }
}
