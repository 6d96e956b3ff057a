//! Bearer credential verification against the identity provider.
//!
//! Credentials are JWTs signed by the provider. The provider's public keys
//! are published as a JWK set; we cache the decoded keys by key id and only
//! re-fetch the set when a token names a key we have not seen (key
//! rotation), at most once per `min_refresh` interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use parley_shared::UserId;

/// Signature algorithms accepted from the provider. Symmetric algorithms
/// are never accepted: the key set is public.
const ACCEPTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Malformed credential: {0}")]
    Malformed(String),

    #[error("Unsupported signature algorithm: {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    #[error("Credential expired")]
    Expired,

    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("Key set unavailable: {0}")]
    KeySetUnavailable(String),

    #[error("Verification timed out after {0:?}")]
    Timeout(Duration),
}

/// The verified holder of a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: UserId,
    pub email: Option<String>,
    pub expiry: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError>;
}

/// Run `verifier` with an upper bound on how long it may take.
pub async fn verify_within(
    verifier: &dyn CredentialVerifier,
    credential: &str,
    limit: Duration,
) -> Result<Identity, IdentityError> {
    tokio::time::timeout(limit, verifier.verify(credential))
        .await
        .map_err(|_| IdentityError::Timeout(limit))?
}

// ---------------------------------------------------------------------------
// Key set sources
// ---------------------------------------------------------------------------

#[async_trait]
pub trait KeySetSource: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, IdentityError>;
}

/// Fetches the JWK set from the provider's well-known URL.
pub struct HttpKeySet {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySet {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::KeySetUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl KeySetSource for HttpKeySet {
    async fn fetch(&self) -> Result<JwkSet, IdentityError> {
        debug!(url = %self.url, "Fetching identity provider key set");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IdentityError::KeySetUnavailable(e.to_string()))?;

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| IdentityError::KeySetUnavailable(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// JWKS verifier
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    exp: i64,
}

pub struct JwksVerifier {
    source: Arc<dyn KeySetSource>,
    /// Cache: key id -> decoded public key.
    keys: RwLock<HashMap<String, DecodingKey>>,
    /// When the key set was last fetched successfully. Also serialises
    /// concurrent refreshes.
    last_refresh: Mutex<Option<Instant>>,
    min_refresh: Duration,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwksVerifier {
    pub fn new(source: Arc<dyn KeySetSource>, min_refresh: Duration) -> Self {
        Self {
            source,
            keys: RwLock::new(HashMap::new()),
            last_refresh: Mutex::new(None),
            min_refresh,
            issuer: None,
            audience: None,
        }
    }

    pub fn with_issuer(mut self, issuer: Option<String>) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience;
        self
    }

    /// Re-fetch the key set unless it was fetched within `min_refresh`.
    ///
    /// Returns `true` when a fetch actually happened.
    pub async fn refresh(&self) -> Result<bool, IdentityError> {
        let mut last = self.last_refresh.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.min_refresh {
                return Ok(false);
            }
        }

        let set = self.source.fetch().await?;

        let mut fresh = HashMap::new();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("Skipping key without kid");
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    fresh.insert(kid, key);
                }
                Err(e) => warn!(kid = %kid, error = %e, "Skipping unusable key"),
            }
        }

        info!(keys = fresh.len(), "Identity provider key set refreshed");
        *self.keys.write().await = fresh;
        *last = Some(Instant::now());
        Ok(true)
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, IdentityError> {
        let cached = self.keys.read().await.get(kid).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }

        debug!(kid, "Unknown key id, refreshing key set");
        self.refresh().await?;

        self.keys
            .read()
            .await
            .get(kid)
            .cloned()
            .ok_or_else(|| IdentityError::UnknownKey(kid.to_string()))
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

#[async_trait]
impl CredentialVerifier for JwksVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError> {
        let credential = credential.trim();
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);
        if token.is_empty() {
            return Err(IdentityError::MissingCredential);
        }

        let header = decode_header(token).map_err(|e| IdentityError::Malformed(e.to_string()))?;
        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(IdentityError::UnsupportedAlgorithm(header.alg));
        }
        let kid = header
            .kid
            .ok_or_else(|| IdentityError::Malformed("missing key id".to_string()))?;

        let key = self.key_for(&kid).await?;
        let data = decode::<Claims>(token, &key, &self.validation(header.alg))
            .map_err(map_jwt_error)?;

        let subject_id = UserId::new(data.claims.sub)
            .map_err(|e| IdentityError::Rejected(format!("unusable subject: {e}")))?;
        let expiry = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .ok_or_else(|| IdentityError::Malformed("exp out of range".to_string()))?;

        Ok(Identity {
            subject_id,
            email: data.claims.email,
            expiry,
        })
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> IdentityError {
    match err.kind() {
        ErrorKind::ExpiredSignature => IdentityError::Expired,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            IdentityError::Malformed(err.to_string())
        }
        _ => IdentityError::Rejected(err.to_string()),
    }
}
