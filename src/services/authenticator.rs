//! Bearer credential validation.
//!
//! Validation runs in a fixed order so that cheap checks reject garbage
//! before anything is looked up:
//!
//! 1. Format check (pure): prefix, environment, length, charset
//! 2. Record lookup by key id
//! 3. Constant-time MAC verification of the whole token (against a dummy
//!    record when the id is unknown)
//! 4. Revocation and expiry
//! 5. Per-key rate limit

use std::{
    collections::HashMap,
    path::Path,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, info};

use super::rate_limiter::RateLimiter;
use crate::{
    config::{ConfigError, Secret, ServerConfig},
    models::api_key::{ApiKey, KeyEnvironment, TokenParts},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    Missing,

    #[error("malformed credential")]
    InvalidFormat,

    #[error("unknown credential")]
    UnknownKey,

    #[error("credential expired")]
    Expired,

    #[error("credential revoked")]
    Revoked,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Rejected by a remote server; the precise reason is not disclosed.
    #[error("credential rejected")]
    Rejected,
}

/// Authentication context attached to authenticated requests.
///
/// Inserted into the request's extensions by the auth middleware and
/// extracted by handlers that need to know who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub key_id: String,
    pub environment: KeyEnvironment,
    pub scopes: Vec<String>,
}

pub struct Authenticator {
    environment: KeyEnvironment,
    auth_secret: Secret<String>,
    keys: RwLock<HashMap<String, ApiKey>>,
    dummy: ApiKey,
    limiter: RateLimiter,
}

impl Authenticator {
    pub fn new(environment: KeyEnvironment, auth_secret: Secret<String>, limiter: RateLimiter) -> Self {
        let dummy = ApiKey::dummy(auth_secret.expose().as_bytes());
        Self {
            environment,
            auth_secret,
            keys: RwLock::new(HashMap::new()),
            dummy,
            limiter,
        }
    }

    /// Build from server configuration, loading the key file if one is named.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the key file cannot be read or parsed.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        let authenticator = Self::new(
            config.environment,
            config.auth_secret.clone(),
            RateLimiter::new(config.rate_limit_capacity, config.rate_limit_refill_per_sec),
        );
        if let Some(path) = &config.api_keys_file {
            let keys = keys_from_file(path)?;
            info!(count = keys.len(), path = %path.display(), "loaded API keys");
            for key in keys {
                authenticator.insert_key(key);
            }
        }
        Ok(authenticator)
    }

    fn keys(&self) -> RwLockReadGuard<'_, HashMap<String, ApiKey>> {
        self.keys.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn keys_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, ApiKey>> {
        self.keys.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn environment(&self) -> KeyEnvironment {
        self.environment
    }

    pub fn insert_key(&self, key: ApiKey) {
        self.keys_mut().insert(key.id.clone(), key);
    }

    /// Mark a key revoked. Returns `false` if the id is unknown.
    pub fn revoke(&self, key_id: &str) -> bool {
        match self.keys_mut().get_mut(key_id) {
            Some(key) => {
                key.revoked = true;
                true
            }
            None => false,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The record a token is verified against, and whether the id is known.
    ///
    /// Unknown ids get the dummy record so they cost the same MAC work.
    fn verification_record(&self, key_id: &str) -> (ApiKey, bool) {
        match self.keys().get(key_id) {
            Some(key) => (key.clone(), true),
            None => (self.dummy.clone(), false),
        }
    }

    /// Validate a presented token.
    ///
    /// # Errors
    ///
    /// The first [`AuthError`] in validation order.
    pub fn validate(&self, token: &str) -> Result<AuthContext, AuthError> {
        let parts = TokenParts::parse(token).ok_or(AuthError::InvalidFormat)?;
        if parts.environment != self.environment {
            return Err(AuthError::InvalidFormat);
        }

        let (key, known) = self.verification_record(parts.key_id);
        let verified = key.verify(self.auth_secret.expose().as_bytes(), token);
        if !(known && verified) {
            return Err(AuthError::UnknownKey);
        }

        if key.revoked {
            return Err(AuthError::Revoked);
        }
        if key.is_expired(Utc::now()) {
            return Err(AuthError::Expired);
        }

        self.limiter
            .check(&key.id)
            .map_err(|retry_after| AuthError::RateLimited { retry_after })?;

        debug!(key_id = %key.id, "credential accepted");
        Ok(AuthContext {
            key_id: key.id,
            environment: key.environment,
            scopes: key.scopes,
        })
    }
}

/// Read API key records from a JSON array file.
///
/// # Errors
///
/// [`ConfigError::File`] or [`ConfigError::Parse`].
pub fn keys_from_file(path: &Path) -> Result<Vec<ApiKey>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::io::Write;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn authenticator() -> Authenticator {
        Authenticator::new(
            KeyEnvironment::Dev,
            Secret::new(SECRET.to_string()),
            RateLimiter::new(100, 10.0),
        )
    }

    fn issue(auth: &Authenticator, ttl: Option<ChronoDuration>) -> String {
        let issued = ApiKey::issue(KeyEnvironment::Dev, vec!["scan".into()], ttl, SECRET.as_bytes());
        auth.insert_key(issued.record);
        issued.token.expose().clone()
    }

    #[test]
    fn accepts_valid_key() {
        let auth = authenticator();
        let token = issue(&auth, None);
        let ctx = auth.validate(&token).unwrap();
        assert_eq!(ctx.environment, KeyEnvironment::Dev);
        assert_eq!(ctx.scopes, ["scan"]);
    }

    #[test]
    fn wrong_environment_is_a_format_error() {
        let auth = authenticator();
        let issued = ApiKey::issue(KeyEnvironment::Prod, Vec::new(), None, SECRET.as_bytes());
        auth.insert_key(issued.record);
        assert_eq!(auth.validate(issued.token.expose()), Err(AuthError::InvalidFormat));
    }

    #[test]
    fn rejects_unknown_tampered_revoked_and_expired() {
        let auth = authenticator();

        let stranger = ApiKey::issue(KeyEnvironment::Dev, Vec::new(), None, SECRET.as_bytes());
        assert_eq!(auth.validate(stranger.token.expose()), Err(AuthError::UnknownKey));

        let token = issue(&auth, None);
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('Z') { 'Y' } else { 'Z' });
        assert_eq!(auth.validate(&tampered), Err(AuthError::UnknownKey));

        let key_id = TokenParts::parse(&token).unwrap().key_id.to_string();
        assert!(auth.revoke(&key_id));
        assert_eq!(auth.validate(&token), Err(AuthError::Revoked));

        let expired = issue(&auth, Some(ChronoDuration::seconds(-1)));
        assert_eq!(auth.validate(&expired), Err(AuthError::Expired));
    }

    #[test]
    fn unknown_ids_are_verified_against_the_dummy_record() {
        let auth = authenticator();
        let token = issue(&auth, None);
        let known_id = TokenParts::parse(&token).unwrap().key_id.to_string();

        let (record, known) = auth.verification_record(&known_id);
        assert!(known);
        assert_eq!(record.id, known_id);

        let stranger = ApiKey::issue(KeyEnvironment::Dev, Vec::new(), None, SECRET.as_bytes());
        let (record, known) = auth.verification_record(&stranger.record.id);
        assert!(!known);
        assert_eq!(record, ApiKey::dummy(SECRET.as_bytes()));
        assert!(!record.verify(SECRET.as_bytes(), stranger.token.expose()));
        assert_eq!(auth.validate(stranger.token.expose()), Err(AuthError::UnknownKey));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_applies_per_key() {
        let auth = Authenticator::new(
            KeyEnvironment::Dev,
            Secret::new(SECRET.to_string()),
            RateLimiter::new(1, 1.0),
        );
        let token = issue(&auth, None);
        auth.validate(&token).unwrap();
        assert!(matches!(
            auth.validate(&token),
            Err(AuthError::RateLimited { .. })
        ));

        let other = issue(&auth, None);
        assert!(auth.validate(&other).is_ok());
    }

    #[test]
    fn loads_keys_from_file() {
        let issued = ApiKey::issue(KeyEnvironment::Dev, Vec::new(), None, SECRET.as_bytes());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&[&issued.record]).unwrap()).unwrap();

        let keys = keys_from_file(file.path()).unwrap();
        assert_eq!(keys, [issued.record]);
    }
}
