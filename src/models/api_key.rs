//! API key model for authentication.
//!
//! API keys are presented as bearer tokens of the form
//! `sr_<env>_<key_id><secret>`:
//!
//! - `<env>` is the deployment environment (`dev`, `int` or `prod`)
//! - `<key_id>` is 8 lowercase hex characters used to find the record
//! - `<secret>` is 32 ASCII alphanumerics
//!
//! Records never hold the token itself, only `hex(HMAC-SHA256(auth_secret, token))`.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::Secret;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_PREFIX: &str = "sr";
pub const KEY_ID_LEN: usize = 8;
pub const SECRET_LEN: usize = 32;

/// Deployment environment a key was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEnvironment {
    Dev,
    Int,
    Prod,
}

impl KeyEnvironment {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyEnvironment::Dev => "dev",
            KeyEnvironment::Int => "int",
            KeyEnvironment::Prod => "prod",
        }
    }
}

impl fmt::Display for KeyEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyEnvironment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(KeyEnvironment::Dev),
            "int" => Ok(KeyEnvironment::Int),
            "prod" => Ok(KeyEnvironment::Prod),
            _ => Err(()),
        }
    }
}

/// The structural parts of a well-formed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenParts<'a> {
    pub environment: KeyEnvironment,
    pub key_id: &'a str,
}

impl<'a> TokenParts<'a> {
    /// Pure format check: prefix, environment, length and charset.
    ///
    /// Does not look anything up and does not touch the secret beyond its shape.
    pub fn parse(token: &'a str) -> Option<Self> {
        let mut parts = token.splitn(3, '_');
        if parts.next()? != TOKEN_PREFIX {
            return None;
        }
        let environment = parts.next()?.parse().ok()?;
        let body = parts.next()?;
        if body.len() != KEY_ID_LEN + SECRET_LEN || !body.is_ascii() {
            return None;
        }

        let (key_id, secret) = body.split_at(KEY_ID_LEN);
        let id_ok = key_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        let secret_ok = secret.bytes().all(|b| b.is_ascii_alphanumeric());
        (id_ok && secret_ok).then_some(Self {
            environment,
            key_id,
        })
    }
}

/// Represents an API key record.
///
/// # Storage
///
/// Records are loaded from the JSON key file named by `api_keys_file`, one
/// object per key. The file never contains tokens, only their hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    /// 8 lowercase hex characters, the lookup handle embedded in the token
    pub id: String,

    /// Environment the key is valid in. Must match the server's environment.
    pub environment: KeyEnvironment,

    /// `hex(HMAC-SHA256(auth_secret, token))`
    pub secret_hash: String,

    pub issued_at: DateTime<Utc>,

    /// `None` means the key never expires
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub scopes: Vec<String>,

    /// Revoked keys are rejected without deleting the record.
    #[serde(default)]
    pub revoked: bool,
}

/// A freshly minted token together with the record that verifies it.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub token: Secret<String>,
    pub record: ApiKey,
}

impl ApiKey {
    /// Mint a new token and its storable record.
    ///
    /// # Arguments
    ///
    /// * `environment` - Environment the token is bound to
    /// * `scopes` - Scopes granted to the key
    /// * `ttl` - Lifetime, or `None` for a non-expiring key
    /// * `auth_secret` - Server HMAC key material
    pub fn issue(
        environment: KeyEnvironment,
        scopes: Vec<String>,
        ttl: Option<Duration>,
        auth_secret: &[u8],
    ) -> IssuedKey {
        let mut rng = rand::rng();
        let key_id = format!("{:08x}", rng.random::<u32>());
        let secret: String = rng
            .sample_iter(&Alphanumeric)
            .take(SECRET_LEN)
            .map(char::from)
            .collect();
        let token = format!("{TOKEN_PREFIX}_{environment}_{key_id}{secret}");

        let issued_at = Utc::now();
        let record = ApiKey {
            id: key_id,
            environment,
            secret_hash: hash_token(auth_secret, &token),
            issued_at,
            expires_at: ttl.map(|ttl| issued_at + ttl),
            scopes,
            revoked: false,
        };

        IssuedKey {
            token: Secret::new(token),
            record,
        }
    }

    /// Record used to burn a MAC verification when the key id is unknown.
    pub fn dummy(auth_secret: &[u8]) -> Self {
        let token = format!("{TOKEN_PREFIX}_dev_{}", "0".repeat(KEY_ID_LEN + SECRET_LEN));
        ApiKey {
            id: "00000000".to_string(),
            environment: KeyEnvironment::Dev,
            secret_hash: hash_token(auth_secret, &token),
            issued_at: DateTime::<Utc>::UNIX_EPOCH,
            expires_at: None,
            scopes: Vec::new(),
            revoked: true,
        }
    }

    /// Constant-time check that `token` hashes to this record's `secret_hash`.
    pub fn verify(&self, auth_secret: &[u8], token: &str) -> bool {
        let Ok(expected) = hex::decode(&self.secret_hash) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(auth_secret) else {
            return false;
        };
        mac.update(token.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Hex-encoded HMAC-SHA256 of the token under the server secret.
pub fn hash_token(auth_secret: &[u8], token: &str) -> String {
    match HmacSha256::new_from_slice(auth_secret) {
        Ok(mut mac) => {
            mac.update(token.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        // HMAC accepts any key length; an empty hash never verifies.
        Err(_) => String::new(),
    }
}

/// Loggable form of a presented credential, e.g. `sr_dev_1a2b…`.
pub fn redact(token: &str) -> String {
    match TokenParts::parse(token) {
        Some(parts) => format!(
            "{TOKEN_PREFIX}_{}_{}…",
            parts.environment,
            &parts.key_id[..4]
        ),
        None => "<malformed>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn issued_tokens_parse_and_verify() {
        let issued = ApiKey::issue(KeyEnvironment::Int, vec!["scan".into()], None, SECRET);
        let token = issued.token.expose();

        let parts = TokenParts::parse(token).unwrap();
        assert_eq!(parts.environment, KeyEnvironment::Int);
        assert_eq!(parts.key_id, issued.record.id);
        assert!(issued.record.verify(SECRET, token));
        assert!(!issued.record.verify(b"another-secret-another-secret-xx", token));
    }

    #[test]
    fn tampered_token_fails_verification() {
        let issued = ApiKey::issue(KeyEnvironment::Dev, Vec::new(), None, SECRET);
        let mut token = issued.token.expose().clone();
        let last = token.pop().unwrap();
        token.push(if last == 'a' { 'b' } else { 'a' });
        assert!(!issued.record.verify(SECRET, &token));
    }

    #[test]
    fn format_check_rejects_bad_shapes() {
        let good = format!("sr_dev_0011aabb{}", "x".repeat(SECRET_LEN));
        assert!(TokenParts::parse(&good).is_some());

        let body = "x".repeat(SECRET_LEN);
        let bad_tokens = [
            String::new(),
            "Bearer abc".to_string(),
            format!("xx_dev_0011aabb{body}"),
            format!("sr_qa_0011aabb{body}"),
            format!("sr_dev_0011AABB{body}"),
            format!("sr_dev_0011aabb{}", &body[1..]),
            format!("sr_dev_0011aabb{}!", &body[1..]),
        ];
        for bad in &bad_tokens {
            assert!(TokenParts::parse(bad).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn expiry_is_inclusive() {
        let issued = ApiKey::issue(
            KeyEnvironment::Dev,
            Vec::new(),
            Some(Duration::seconds(60)),
            SECRET,
        );
        let expires_at = issued.record.expires_at.unwrap();
        assert!(!issued.record.is_expired(expires_at - Duration::seconds(1)));
        assert!(issued.record.is_expired(expires_at));
    }

    #[test]
    fn redaction_shows_only_a_prefix() {
        let issued = ApiKey::issue(KeyEnvironment::Prod, Vec::new(), None, SECRET);
        let token = issued.token.expose();
        let shown = redact(token);
        assert!(shown.starts_with("sr_prod_"));
        assert!(shown.len() < 20);
        assert!(!shown.contains(&token[16..]));
        assert_eq!(redact("garbage"), "<malformed>");
    }

    #[test]
    fn dummy_record_never_verifies_real_tokens() {
        let dummy = ApiKey::dummy(SECRET);
        let issued = ApiKey::issue(KeyEnvironment::Dev, Vec::new(), None, SECRET);
        assert!(!dummy.verify(SECRET, issued.token.expose()));
    }
}
