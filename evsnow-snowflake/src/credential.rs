//! Key-pair JWT minting for the Snowflake SQL REST API. spec.md treats
//! credential *loading* (reading a PEM off disk, a secrets manager, etc.)
//! as out of scope for the core — `evsnow-app` resolves a
//! [`ConnectionProfile`] and hands it, already populated, to this crate.
//! Token minting itself belongs here because it's wire-protocol detail,
//! not policy.

use crate::error::SnowflakeError;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use serde::Serialize;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};

/// Everything needed to address one Snowflake account and authenticate
/// against it. Maps to spec.md §6's opaque `connection_profile` option.
#[derive(Clone)]
pub struct ConnectionProfile {
    pub account: String,
    pub user: String,
    pub database: String,
    pub warehouse: String,
    pub role: Option<String>,
    /// PKCS8 PEM-encoded RSA private key, already loaded from wherever the
    /// app layer keeps it.
    pub private_key_pem: Arc<str>,
}

#[derive(Serialize)]
struct Claims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
}

/// Mints and caches the JWT Snowflake's SQL REST API expects in the
/// `Authorization` header, refreshing it shortly before expiry. One
/// instance is shared by every connection a [`crate::pool::SnowflakePool`]
/// hands out, rather than re-authenticating per call.
pub struct TokenProvider {
    profile: ConnectionProfile,
    cached: RwLock<Option<(String, chrono::DateTime<Utc>)>>,
}

impl TokenProvider {
    pub fn new(profile: ConnectionProfile) -> Self {
        Self {
            profile,
            cached: RwLock::new(None),
        }
    }

    pub fn token(&self) -> Result<String, SnowflakeError> {
        if let Some((token, expires_at)) = self.cached.read().expect("lock poisoned").as_ref() {
            if *expires_at > Utc::now() + ChronoDuration::minutes(2) {
                return Ok(token.clone());
            }
        }
        self.mint()
    }

    fn mint(&self) -> Result<String, SnowflakeError> {
        let account_upper = self.profile.account.to_ascii_uppercase();
        let user_upper = self.profile.user.to_ascii_uppercase();

        let public_key_fingerprint = fingerprint_of(&self.profile.private_key_pem)?;
        let qualified_username = format!("{account_upper}.{user_upper}");

        let now = Utc::now();
        let exp = now + ChronoDuration::minutes(55);

        let claims = Claims {
            iss: format!("{qualified_username}.SHA256:{public_key_fingerprint}"),
            sub: qualified_username,
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        let key = EncodingKey::from_rsa_pem(self.profile.private_key_pem.as_bytes())
            .map_err(|e| SnowflakeError::Credential(e.to_string()))?;

        let token = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| SnowflakeError::Credential(e.to_string()))?;

        *self.cached.write().expect("lock poisoned") = Some((token.clone(), exp));
        Ok(token)
    }
}

/// SHA-256 fingerprint of the DER-encoded `SubjectPublicKeyInfo` derived
/// from the private key, base64-encoded, as Snowflake's key-pair auth
/// requires in the JWT issuer claim (`SHA256:<fingerprint>`). Accepts
/// either PKCS8 or PKCS1 PEM, since key material loaded from disk or a
/// secrets manager shows up in either form depending on how it was
/// generated.
fn fingerprint_of(private_key_pem: &str) -> Result<String, SnowflakeError> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
        .map_err(|e| SnowflakeError::Credential(format!("couldn't parse private key: {e}")))?;

    let public_key_der = private_key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| SnowflakeError::Credential(format!("couldn't encode public key: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(public_key_der.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(hasher.finalize()))
}
