//! Token issuance and verification.
//!
//! Access tokens are self-contained HS256 JWTs; possession plus a valid
//! signature and an unexpired `exp` is the whole proof of identity, so they
//! are never persisted. Refresh tokens come in two flavors selected by
//! [`RefreshTokenMode`]: opaque random strings persisted in the
//! [`RefreshStore`] (the default, revocable on logout), or long-lived JWTs
//! signed with a separate secret (no revocation short of key rotation).
//!
//! Every verification failure collapses to the same negative outcome; the
//! caller never learns whether a token expired or was tampered with.

use crate::auth::models::Claims;
use crate::auth::refresh_store::RefreshStore;
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_ACCESS_TTL_SECS: i64 = 3600;
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 90 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTokenMode {
    /// Opaque token persisted server-side. Logout deletes the record, giving
    /// true single-session revocation. Default.
    Stateful,
    /// Signed token verified by signature + expiry alone. Cannot be revoked;
    /// logout degrades to client-side discard.
    Stateless,
}

impl RefreshTokenMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "stateful" => Some(RefreshTokenMode::Stateful),
            "stateless" => Some(RefreshTokenMode::Stateless),
            _ => None,
        }
    }
}

/// Identity proven by a refresh token. Stateful records carry only the user
/// id; stateless claims also carry the email.
#[derive(Debug, Clone)]
pub struct RefreshIdentity {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Derived password hash plus the salt that produced it (hex-encoded).
#[derive(Debug, Clone)]
pub struct PasswordHash {
    pub hash: String,
    pub salt: String,
}

pub struct TokenService {
    access_secret: String,
    refresh_secret: String,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    bcrypt_cost: u32,
    mode: RefreshTokenMode,
    refresh_store: Arc<dyn RefreshStore>,
}

impl TokenService {
    pub fn new(
        access_secret: String,
        refresh_secret: String,
        refresh_store: Arc<dyn RefreshStore>,
    ) -> Self {
        Self {
            access_secret,
            refresh_secret,
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            mode: RefreshTokenMode::Stateful,
            refresh_store,
        }
    }

    pub fn with_access_ttl(mut self, secs: i64) -> Self {
        self.access_ttl_secs = secs;
        self
    }

    pub fn with_refresh_ttl(mut self, secs: i64) -> Self {
        self.refresh_ttl_secs = secs;
        self
    }

    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub fn with_mode(mut self, mode: RefreshTokenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Derives a salted bcrypt hash. Generates a fresh random salt when none
    /// is supplied. CPU-bound: run on the blocking pool from async contexts.
    pub fn hash_password(&self, password: &str, salt: Option<&str>) -> Result<PasswordHash> {
        let salt_bytes: [u8; 16] = match salt {
            Some(s) => hex::decode(s)
                .ok()
                .and_then(|v| v.try_into().ok())
                .context("Invalid password salt")?,
            None => {
                let mut bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        };

        let parts = bcrypt::hash_with_salt(password, self.bcrypt_cost, salt_bytes)
            .context("Failed to hash password")?;

        Ok(PasswordHash {
            hash: parts.to_string(),
            salt: hex::encode(salt_bytes),
        })
    }

    /// Constant-time comparison via bcrypt. Malformed stored hashes count as
    /// a mismatch rather than an error.
    pub fn verify_password(&self, candidate: &str, hash: &str) -> bool {
        bcrypt::verify(candidate, hash).unwrap_or(false)
    }

    /// Signs `{sub, email, exp: now + access_ttl}` with the access secret.
    /// Returns the token and its lifetime in seconds.
    pub fn issue_access_token(&self, user_id: Uuid, email: &str) -> Result<(String, usize)> {
        let token = self.sign(user_id, email, &self.access_secret, self.access_ttl_secs)?;
        debug!(user_id = %user_id, ttl_secs = self.access_ttl_secs, "Issued access token");
        Ok((token, self.access_ttl_secs as usize))
    }

    /// Stateful mode: a cryptographically random opaque token, persisted.
    /// Stateless mode: a long-lived JWT under the refresh secret.
    pub fn issue_refresh_token(&self, user_id: Uuid, email: &str) -> Result<String> {
        match self.mode {
            RefreshTokenMode::Stateful => {
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                let token = hex::encode(bytes);

                let expires_at = Utc::now().timestamp() + self.refresh_ttl_secs;
                self.refresh_store.save(user_id, &token, expires_at)?;
                Ok(token)
            }
            RefreshTokenMode::Stateless => {
                self.sign(user_id, email, &self.refresh_secret, self.refresh_ttl_secs)
            }
        }
    }

    /// Signature + expiry check with zero leeway. Any failure, whether a
    /// bad signature, a malformed token, or expiry, is `None`.
    pub fn verify_access_token(&self, token: &str) -> Option<Claims> {
        Self::decode_claims(token, &self.access_secret)
    }

    /// `Ok(None)` means invalid or expired; `Err` is reserved for store
    /// faults in stateful mode (surfaced as an internal error, never as a
    /// verification verdict).
    pub fn verify_refresh_token(&self, token: &str) -> Result<Option<RefreshIdentity>> {
        match self.mode {
            RefreshTokenMode::Stateful => {
                let record = self.refresh_store.find(token)?;
                Ok(record.map(|r| RefreshIdentity {
                    user_id: r.user_id,
                    email: None,
                }))
            }
            RefreshTokenMode::Stateless => {
                let identity = Self::decode_claims(token, &self.refresh_secret).and_then(|c| {
                    Uuid::parse_str(&c.sub).ok().map(|user_id| RefreshIdentity {
                        user_id,
                        email: Some(c.email),
                    })
                });
                Ok(identity)
            }
        }
    }

    /// Revokes a refresh token. In stateless mode there is nothing to
    /// revoke server-side; the caller can only discard its copy.
    pub fn revoke_refresh_token(&self, token: &str) -> Result<()> {
        match self.mode {
            RefreshTokenMode::Stateful => self.refresh_store.delete(token),
            RefreshTokenMode::Stateless => {
                debug!("Stateless refresh mode: revocation is client-side discard only");
                Ok(())
            }
        }
    }

    fn sign(&self, user_id: Uuid, email: &str, secret: &str, ttl_secs: i64) -> Result<String> {
        let expiration = Utc::now()
            .checked_add_signed(chrono::Duration::seconds(ttl_secs))
            .context("Invalid timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            exp: expiration,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .context("Failed to sign token")
    }

    fn decode_claims(token: &str, secret: &str) -> Option<Claims> {
        let mut validation = Validation::default();
        validation.leeway = 0;

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .ok()
    }
}
