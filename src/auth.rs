//! Password and CRAM-MD5 authentication.
//!
//! Hash verification follows the original `auth_handler.py`: a `$2a$`/`$2b$`
//! prefix means bcrypt, anything else is treated as a legacy hex-SHA-256
//! hash. A successful legacy-hash login is re-hashed with bcrypt in place,
//! matching the "Legacy SHA-256 upgrade" resolution.

use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::models::{Error as ModelError, User, UserRepository};

const LOCKOUT_THRESHOLD: i32 = 5;
const LOCKOUT_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account temporarily locked, try again later")]
    Locked,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("password hash error: {0}")]
    Hash(String),
}

fn is_locked(user: &User) -> bool {
    if user.failed_auth_attempts < LOCKOUT_THRESHOLD {
        return false;
    }
    match user.last_failed_auth {
        Some(last) => Utc::now() - last < ChronoDuration::minutes(LOCKOUT_WINDOW_MINUTES),
        None => false,
    }
}

fn verify_legacy_sha256(password: &str, stored_hash: &str) -> bool {
    use sha2::Digest;
    let digest = Sha256::digest(password.as_bytes());
    hex::encode(digest).eq_ignore_ascii_case(stored_hash)
}

fn verify_hash(password: &str, stored_hash: &str) -> Result<bool, AuthError> {
    if stored_hash.starts_with("$2a$") || stored_hash.starts_with("$2b$") {
        bcrypt::verify(password, stored_hash).map_err(|e| AuthError::Hash(e.to_string()))
    } else {
        Ok(verify_legacy_sha256(password, stored_hash))
    }
}

/// Authenticates a PLAIN or LOGIN attempt: looks the user up, checks for
/// lockout, verifies the password, and records success/failure. On a
/// successful legacy-hash login, upgrades the stored hash to bcrypt.
pub async fn authenticate_password(
    repo: &UserRepository,
    identifier: &str,
    password: &str,
) -> Result<User, AuthError> {
    let Some(user) = repo.find_by_identifier(identifier).await? else {
        return Err(AuthError::InvalidCredentials);
    };

    if is_locked(&user) {
        return Err(AuthError::Locked);
    }

    let is_legacy = !user.password_hash.starts_with("$2a$") && !user.password_hash.starts_with("$2b$");

    if !verify_hash(password, &user.password_hash)? {
        repo.record_auth_failure(user.id).await?;
        return Err(AuthError::InvalidCredentials);
    }

    repo.record_auth_success(user.id).await?;

    if is_legacy {
        let upgraded = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| AuthError::Hash(e.to_string()))?;
        repo.upgrade_password_hash(user.id, &upgraded).await?;
    }

    Ok(user)
}

/// Verifies a CRAM-MD5 response: `response` is `<username> <hex hmac-md5>`
/// over `challenge`, keyed by the user's reversible `cram_secret`.
pub async fn authenticate_cram_md5(
    repo: &UserRepository,
    challenge: &str,
    response: &str,
) -> Result<User, AuthError> {
    let (identifier, digest_hex) = response
        .rsplit_once(' ')
        .ok_or(AuthError::InvalidCredentials)?;

    let Some(user) = repo.find_by_identifier(identifier).await? else {
        return Err(AuthError::InvalidCredentials);
    };

    if is_locked(&user) {
        return Err(AuthError::Locked);
    }

    let Some(secret) = user.cram_secret.as_deref() else {
        return Err(AuthError::InvalidCredentials);
    };

    let expected = cram_md5_digest(secret, challenge);
    if !constant_time_eq(expected.as_bytes(), digest_hex.as_bytes()) {
        repo.record_auth_failure(user.id).await?;
        return Err(AuthError::InvalidCredentials);
    }

    repo.record_auth_success(user.id).await?;
    Ok(user)
}

fn cram_md5_digest(secret: &str, challenge: &str) -> String {
    type HmacMd5 = Hmac<md5::Md5>;
    let mut mac = HmacMd5::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn legacy_sha256_verifies_against_hex_digest() {
        use sha2::Digest;
        let hash = hex::encode(Sha256::digest(b"hunter2"));
        assert!(verify_legacy_sha256("hunter2", &hash));
        assert!(!verify_legacy_sha256("wrong", &hash));
    }

    #[test]
    fn bcrypt_prefix_detection_routes_correctly() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        assert!(verify_hash("hunter2", &hash).unwrap());
        assert!(!verify_hash("wrong", &hash).unwrap());
    }

    #[test]
    fn cram_md5_digest_is_deterministic() {
        let a = cram_md5_digest("secret", "<1234.123@mail.example.com>");
        let b = cram_md5_digest("secret", "<1234.123@mail.example.com>");
        assert_eq!(a, b);
        assert_ne!(a, cram_md5_digest("other", "<1234.123@mail.example.com>"));
    }
}
