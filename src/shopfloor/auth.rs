//! Password hashing, bearer sessions and password resets.
//!
//! Passwords are stored as `pbkdf2-sha256$<rounds>$<salt>$<hex key>`.
//! Reset tokens are handed out once and only their digest is kept.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use fabtrack_common::User;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use super::db::TrackerDb;
use super::validate;
use crate::errors::TrackerError;

const SCHEME: &str = "pbkdf2-sha256";
/// Rounds for new hashes. Stored hashes carry their own count.
const ROUNDS: u32 = 10_000;

fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn derive(password: &str, salt: &str, rounds: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), rounds, &mut key);
    key
}

pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let key = derive(password, &salt, ROUNDS);
    format!("{}${}${}${}", SCHEME, ROUNDS, salt, hex::encode(key))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(4, '$');
    let (Some(SCHEME), Some(rounds), Some(salt), Some(expected)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(rounds) = rounds.parse::<u32>() else {
        return false;
    };
    let Ok(expected) = hex::decode(expected) else {
        return false;
    };
    if rounds == 0 || expected.len() != 32 {
        return false;
    }
    let actual = derive(password, salt, rounds);
    bool::from(actual[..].ct_eq(&expected[..]))
}

/// Digest under which reset tokens are stored.
pub fn token_digest(token: &str) -> String {
    digest(token)
}

/// Issues a session token for valid credentials.
pub fn login(
    db: &TrackerDb,
    username: &str,
    password: &str,
    ttl_minutes: i64,
    now: DateTime<Utc>,
) -> Result<(String, User)> {
    let Some((user, stored)) = db.get_credentials(username)? else {
        warn!(username, "login for unknown user");
        return Err(TrackerError::Unauthorized.into());
    };
    if !verify_password(password, &stored) {
        warn!(username, "login with wrong password");
        return Err(TrackerError::Unauthorized.into());
    }
    db.purge_expired_sessions(now)?;
    let token = Uuid::new_v4().simple().to_string();
    db.create_session(&token, user.id, now + Duration::minutes(ttl_minutes))
        .context("Failed to open session")?;
    info!(username, "user logged in");
    Ok((token, user))
}

/// User behind a bearer token.
pub fn authenticate(db: &TrackerDb, token: &str, now: DateTime<Utc>) -> Result<User> {
    db.session_user(token, now)?
        .ok_or_else(|| TrackerError::Unauthorized.into())
}

pub fn logout(db: &TrackerDb, token: &str) -> Result<()> {
    db.delete_session(token)?;
    Ok(())
}

/// Stores a reset token for the user with `email` and returns it.
///
/// Returns `None` for unknown addresses.
pub fn request_password_reset(
    db: &TrackerDb,
    email: &str,
    ttl_minutes: i64,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let Some(user) = db.get_user_by_email(email)? else {
        warn!(email, "password reset for unknown address");
        return Ok(None);
    };
    let token = Uuid::new_v4().simple().to_string();
    db.create_reset_token(
        &token_digest(&token),
        user.id,
        now + Duration::minutes(ttl_minutes),
    )?;
    info!(username = %user.username, "password reset requested");
    Ok(Some(token))
}

pub fn confirm_password_reset(
    db: &TrackerDb,
    token: &str,
    password: &str,
    password_repeat: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    if password != password_repeat {
        return Err(TrackerError::PasswordReset("Passwords do not match".into()).into());
    }
    validate::check_password(password).map_err(TrackerError::PasswordReset)?;
    let Some((user_id, expires_at)) = db.take_reset_token(&token_digest(token))? else {
        return Err(TrackerError::PasswordReset("Invalid reset token".into()).into());
    };
    if expires_at <= now {
        return Err(TrackerError::PasswordReset("Reset token expired".into()).into());
    }
    db.set_password_hash(user_id, &hash_password(password))?;
    info!(user = %user_id, "password reset completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shopfloor::db::NewUser;
    use fabtrack_common::Role;

    fn db_with_user(password: &str) -> Result<(TrackerDb, User)> {
        let db = TrackerDb::new_in_memory()?;
        let user = db.create_user(&NewUser {
            username: "erika".into(),
            password_hash: hash_password(password),
            first_name: "Erika".into(),
            last_name: "Muster".into(),
            email: "erika@example.com".into(),
            roles: vec![Role::Pkp],
            locale: "de".into(),
        })?;
        Ok((db, user))
    }

    fn reset_error(err: &anyhow::Error) -> bool {
        matches!(TrackerError::find(err), Some(TrackerError::PasswordReset(_)))
    }

    #[test]
    fn test_hash_and_verify() {
        let stored = hash_password("Secret123");
        assert!(stored.starts_with("pbkdf2-sha256$10000$"));
        assert!(verify_password("Secret123", &stored));
        assert!(!verify_password("secret123", &stored));
        assert!(!verify_password("Secret123", "plain"));
        assert!(!verify_password("Secret123", "pbkdf2-sha256$0$salt$00"));
        assert!(!verify_password("Secret123", "pbkdf2-sha256$many$salt$00"));
        // Salted: the same password hashes differently.
        assert_ne!(hash_password("Secret123"), stored);
    }

    #[test]
    fn test_verify_uses_stored_round_count() {
        let salt = "0123456789abcdef";
        let key = hex::encode(derive("Secret123", salt, 3));
        let stored = format!("{}$3${}${}", SCHEME, salt, key);
        assert!(verify_password("Secret123", &stored));
        // A truncated key never matches.
        assert!(!verify_password("Secret123", &stored[..stored.len() - 2]));
    }

    #[test]
    fn test_login_and_logout() -> Result<()> {
        let (db, user) = db_with_user("Secret123")?;
        let now = Utc::now();
        let (token, logged_in) = login(&db, "erika", "Secret123", 60, now)?;
        assert_eq!(logged_in.id, user.id);
        assert_eq!(authenticate(&db, &token, now)?.id, user.id);

        // Session runs out after its TTL.
        assert!(authenticate(&db, &token, now + Duration::minutes(61)).is_err());

        logout(&db, &token)?;
        let err = authenticate(&db, &token, now).unwrap_err();
        assert!(matches!(
            TrackerError::find(&err),
            Some(TrackerError::Unauthorized)
        ));
        Ok(())
    }

    #[test]
    fn test_login_rejects_bad_credentials() -> Result<()> {
        let (db, _) = db_with_user("Secret123")?;
        assert!(login(&db, "erika", "wrong", 60, Utc::now()).is_err());
        assert!(login(&db, "nobody", "Secret123", 60, Utc::now()).is_err());
        Ok(())
    }

    #[test]
    fn test_password_reset_flow() -> Result<()> {
        let (db, _) = db_with_user("Secret123")?;
        let now = Utc::now();
        assert!(request_password_reset(&db, "unknown@example.com", 15, now)?.is_none());

        let token = request_password_reset(&db, "erika@example.com", 15, now)?.expect("token");
        let err = confirm_password_reset(&db, &token, "NewSecret1", "Other1234", now).unwrap_err();
        assert!(reset_error(&err));
        let err = confirm_password_reset(&db, &token, "weak", "weak", now).unwrap_err();
        assert!(reset_error(&err));

        confirm_password_reset(&db, &token, "NewSecret1", "NewSecret1", now)?;
        assert!(login(&db, "erika", "NewSecret1", 60, now).is_ok());
        assert!(login(&db, "erika", "Secret123", 60, now).is_err());

        // Tokens are single use.
        let err = confirm_password_reset(&db, &token, "NewSecret2", "NewSecret2", now).unwrap_err();
        assert!(reset_error(&err));
        Ok(())
    }

    #[test]
    fn test_expired_reset_token() -> Result<()> {
        let (db, _) = db_with_user("Secret123")?;
        let now = Utc::now();
        let token = request_password_reset(&db, "erika@example.com", 15, now)?.expect("token");
        let later = now + Duration::minutes(16);
        let err = confirm_password_reset(&db, &token, "NewSecret1", "NewSecret1", later).unwrap_err();
        assert!(reset_error(&err));
        Ok(())
    }
}
