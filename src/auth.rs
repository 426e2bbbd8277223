use anyhow::{anyhow, Result};
use tracing::debug;

use crate::storage::{Index, StorageError};

/// Authentication outcomes the protocol layers translate to wire
/// codes. `TotpRequired` is distinguishable so a session can tell the
/// client what is missing.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication failed")]
    InvalidCredentials,
    #[error("TOTP code required")]
    TotpRequired,
    #[error("account is disabled")]
    Inactive,
    #[error("storage failure")]
    Transient,
}

#[derive(Clone, Debug)]
pub struct Principal {
    pub email: String,
    pub admin: bool,
}

#[derive(Clone)]
pub struct Authenticator {
    index: Index,
}

impl Authenticator {
    pub fn new(index: Index) -> Self {
        Authenticator { index }
    }

    /// Verify `(user, password[:totp])` against the index. The secret
    /// splits on the first `:` so passwords containing colons keep
    /// working when no TOTP is enrolled.
    pub fn authenticate(&self, email: &str, secret: &str) -> Result<Principal, AuthError> {
        let user = match self.index.get_user(email) {
            Ok(u) => u,
            Err(StorageError::NotFound) => return Err(AuthError::InvalidCredentials),
            Err(_) => return Err(AuthError::Transient),
        };
        if !user.active {
            return Err(AuthError::Inactive);
        }

        let (password, totp_code) = match user.totp_secret {
            Some(_) => match secret.split_once(':') {
                Some((p, t)) => (p, Some(t)),
                None => (secret, None),
            },
            None => (secret, None),
        };

        if !verify_password(password, &user.password_hash).unwrap_or(false) {
            debug!(user = email, "password verification failed");
            return Err(AuthError::InvalidCredentials);
        }

        if let Some(hex_secret) = &user.totp_secret {
            let code = totp_code.ok_or(AuthError::TotpRequired)?;
            let key = hex::decode(hex_secret).map_err(|_| AuthError::Transient)?;
            let now = chrono::Utc::now().timestamp() as u64;
            if !totp::verify(&key, code, now) {
                debug!(user = email, "totp verification failed");
                return Err(AuthError::InvalidCredentials);
            }
        }

        Ok(Principal {
            email: user.email,
            admin: user.admin,
        })
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    use argon2::{password_hash::rand_core::OsRng, password_hash::SaltString, Argon2,
                 PasswordHasher};
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("unable to hash password: {}", e))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};
    let parsed = PasswordHash::new(hash).map_err(|e| anyhow!("invalid password hash: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// RFC 6238 time-based one-time passwords: HMAC-SHA1, 30 second step,
/// six digits, one step of clock skew tolerated each way.
pub mod totp {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    const STEP_SECS: u64 = 30;
    const DIGITS: u32 = 6;

    fn hotp(key: &[u8], counter: u64) -> u32 {
        let mut mac = match Hmac::<Sha1>::new_from_slice(key) {
            Ok(m) => m,
            Err(_) => return u32::MAX,
        };
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let offset = (digest[19] & 0xf) as usize;
        let truncated = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        truncated % 10u32.pow(DIGITS)
    }

    pub fn code_at(key: &[u8], unix_secs: u64) -> String {
        format!("{:06}", hotp(key, unix_secs / STEP_SECS))
    }

    pub fn verify(key: &[u8], code: &str, unix_secs: u64) -> bool {
        let code = code.trim();
        if code.len() != DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let step = unix_secs / STEP_SECS;
        for candidate in [step.wrapping_sub(1), step, step + 1] {
            if format!("{:06}", hotp(key, candidate)) == code {
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        // RFC 6238 appendix B test vectors (SHA-1, 8 digits truncated
        // here to the final 6).
        const RFC_KEY: &[u8] = b"12345678901234567890";

        #[test]
        fn rfc6238_vectors() {
            assert_eq!(code_at(RFC_KEY, 59), "287082");
            assert_eq!(code_at(RFC_KEY, 1111111109), "081804");
            assert_eq!(code_at(RFC_KEY, 1234567890), "005924");
        }

        #[test]
        fn verify_accepts_adjacent_steps() {
            let now = 1111111109u64;
            let code = code_at(RFC_KEY, now);
            assert!(verify(RFC_KEY, &code, now));
            assert!(verify(RFC_KEY, &code, now + STEP_SECS));
            assert!(verify(RFC_KEY, &code, now - STEP_SECS));
            assert!(!verify(RFC_KEY, &code, now + 3 * STEP_SECS));
        }

        #[test]
        fn verify_rejects_garbage() {
            assert!(!verify(RFC_KEY, "12345", 59));
            assert!(!verify(RFC_KEY, "abcdef", 59));
            assert!(!verify(RFC_KEY, "000000", 59));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::User;
    use chrono::Utc;

    fn index_with_user(totp_secret: Option<String>, active: bool) -> Index {
        let index = Index::open_in_memory().unwrap();
        index
            .create_user(&User {
                id: 0,
                email: "alice@example.com".into(),
                password_hash: hash_password("hunter2").unwrap(),
                totp_secret,
                quota_bytes: 0,
                active,
                admin: false,
                created_at: Utc::now(),
            })
            .unwrap();
        index
    }

    #[test]
    fn password_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
    }

    #[test]
    fn plain_login() {
        let auth = Authenticator::new(index_with_user(None, true));
        assert!(auth.authenticate("alice@example.com", "hunter2").is_ok());
        assert!(matches!(
            auth.authenticate("alice@example.com", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.authenticate("nobody@example.com", "hunter2"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn inactive_user_is_refused() {
        let auth = Authenticator::new(index_with_user(None, false));
        assert!(matches!(
            auth.authenticate("alice@example.com", "hunter2"),
            Err(AuthError::Inactive)
        ));
    }

    #[test]
    fn totp_flow() {
        let key = b"12345678901234567890";
        let auth = Authenticator::new(index_with_user(Some(hex::encode(key)), true));

        assert!(matches!(
            auth.authenticate("alice@example.com", "hunter2"),
            Err(AuthError::TotpRequired)
        ));

        let now = chrono::Utc::now().timestamp() as u64;
        let secret = format!("hunter2:{}", totp::code_at(key, now));
        assert!(auth.authenticate("alice@example.com", &secret).is_ok());

        assert!(matches!(
            auth.authenticate("alice@example.com", "hunter2:000000"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn colon_password_without_totp() {
        let index = Index::open_in_memory().unwrap();
        index
            .create_user(&User {
                id: 0,
                email: "bob@example.com".into(),
                password_hash: hash_password("pa:ss").unwrap(),
                totp_secret: None,
                quota_bytes: 0,
                active: true,
                admin: false,
                created_at: Utc::now(),
            })
            .unwrap();
        let auth = Authenticator::new(index);
        assert!(auth.authenticate("bob@example.com", "pa:ss").is_ok());
    }
}
