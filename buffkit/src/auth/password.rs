//! Password hashing using Argon2id.
//!
//! Verification is constant-time via the PHC framework. For unknown
//! accounts the login path verifies against a fixed dummy digest so the
//! response time matches a wrong-password attempt.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as Argon2Hasher, PasswordVerifier,
        SaltString,
    },
    Argon2,
};

use crate::error::{Error, Result};

/// Password hasher using Argon2id with the library's recommended defaults.
#[derive(Clone)]
pub struct PasswordHasher {
    min_password_length: usize,
    dummy_digest: String,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(8)
    }
}

impl PasswordHasher {
    /// Create a hasher enforcing a minimum password length.
    ///
    /// # Panics
    ///
    /// Never in practice: hashing the built-in dummy password only fails if
    /// the RNG is broken, and nothing works then anyway.
    #[must_use]
    pub fn new(min_password_length: usize) -> Self {
        let salt = SaltString::generate(&mut OsRng);
        let dummy_digest = Argon2::default()
            .hash_password(b"buffkit-dummy-password", &salt)
            .expect("argon2 hashing with default parameters")
            .to_string();
        Self {
            min_password_length,
            dummy_digest,
        }
    }

    /// Hash a password into PHC string format.
    ///
    /// # Errors
    ///
    /// Validation error when the password is shorter than the configured
    /// minimum; auth error for cryptographic failures.
    pub fn hash(&self, password: &str) -> Result<String> {
        if password.len() < self.min_password_length {
            return Err(Error::invalid_field(
                "password",
                format!(
                    "password must be at least {} characters",
                    self.min_password_length
                ),
            ));
        }

        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Auth(format!("failed to hash password: {e}")))?;
        Ok(hash.to_string())
    }

    /// Verify a password against a PHC-format digest.
    ///
    /// # Errors
    ///
    /// Auth error when the digest is not parseable; a mismatched password
    /// is `Ok(false)`, not an error.
    pub fn verify(&self, password: &str, digest: &str) -> Result<bool> {
        let parsed = PasswordHash::new(digest)
            .map_err(|e| Error::Auth(format!("invalid password digest: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Auth(format!("password verification failed: {e}"))),
        }
    }

    /// Burn the same work as a real verification without a real account.
    ///
    /// Always returns `false`. Called on the unknown-email login path so
    /// that path is not observably faster than a wrong password.
    #[must_use]
    pub fn verify_dummy(&self, password: &str) -> bool {
        let _ = self.verify(password, &self.dummy_digest);
        false
    }

    /// Minimum accepted password length.
    #[must_use]
    pub fn min_password_length(&self) -> usize {
        self.min_password_length
    }
}
