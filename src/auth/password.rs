use anyhow::anyhow;
use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;

/// Argon2id hashing for stored user credentials. Every hash carries its own
/// random salt, so the same password never hashes to the same string twice.
#[derive(Clone, Default)]
pub struct Passwords {
    argon: Argon2<'static>,
}

impl Passwords {
    pub fn hash(&self, plain: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon
            .hash_password(plain.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| anyhow!("hash password: {e}"))
    }

    /// `Ok(false)` on mismatch; `Err` when the stored hash is unreadable or
    /// argon2 itself fails.
    pub fn verify(&self, plain: &str, stored: &str) -> anyhow::Result<bool> {
        let parsed = PasswordHash::new(stored).map_err(|e| anyhow!("parse stored hash: {e}"))?;
        match self.argon.verify_password(plain.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(anyhow!("verify password: {e}")),
        }
    }
}
