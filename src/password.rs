//! Password hashing boundary.
//!
//! The wider platform owns the real credential KDF; the workflow only needs
//! "hash on the way in, never store plaintext". `SaltedSha256` is the
//! built-in implementation behind the same trait the platform's hasher
//! plugs into.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Hashing contract consumed by the registration engine.
pub trait PasswordHasher: Send + Sync {
    /// Hash a plaintext password into a storable string.
    fn hash(&self, password: &str) -> String;

    /// Verify a plaintext password against a stored hash.
    fn verify(&self, password: &str, stored: &str) -> bool;
}

/// Salted SHA-256, encoded as `salt$digest` in unpadded base64.
pub struct SaltedSha256;

impl SaltedSha256 {
    fn digest(password: &str, salt: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        STANDARD_NO_PAD.encode(hasher.finalize())
    }
}

impl PasswordHasher for SaltedSha256 {
    fn hash(&self, password: &str) -> String {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = Self::digest(password, &salt);
        format!("{}${digest}", STANDARD_NO_PAD.encode(salt))
    }

    fn verify(&self, password: &str, stored: &str) -> bool {
        let Some((salt_b64, digest)) = stored.split_once('$') else {
            return false;
        };
        let Ok(salt) = STANDARD_NO_PAD.decode(salt_b64) else {
            return false;
        };
        Self::digest(password, &salt) == digest
    }
}
