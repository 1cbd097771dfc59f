//! Key derivation from user credentials.
//!
//! Uses HKDF (HMAC-based Key Derivation Function) with SHA-256 to derive
//! a per-user block cipher key from a hashed password. The mux stores only
//! password hashes; raw passwords never reach this layer at runtime.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::crypto::{AeadKey, KEY_SIZE};

/// Domain separation string for underlay keys.
const KEY_INFO: &[u8] = b"underlay block cipher key";

/// Hash a raw password with SHA-256.
///
/// The result is what configuration stores and what
/// [`derive_user_key`] consumes.
pub fn hash_password(password: &str) -> [u8; 32] {
    let digest = Sha256::digest(password.as_bytes());
    digest.into()
}

/// Derive the block cipher key for one user.
///
/// The user name salts the derivation, so two users sharing a password
/// still get distinct keys and the server can tell them apart by trial
/// decryption.
pub fn derive_user_key(user: &str, password_hash: &[u8; 32]) -> AeadKey {
    let hkdf = Hkdf::<Sha256>::new(Some(user.as_bytes()), password_hash);
    let mut okm = [0u8; KEY_SIZE];
    // Cannot fail: KEY_SIZE is far below the HKDF output limit.
    hkdf.expand(KEY_INFO, &mut okm)
        .expect("HKDF output length is valid");
    AeadKey::from_bytes(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let hash = hash_password("correct horse battery staple");
        let k1 = derive_user_key("alice", &hash);
        let k2 = derive_user_key("alice", &hash);
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_user_name_salts_key() {
        let hash = hash_password("shared password");
        let alice = derive_user_key("alice", &hash);
        let bob = derive_user_key("bob", &hash);
        assert_ne!(alice.as_bytes(), bob.as_bytes());
    }

    #[test]
    fn test_password_changes_key() {
        let k1 = derive_user_key("alice", &hash_password("one"));
        let k2 = derive_user_key("alice", &hash_password("two"));
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }
}
