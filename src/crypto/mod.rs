//! Cryptographic primitives for the transport core.
//!
//! This module provides:
//! - ChaCha20-Poly1305 block ciphers with implicit-nonce counters
//! - HKDF key derivation from user credentials
//! - Secure random number generation and traffic-shape padding
//!
//! Secret key material is zeroized on drop.

mod aead;
mod kdf;
mod random;

pub use aead::{select_decrypt, AeadKey, BlockCipher, NonceCounter};
pub use kdf::{derive_user_key, hash_password};
pub use random::{new_padding, padding_len, SecureRandom};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;
