//! Block ciphers with implicit-nonce counters.
//!
//! Uses ChaCha20-Poly1305 for symmetric encryption with authentication.
//! A [`BlockCipher`] operates in one of two modes:
//!
//! - **Stateless**: every ciphertext carries its own random nonce prefix.
//! - **Implicit nonce**: only the first ciphertext carries a nonce; both
//!   peers then advance a synchronized counter, saving 12 bytes per
//!   segment and guaranteeing distinct ciphertexts for identical
//!   plaintexts.
//!
//! The TCP underlay requires implicit-nonce mode.

use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecureRandom, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for block cipher operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// A 96-bit nonce that advances as a little-endian counter.
///
/// Both peers derive the same sequence from the nonce carried by the
/// first ciphertext on a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NonceCounter([u8; NONCE_SIZE]);

impl NonceCounter {
    /// Create a counter from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a counter starting at a fresh random value.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Advance to the next nonce in the sequence.
    pub fn advance(&mut self) {
        for b in self.0.iter_mut() {
            let (v, carry) = b.overflowing_add(1);
            *b = v;
            if !carry {
                break;
            }
        }
    }
}

/// ChaCha20-Poly1305 cipher handle.
///
/// Cloning a handle shares the key (read-only, behind an [`Arc`]) while
/// copying the per-handle nonce counter, so a clone taken before first use
/// starts a fresh nonce sequence and a clone taken mid-stream continues
/// the original's.
#[derive(Clone)]
pub struct BlockCipher {
    cipher: Arc<ChaCha20Poly1305>,
    implicit: bool,
    nonce: Option<NonceCounter>,
}

impl BlockCipher {
    /// Create a stateless cipher handle from a key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: Arc::new(ChaCha20Poly1305::new(key.as_bytes().into())),
            implicit: false,
            nonce: None,
        }
    }

    /// Switch between stateless and implicit-nonce operation.
    ///
    /// The counter state is left untouched; use
    /// [`reset_nonce_counter`](Self::reset_nonce_counter) to restart the
    /// nonce sequence.
    pub fn set_implicit_nonce_mode(&mut self, implicit: bool) {
        self.implicit = implicit;
    }

    /// Whether every ciphertext carries its own nonce.
    pub fn is_stateless(&self) -> bool {
        !self.implicit
    }

    /// Forget the counter state, so the next encryption emits a fresh
    /// nonce (and the next decryption expects one).
    ///
    /// A server derives its send cipher from the selected receive cipher
    /// this way: the key is kept, the counter restarts independently.
    pub fn reset_nonce_counter(&mut self) {
        self.nonce = None;
    }

    /// Encrypt a plaintext.
    ///
    /// Returns `ciphertext || tag`, prefixed with a 12-byte nonce when
    /// this is a stateless handle or the first use of an implicit-nonce
    /// handle.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.implicit {
            if let Some(nonce) = &mut self.nonce {
                nonce.advance();
                let nonce = *nonce;
                return self.seal(&nonce, plaintext);
            }
        }

        let nonce = NonceCounter::random();
        let sealed = self.seal(&nonce, plaintext)?;
        if self.implicit {
            self.nonce = Some(nonce);
        }
        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt `ciphertext || tag`, consuming a nonce prefix when this is
    /// a stateless handle or the first use of an implicit-nonce handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decrypt`] if authentication fails (wrong key,
    /// tampered data, desynchronized counter).
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.implicit {
            if let Some(nonce) = &mut self.nonce {
                nonce.advance();
                let nonce = *nonce;
                return self.open(&nonce, data);
            }
        }

        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Decrypt);
        }
        let mut prefix = [0u8; NONCE_SIZE];
        prefix.copy_from_slice(&data[..NONCE_SIZE]);
        let nonce = NonceCounter::from_bytes(prefix);
        let plaintext = self.open(&nonce, &data[NONCE_SIZE..])?;
        if self.implicit {
            self.nonce = Some(nonce);
        }
        Ok(plaintext)
    }

    fn seal(&self, nonce: &NonceCounter, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(nonce.as_bytes().into(), plaintext)
            .map_err(|_| Error::Crypto("seal failed"))
    }

    fn open(&self, nonce: &NonceCounter, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < TAG_SIZE {
            return Err(Error::Decrypt);
        }
        self.cipher
            .decrypt(nonce.as_bytes().into(), data)
            .map_err(|_| Error::Decrypt)
    }
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("implicit", &self.implicit)
            .field("primed", &self.nonce.is_some())
            .finish()
    }
}

/// Trial-decrypt `data` against each candidate in turn.
///
/// The first candidate whose key authenticates the ciphertext identifies
/// the peer; its primed clone becomes the receive cipher. Candidates are
/// cloned before each trial so a failed attempt leaves no counter state
/// behind.
pub fn select_decrypt(
    data: &[u8],
    candidates: &[BlockCipher],
) -> Result<(BlockCipher, Vec<u8>)> {
    for candidate in candidates {
        let mut trial = candidate.clone();
        if let Ok(plaintext) = trial.decrypt(data) {
            return Ok((trial, plaintext));
        }
    }
    Err(Error::CipherSelection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(fill: u8) -> AeadKey {
        AeadKey::from_bytes([fill; KEY_SIZE])
    }

    fn implicit_pair() -> (BlockCipher, BlockCipher) {
        let mut sender = BlockCipher::new(&test_key(0x11));
        sender.set_implicit_nonce_mode(true);
        let receiver = sender.clone();
        (sender, receiver)
    }

    #[test]
    fn test_stateless_roundtrip() {
        let mut cipher = BlockCipher::new(&test_key(0x01));
        assert!(cipher.is_stateless());

        let sealed = cipher.encrypt(b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + NONCE_SIZE + TAG_SIZE);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"hello");

        // Every message carries a nonce, so identical plaintexts differ.
        let again = cipher.encrypt(b"hello").unwrap();
        assert_ne!(sealed, again);
    }

    #[test]
    fn test_implicit_nonce_omitted_after_first() {
        let (mut sender, mut receiver) = implicit_pair();

        let first = sender.encrypt(b"aaaa").unwrap();
        assert_eq!(first.len(), 4 + NONCE_SIZE + TAG_SIZE);
        assert_eq!(receiver.decrypt(&first).unwrap(), b"aaaa");

        for i in 0u32..300 {
            let msg = i.to_be_bytes();
            let sealed = sender.encrypt(&msg).unwrap();
            assert_eq!(sealed.len(), 4 + TAG_SIZE);
            assert_eq!(receiver.decrypt(&sealed).unwrap(), msg);
        }
    }

    #[test]
    fn test_counter_desync_fails() {
        let (mut sender, mut receiver) = implicit_pair();

        let first = sender.encrypt(b"one").unwrap();
        receiver.decrypt(&first).unwrap();

        let second = sender.encrypt(b"two").unwrap();
        let third = sender.encrypt(b"three").unwrap();
        // Delivering out of order desynchronizes the counters.
        assert!(receiver.decrypt(&third).is_err());
        let _ = second;
    }

    #[test]
    fn test_clone_mid_stream_continues_counter() {
        let (mut sender, mut receiver) = implicit_pair();
        receiver.decrypt(&sender.encrypt(b"first").unwrap()).unwrap();

        // A clone taken mid-stream keeps decrypting where the original
        // left off.
        let mut forked = receiver.clone();
        let sealed = sender.encrypt(b"second").unwrap();
        assert_eq!(forked.decrypt(&sealed).unwrap(), b"second");
    }

    #[test]
    fn test_reset_nonce_counter_starts_fresh_sequence() {
        let (mut sender, mut receiver) = implicit_pair();
        receiver.decrypt(&sender.encrypt(b"first").unwrap()).unwrap();

        // Derive an independent sender from the primed receiver, the way
        // a server builds its send cipher.
        let mut derived = receiver.clone();
        derived.reset_nonce_counter();
        let first = derived.encrypt(b"reply").unwrap();
        assert_eq!(first.len(), 5 + NONCE_SIZE + TAG_SIZE);

        let mut peer = BlockCipher::new(&test_key(0x11));
        peer.set_implicit_nonce_mode(true);
        assert_eq!(peer.decrypt(&first).unwrap(), b"reply");
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut sender = BlockCipher::new(&test_key(0x01));
        let mut other = BlockCipher::new(&test_key(0x02));

        let sealed = sender.encrypt(b"secret").unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(Error::Decrypt)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut cipher = BlockCipher::new(&test_key(0x01));
        let mut sealed = cipher.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut cipher = BlockCipher::new(&test_key(0x01));
        assert!(cipher.decrypt(&[0u8; TAG_SIZE - 1]).is_err());
        assert!(cipher.decrypt(&[0u8; NONCE_SIZE]).is_err());
    }

    #[test]
    fn test_nonce_counter_carry() {
        let mut nonce = NonceCounter::from_bytes([0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        nonce.advance();
        assert_eq!(&nonce.as_bytes()[..3], &[0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_select_decrypt_identifies_candidate() {
        let keys = [test_key(0x0a), test_key(0x0b), test_key(0x0c)];
        let candidates: Vec<BlockCipher> = keys
            .iter()
            .map(|k| {
                let mut c = BlockCipher::new(k);
                c.set_implicit_nonce_mode(true);
                c
            })
            .collect();

        let mut sender = candidates[1].clone();
        let first = sender.encrypt(b"hello from u2").unwrap();

        let (mut recv, plaintext) = select_decrypt(&first, &candidates).unwrap();
        assert_eq!(plaintext, b"hello from u2");

        // The selected cipher is primed and keeps tracking the stream.
        let second = sender.encrypt(b"more").unwrap();
        assert_eq!(recv.decrypt(&second).unwrap(), b"more");
    }

    #[test]
    fn test_select_decrypt_no_match() {
        let candidates = vec![BlockCipher::new(&test_key(0x0a))];
        let mut sender = BlockCipher::new(&test_key(0x0b));
        let sealed = sender.encrypt(b"hi").unwrap();
        assert!(matches!(
            select_decrypt(&sealed, &candidates),
            Err(Error::CipherSelection)
        ));
    }
}
