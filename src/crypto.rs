//! Session-key derivation and authenticated encryption.
//!
//! Each peer derives the same 256-bit key independently from
//! (passphrase, room id as salt) via PBKDF2-HMAC-SHA256. Correctness of the
//! derivation is validated implicitly: a wrong passphrase makes every
//! authenticated decryption fail, which is the real security boundary.

use crate::types::{Passphrase, RoomId};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// PBKDF2 iteration count. Slow by design: the passphrase is the only secret.
pub const KDF_ITERATIONS: u32 = 100_000;

/// AEAD nonce length in bytes (96 bits). A fresh random nonce per call.
pub const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    /// Strong symmetric primitives could not be instantiated.
    #[error("insecure context: strong crypto unavailable")]
    InsecureContext,
    /// Ciphertext failed to authenticate (wrong key or tampered data).
    #[error("authentication failure")]
    AuthenticationFailure,
    /// Ciphertext or nonce was not valid base64/UTF-8.
    #[error("malformed payload: {0}")]
    Encoding(String),
}

/// Opaque session key. Held only in memory, never serialized, dropped with
/// the session. Deliberately carries no `Debug` or `Serialize`.
pub struct SessionKey {
    cipher: ChaCha20Poly1305,
}

impl SessionKey {
    /// Derive the session key from the passphrase with the room id as salt.
    ///
    /// The room id is already case-normalized, so both peers salt with the
    /// same bytes regardless of how the room was typed.
    pub fn derive(passphrase: &Passphrase, room: &RoomId) -> Result<Self, CryptoError> {
        let mut okm = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            passphrase.expose().as_bytes(),
            room.as_str().as_bytes(),
            KDF_ITERATIONS,
            &mut okm,
        );
        let cipher =
            ChaCha20Poly1305::new_from_slice(&okm).map_err(|_| CryptoError::InsecureContext)?;
        Ok(Self { cipher })
    }
}

/// Encrypt a UTF-8 string. Returns (ciphertext, nonce), both base64.
pub fn encrypt_text(key: &SessionKey, text: &str) -> Result<(String, String), CryptoError> {
    let (ciphertext, nonce) = encrypt_bytes(key, text.as_bytes())?;
    Ok((BASE64.encode(ciphertext), BASE64.encode(nonce)))
}

/// Decrypt a base64 (ciphertext, nonce) pair back to a UTF-8 string.
pub fn decrypt_text(key: &SessionKey, ciphertext: &str, nonce: &str) -> Result<String, CryptoError> {
    let ciphertext = BASE64
        .decode(ciphertext)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let nonce = BASE64
        .decode(nonce)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let plaintext = decrypt_bytes(key, &ciphertext, &nonce)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Encrypt a binary payload. Returns (ciphertext, fresh 96-bit nonce).
pub fn encrypt_bytes(
    key: &SessionKey,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = key
        .cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::AuthenticationFailure)?;
    Ok((ciphertext, nonce))
}

/// Authenticated decrypt of a binary payload.
pub fn decrypt_bytes(
    key: &SessionKey,
    ciphertext: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::Encoding(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    key.cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailure)
}

/// Base64 SHA-256 digest of the passphrase, stored in the room record as a
/// cheap mismatch check. Not a security boundary: the real check is that
/// ciphertexts fail to authenticate under a wrong key.
pub fn fingerprint(passphrase: &Passphrase) -> String {
    BASE64.encode(Sha256::digest(passphrase.expose().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pass: &str, room: &str) -> SessionKey {
        SessionKey::derive(&Passphrase::new(pass), &RoomId::new(room)).unwrap()
    }

    #[test]
    fn text_round_trip() {
        let k = key("p@ss", "ROOM-C");
        let (ct, iv) = encrypt_text(&k, "hello 你好").unwrap();
        assert_eq!(decrypt_text(&k, &ct, &iv).unwrap(), "hello 你好");
    }

    #[test]
    fn bytes_round_trip() {
        let k = key("p@ss", "ROOM-C");
        let payload: Vec<u8> = (0..=255).collect();
        let (ct, iv) = encrypt_bytes(&k, &payload).unwrap();
        assert_eq!(decrypt_bytes(&k, &ct, &iv).unwrap(), payload);
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let k1 = key("hunter2", "ALPHA-1");
        let k2 = key("hunter3", "ALPHA-1");
        let (ct, iv) = encrypt_text(&k1, "secret").unwrap();
        assert!(matches!(
            decrypt_text(&k2, &ct, &iv),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn room_is_part_of_the_salt() {
        let k1 = key("hunter2", "ALPHA-1");
        let k2 = key("hunter2", "ALPHA-2");
        let (ct, iv) = encrypt_text(&k1, "secret").unwrap();
        assert!(decrypt_text(&k2, &ct, &iv).is_err());
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let k = key("p", "R");
        let (_, iv1) = encrypt_bytes(&k, b"x").unwrap();
        let (_, iv2) = encrypt_bytes(&k, b"x").unwrap();
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn fingerprint_is_deterministic_and_passphrase_bound() {
        let a = fingerprint(&Passphrase::new("hunter2"));
        let b = fingerprint(&Passphrase::new("hunter2"));
        let c = fingerprint(&Passphrase::new("hunter3"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
