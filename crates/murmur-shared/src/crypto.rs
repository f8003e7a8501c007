//! Symmetric primitives: XChaCha20-Poly1305 sealing and the BLAKE3 KDF.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

pub fn generate_symmetric_key() -> SymmetricKey {
    random_bytes()
}

/// Seal `plaintext` under a fresh random nonce. Output is `nonce || ciphertext`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce: [u8; NONCE_SIZE] = random_bytes();
    let sealed = XChaCha20Poly1305::new(key.into())
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut framed = nonce.to_vec();
    framed.extend(sealed);
    Ok(framed)
}

pub fn decrypt(key: &SymmetricKey, framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if framed.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, sealed) = framed.split_at(NONCE_SIZE);
    XChaCha20Poly1305::new(key.into())
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// BLAKE3 KDF: the context string gives domain separation, parts are hashed in order.
pub fn derive_key(context: &str, parts: &[&[u8]]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_under_one_key_only() {
        let key = generate_symmetric_key();
        let sealed = encrypt(&key, b"ratchet me").unwrap();
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"ratchet me");
        assert!(decrypt(&generate_symmetric_key(), &sealed).is_err());
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let key = generate_symmetric_key();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_tampering_is_detected() {
        let key = generate_symmetric_key();
        let mut sealed = encrypt(&key, b"important").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(decrypt(&key, &sealed).is_err());
        assert!(decrypt(&key, &[0u8; NONCE_SIZE - 1]).is_err());
    }

    #[test]
    fn test_derive_key_separates_contexts_and_parts() {
        let a = derive_key("ctx-a", &[b"secret", b"one"]);
        assert_eq!(a, derive_key("ctx-a", &[b"secret", b"one"]));
        assert_ne!(a, derive_key("ctx-b", &[b"secret", b"one"]));
        assert_ne!(a, derive_key("ctx-a", &[b"secret", b"two"]));
    }
}
