//! Token hashing and at-rest secret encryption.
//!
//! Session tokens are stored as salted SHA-256 digests; credential secret
//! material is sealed with ChaCha20-Poly1305 under a key derived from the
//! shared salt. Neither the token nor the plaintext secret ever lands in
//! the database.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Salted digest of a session token, hex encoded.
pub fn hash_token(token: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"\0");
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Random bearer token for user sessions.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn derive_key(salt: &str) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(b"discobot-credential-key\0");
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    *Key::from_slice(&digest)
}

/// Seal a credential secret. Output layout: `nonce || ciphertext`, hex.
pub fn encrypt_secret(plaintext: &str, salt: &str) -> Result<String> {
    let cipher = ChaCha20Poly1305::new(&derive_key(salt));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| Error::Internal("secret encryption failed".into()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(hex_encode(&out))
}

pub fn decrypt_secret(sealed: &str, salt: &str) -> Result<String> {
    let bytes =
        hex_decode(sealed).ok_or_else(|| Error::Internal("malformed sealed secret".into()))?;
    if bytes.len() < NONCE_LEN {
        return Err(Error::Internal("malformed sealed secret".into()));
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(&derive_key(salt));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Internal("secret decryption failed".into()))?;
    String::from_utf8(plaintext).map_err(|_| Error::Internal("secret is not UTF-8".into()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}
