//! Message-level envelope protection.
//!
//! Two primitives, layered:
//! - every message carries a random nonce and a hex HMAC-SHA256 signature
//!   over content ‖ nonce under the endpoint's signature key;
//! - when AES protection is selected, the content is sealed with AES-256-GCM
//!   (random 96-bit nonce prepended to the ciphertext, base64-encoded)
//!   before signing, so the signature always binds the on-wire bytes.
//!
//! The GCM key is SHA-256 of the caller-supplied signature key, which admits
//! the full accepted key-length range [8, 128] with one cipher.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of the random message nonce (before base64).
pub const MESSAGE_NONCE_LEN: usize = 16;

const GCM_NONCE_LEN: usize = 12;
const MIN_KEY_LEN: usize = 8;
const MAX_KEY_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("signature key is required")]
    KeyRequired,

    #[error("AES key length {0} outside accepted range [8, 128]")]
    InvalidKeyLength(usize),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Generate a fresh replay-protection nonce: base64 of 16 random bytes.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; MESSAGE_NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Check an AES signature key length.
///
/// Lengths outside [8, 128] are rejected; anything that is not a canonical
/// AES size (16/24/32) is accepted with a warning.
pub fn validate_aes_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::KeyRequired);
    }
    if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    if !matches!(key.len(), 16 | 24 | 32) {
        warn!(key_len = key.len(), "non-canonical AES key length, deriving a 256-bit key");
    }
    Ok(())
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    validate_aes_key(key)?;
    let mut derived: [u8; 32] = Sha256::digest(key).into();
    let cipher = Aes256Gcm::new_from_slice(&derived).map_err(|e| CryptoError::Encrypt(e.to_string()));
    scrub(&mut derived);
    cipher
}

/// Seal plaintext under the signature key: base64(gcm-nonce ‖ ciphertext).
pub fn encrypt_content(key: &[u8], plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = cipher_for(key)?;

    let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let mut output = nonce_bytes.to_vec();
    output.extend(ciphertext);
    Ok(BASE64.encode(output))
}

/// Open a payload produced by [`encrypt_content`].
pub fn decrypt_content(key: &[u8], payload: &str) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;

    let raw = BASE64
        .decode(payload)
        .map_err(|e| CryptoError::Decrypt(format!("invalid base64 payload: {e}")))?;
    if raw.len() < GCM_NONCE_LEN {
        return Err(CryptoError::Decrypt("payload shorter than nonce".to_string()));
    }

    let (nonce_bytes, ciphertext) = raw.split_at(GCM_NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))
}

/// Hex HMAC-SHA256 over content ‖ nonce.
pub fn sign(key: &[u8], content: &str, nonce: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(content.as_bytes());
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature verification.
pub fn verify(key: &[u8], content: &str, nonce: &str, signature: &str) -> bool {
    let expected = sign(key, content, nonce);
    bool::from(expected.as_bytes().ct_eq(signature.as_bytes()))
}

/// Overwrite key material in place. Secrets live only for the duration of one
/// preprocess or verify call; callers scrub their local copies with this.
pub fn scrub(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_nonce_is_random_and_sized() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), MESSAGE_NONCE_LEN);
    }

    #[test]
    fn test_key_length_bounds() {
        assert!(matches!(validate_aes_key(b""), Err(CryptoError::KeyRequired)));
        assert!(matches!(validate_aes_key(&[0u8; 7]), Err(CryptoError::InvalidKeyLength(7))));
        assert!(validate_aes_key(&[0u8; 8]).is_ok());
        assert!(validate_aes_key(&[0u8; 16]).is_ok());
        assert!(validate_aes_key(&[0u8; 24]).is_ok());
        assert!(validate_aes_key(&[0u8; 32]).is_ok());
        assert!(validate_aes_key(&[0u8; 128]).is_ok());
        assert!(matches!(validate_aes_key(&[0u8; 129]), Err(CryptoError::InvalidKeyLength(129))));
    }

    #[test]
    fn test_encrypt_round_trip() {
        let sealed = encrypt_content(KEY, b"attack at dawn").unwrap();
        assert_ne!(sealed.as_bytes(), b"attack at dawn");
        let opened = decrypt_content(KEY, &sealed).unwrap();
        assert_eq!(opened, b"attack at dawn");
    }

    #[test]
    fn test_encrypt_is_randomized() {
        let a = encrypt_content(KEY, b"same plaintext").unwrap();
        let b = encrypt_content(KEY, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_rejects_wrong_key() {
        let sealed = encrypt_content(KEY, b"secret").unwrap();
        let err = decrypt_content(b"another-key-entirely", &sealed);
        assert!(matches!(err, Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn test_decrypt_rejects_tampering() {
        let sealed = encrypt_content(KEY, b"secret").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(decrypt_content(KEY, &tampered).is_err());
    }

    #[test]
    fn test_decrypt_rejects_truncated_payload() {
        assert!(matches!(
            decrypt_content(KEY, &BASE64.encode([0u8; 4])),
            Err(CryptoError::Decrypt(_))
        ));
        assert!(decrypt_content(KEY, "!!not base64!!").is_err());
    }

    #[test]
    fn test_non_canonical_key_still_round_trips() {
        let key = b"nine-char"; // 9 bytes: accepted with a warning
        let sealed = encrypt_content(key, b"payload").unwrap();
        assert_eq!(decrypt_content(key, &sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_sign_verify() {
        let nonce = generate_nonce();
        let sig = sign(KEY, "content", &nonce);
        assert_eq!(sig.len(), 64); // hex SHA-256
        assert!(verify(KEY, "content", &nonce, &sig));
        assert!(!verify(KEY, "content2", &nonce, &sig));
        assert!(!verify(KEY, "content", "other-nonce", &sig));
        assert!(!verify(b"wrong key", "content", &nonce, &sig));
        assert!(!verify(KEY, "content", &nonce, "deadbeef"));
    }

    #[test]
    fn test_signature_binds_ciphertext_not_plaintext() {
        let nonce = generate_nonce();
        let sealed = encrypt_content(KEY, b"plaintext").unwrap();
        let sig = sign(KEY, &sealed, &nonce);
        assert!(verify(KEY, &sealed, &nonce, &sig));
        assert!(!verify(KEY, "plaintext", &nonce, &sig));
    }

    #[test]
    fn test_scrub() {
        let mut key = *b"sensitive";
        scrub(&mut key);
        assert_eq!(key, [0u8; 9]);
    }
}
