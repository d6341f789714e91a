//! Key derivation and token encryption.
//!
//! Uses AES-256-GCM with a 32-byte key. The key is either taken from explicit
//! key material (padded or truncated to 32 bytes) or derived from the
//! application secret with PBKDF2-HMAC-SHA256.
//!
//! Ciphertexts are wrapped in `<encrypted v="1">BASE64(nonce||ciphertext)</encrypted>`
//! so the format version travels with every stored value.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::Sha256;

use super::error::StoreError;

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes (96 bits for AES-GCM)
const NONCE_LENGTH: usize = 12;

/// PBKDF2 rounds for the application-secret fallback
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Fixed application salt. Changing it orphans every existing token file.
const KDF_SALT: &[u8] = b"token-store/v1/key-derivation";

/// Current encryption format version
const ENCRYPTION_VERSION: &str = "1";

const ENCRYPTED_PREFIX: &str = "<encrypted v=\"";
const ENCRYPTED_SUFFIX: &str = "</encrypted>";

/// Produce the 32-byte store key.
///
/// Explicit key material wins: shorter input is right-padded with zero bytes,
/// longer input is truncated. Without it, the application secret is stretched
/// through PBKDF2. Blank inputs count as absent.
pub fn derive_key(
    explicit: Option<&str>,
    app_secret: Option<&str>,
) -> Result<[u8; KEY_LENGTH], StoreError> {
    let explicit = explicit.filter(|k| !k.trim().is_empty());
    let app_secret = app_secret.filter(|s| !s.trim().is_empty());

    if let Some(material) = explicit {
        let bytes = material.as_bytes();
        let mut key = [0u8; KEY_LENGTH];
        let n = bytes.len().min(KEY_LENGTH);
        key[..n].copy_from_slice(&bytes[..n]);
        if bytes.len() < KEY_LENGTH {
            tracing::warn!(
                "Explicit key material is {} bytes, padding to {}",
                bytes.len(),
                KEY_LENGTH
            );
        }
        return Ok(key);
    }

    let secret = app_secret.ok_or_else(|| {
        StoreError::Configuration(
            "no encryption key and no application secret to derive one from".to_string(),
        )
    })?;

    let mut key = [0u8; KEY_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, PBKDF2_ITERATIONS, &mut key);
    tracing::debug!("Derived store key from application secret");
    Ok(key)
}

/// Generate a new random key.
pub fn generate_key() -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Check if a value carries the encryption envelope.
pub fn is_encrypted(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.starts_with(ENCRYPTED_PREFIX) && trimmed.ends_with(ENCRYPTED_SUFFIX)
}

/// Split an envelope into (version, base64_payload).
fn parse_envelope(value: &str) -> Option<(&str, &str)> {
    let trimmed = value.trim();
    if !is_encrypted(trimmed) {
        return None;
    }

    let after_prefix = &trimmed[ENCRYPTED_PREFIX.len()..];
    let version_end = after_prefix.find("\">")?;
    let version = &after_prefix[..version_end];

    let payload_start = ENCRYPTED_PREFIX.len() + version_end + 2;
    let payload_end = trimmed.len() - ENCRYPTED_SUFFIX.len();
    if payload_start > payload_end {
        return None;
    }

    Some((version, &trimmed[payload_start..payload_end]))
}

/// Authenticated encryption of token strings under one key.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher { .. }")
    }
}

impl TokenCipher {
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt `plaintext` with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| StoreError::Validation("secret is too large to encrypt"))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!(
            "{}{}\">{}{}",
            ENCRYPTED_PREFIX,
            ENCRYPTION_VERSION,
            BASE64.encode(&combined),
            ENCRYPTED_SUFFIX
        ))
    }

    /// Decrypt a value produced by [`TokenCipher::encrypt`].
    pub fn decrypt(&self, value: &str) -> Result<String, StoreError> {
        let (version, payload) = parse_envelope(value)
            .ok_or_else(|| StoreError::Decryption("value is not an encrypted envelope".to_string()))?;

        if version != ENCRYPTION_VERSION {
            return Err(StoreError::Decryption(format!(
                "unsupported encryption version: {}. Expected: {}",
                version, ENCRYPTION_VERSION
            )));
        }

        let combined = BASE64
            .decode(payload)
            .map_err(|e| StoreError::Decryption(format!("invalid base64 payload: {}", e)))?;

        if combined.len() < NONCE_LENGTH {
            return Err(StoreError::Decryption("encrypted value too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                StoreError::Decryption("invalid key or corrupted data".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| StoreError::Decryption("decrypted value is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_LENGTH] {
        let mut key = [0u8; KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = TokenCipher::new(&test_key());
        let encrypted = cipher.encrypt("lastfm-session-key-12345").unwrap();

        assert!(is_encrypted(&encrypted));
        assert!(encrypted.starts_with("<encrypted v=\"1\">"));
        assert!(!encrypted.contains("lastfm-session-key-12345"));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "lastfm-session-key-12345");
    }

    #[test]
    fn test_different_encryptions_differ() {
        let cipher = TokenCipher::new(&test_key());
        let a = cipher.encrypt("same-data").unwrap();
        let b = cipher.encrypt("same-data").unwrap();

        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "same-data");
        assert_eq!(cipher.decrypt(&b).unwrap(), "same-data");
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut other = test_key();
        other[0] = 255;

        let encrypted = TokenCipher::new(&test_key()).encrypt("secret").unwrap();
        let err = TokenCipher::new(&other).decrypt(&encrypted).unwrap_err();
        assert!(err.is_decryption());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let cipher = TokenCipher::new(&test_key());
        let encrypted = cipher.encrypt("secret").unwrap();
        let (_, payload) = parse_envelope(&encrypted).unwrap();
        let mut raw = BASE64.decode(payload).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = format!("<encrypted v=\"1\">{}</encrypted>", BASE64.encode(&raw));

        assert!(cipher.decrypt(&tampered).unwrap_err().is_decryption());
    }

    #[test]
    fn test_malformed_values_fail() {
        let cipher = TokenCipher::new(&test_key());
        for bad in [
            "plaintext",
            "<encrypted v=\"2\">AAAA</encrypted>",
            "<encrypted v=\"1\">***</encrypted>",
            "<encrypted v=\"1\">AAAA</encrypted>",
            "<encrypted v=\"1\"></encrypted>",
        ] {
            assert!(cipher.decrypt(bad).unwrap_err().is_decryption(), "{}", bad);
        }
    }

    #[test]
    fn test_unicode_content() {
        let cipher = TokenCipher::new(&test_key());
        let plaintext = "Hello, 世界! 🎉";
        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_short_explicit_key_is_padded() {
        let key = derive_key(Some("abc"), None).unwrap();
        assert_eq!(&key[..3], b"abc");
        assert!(key[3..].iter().all(|b| *b == 0));
        assert_eq!(key, derive_key(Some("abc"), Some("ignored")).unwrap());
    }

    #[test]
    fn test_long_explicit_key_is_truncated() {
        let material = "0123456789abcdef0123456789abcdefTAIL";
        let key = derive_key(Some(material), None).unwrap();
        assert_eq!(&key[..], &material.as_bytes()[..KEY_LENGTH]);
    }

    #[test]
    fn test_app_secret_derivation_is_deterministic() {
        let a = derive_key(None, Some("flask-secret")).unwrap();
        let b = derive_key(Some("  "), Some("flask-secret")).unwrap();
        let c = derive_key(None, Some("other-secret")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(&a[..12], b"flask-secret");
    }

    #[test]
    fn test_missing_key_material_is_configuration_error() {
        let err = derive_key(None, None).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(matches!(
            derive_key(Some(""), Some(" ")).unwrap_err(),
            StoreError::Configuration(_)
        ));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(generate_key(), generate_key());
    }
}
