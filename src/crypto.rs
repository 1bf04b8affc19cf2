//! Cryptographic primitives: versioned AEAD, hashing, token pairs
//!
//! Ciphertext wire layout is `[version:1][iv:12][ct+tag:n]`; the minimum
//! valid length is 29 bytes (version + IV + GCM tag). The leading version
//! byte selects the decryption key, which is what makes key rotation a
//! data-at-rest no-op: old ciphertexts self-describe their key.

use aes_gcm::{
    aead::{Aead, Payload},
    Aes256Gcm, Key, KeyInit, Nonce,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Version byte + IV + GCM tag
pub const MIN_CIPHERTEXT_LEN: usize = 1 + IV_LEN + TAG_LEN;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Crypto failure modes
///
/// `OpFailed` deliberately does not say whether the tag check or the cipher
/// itself failed; that distinction is an oracle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Ciphertext shorter than the envelope minimum
    #[error("INVALID_FORMAT: ciphertext too short")]
    InvalidFormat,

    /// Leading version byte does not match any configured key
    #[error("KEY_NOT_FOUND: no key for version {version}")]
    KeyNotFound { version: u8 },

    /// Decryption or encryption failed
    #[error("OP_FAILED")]
    OpFailed,

    /// Key material could not be parsed
    #[error("INVALID_KEY: {reason}")]
    InvalidKey { reason: String },
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    version: u8,
    key: String,
}

/// A set of versioned symmetric keys
///
/// Built from `ENCRYPTION_KEYS` (JSON array of `{version, key}` with
/// base64-encoded 32-byte keys) or a single `ENCRYPTION_KEY` at version 1.
/// `ENCRYPTION_KEYS` takes precedence when both are present.
pub struct KeyRing {
    keys: Vec<(u8, [u8; 32])>,
    current: u8,
}

impl KeyRing {
    /// Build a key ring from the raw environment values
    pub fn from_env(
        encryption_keys: Option<&str>,
        encryption_key: Option<&str>,
    ) -> Result<Self, CryptoError> {
        if let Some(raw) = encryption_keys {
            let entries: Vec<KeyEntry> =
                serde_json::from_str(raw).map_err(|e| CryptoError::InvalidKey {
                    reason: format!("ENCRYPTION_KEYS is not a key array: {e}"),
                })?;
            if entries.is_empty() {
                return Err(CryptoError::InvalidKey {
                    reason: "ENCRYPTION_KEYS is empty".to_string(),
                });
            }
            let mut keys = Vec::with_capacity(entries.len());
            for entry in entries {
                keys.push((entry.version, decode_key(&entry.key)?));
            }
            keys.sort_by_key(|(version, _)| *version);
            let current = keys.last().map(|(version, _)| *version).unwrap_or(1);
            return Ok(Self { keys, current });
        }
        if let Some(raw) = encryption_key {
            return Ok(Self {
                keys: vec![(1, decode_key(raw)?)],
                current: 1,
            });
        }
        Err(CryptoError::InvalidKey {
            reason: "neither ENCRYPTION_KEYS nor ENCRYPTION_KEY is set".to_string(),
        })
    }

    /// Build a key ring from raw key bytes, for tests and embedding
    pub fn from_keys(keys: Vec<(u8, [u8; 32])>) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::InvalidKey {
                reason: "no keys".to_string(),
            });
        }
        let mut keys = keys;
        keys.sort_by_key(|(version, _)| *version);
        let current = keys.last().map(|(version, _)| *version).unwrap_or(1);
        Ok(Self { keys, current })
    }

    /// The version new ciphertexts are produced under
    pub fn current_version(&self) -> u8 {
        self.current
    }

    fn key_for(&self, version: u8) -> Result<&[u8; 32], CryptoError> {
        self.keys
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, key)| key)
            .ok_or(CryptoError::KeyNotFound { version })
    }

    /// Encrypt under the current key with a random IV
    ///
    /// Non-deterministic: two calls over the same plaintext produce
    /// different ciphertexts.
    pub fn encrypt(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        let key = self.key_for(self.current)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or(&[]),
        };
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), payload)
            .map_err(|_| CryptoError::OpFailed)?;

        let mut out = Vec::with_capacity(1 + IV_LEN + sealed.len());
        out.push(self.current);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt, selecting the key by the leading version byte
    pub fn decrypt(&self, ciphertext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < MIN_CIPHERTEXT_LEN {
            return Err(CryptoError::InvalidFormat);
        }
        let version = ciphertext[0];
        let key = self.key_for(version)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

        let iv = &ciphertext[1..1 + IV_LEN];
        let sealed = &ciphertext[1 + IV_LEN..];
        let payload = Payload {
            msg: sealed,
            aad: aad.unwrap_or(&[]),
        };
        cipher
            .decrypt(Nonce::from_slice(iv), payload)
            .map_err(|_| CryptoError::OpFailed)
    }

    /// Rotate a ciphertext to the current key version
    ///
    /// A no-op when the ciphertext is already at the current version.
    pub fn reencrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < MIN_CIPHERTEXT_LEN {
            return Err(CryptoError::InvalidFormat);
        }
        if ciphertext[0] == self.current {
            return Ok(ciphertext.to_vec());
        }
        let plaintext = self.decrypt(ciphertext, None)?;
        self.encrypt(&plaintext, None)
    }
}

fn decode_key(b64: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|_| CryptoError::InvalidKey {
            reason: "key is not valid base64".to_string(),
        })?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKey {
        reason: "key must be 32 bytes".to_string(),
    })
}

/// SHA-256 of a string, lowercase hex
pub fn hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// SHA-256 of raw bytes, lowercase hex
pub fn hash_bytes(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// HMAC-SHA-256, lowercase hex
pub fn hmac(key: &str, message: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string comparison
pub fn compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// A random token and its SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub token: String,
    pub hash: String,
}

/// Generate a 256-bit random token with its hash
///
/// Tokens are drawn from the OS CSPRNG; collisions over any realistic
/// number of draws are negligible.
pub fn pair() -> TokenPair {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    let hash = hash(&token);
    TokenPair { token, hash }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ring() -> KeyRing {
        KeyRing::from_keys(vec![(1, [7u8; 32])]).unwrap()
    }

    fn two_key_ring() -> KeyRing {
        KeyRing::from_keys(vec![(1, [7u8; 32]), (2, [9u8; 32])]).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let ring = ring();
        let ct = ring.encrypt(b"hello", None).unwrap();
        assert_eq!(ring.decrypt(&ct, None).unwrap(), b"hello");
    }

    #[test]
    fn test_roundtrip_with_aad() {
        let ring = ring();
        let ct = ring.encrypt(b"hello", Some(b"tenant-1")).unwrap();
        assert_eq!(ring.decrypt(&ct, Some(b"tenant-1")).unwrap(), b"hello");
        assert_eq!(
            ring.decrypt(&ct, Some(b"tenant-2")).unwrap_err(),
            CryptoError::OpFailed
        );
    }

    #[test]
    fn test_encrypt_is_nondeterministic() {
        let ring = ring();
        let a = ring.encrypt(b"hello", None).unwrap();
        let b = ring.encrypt(b"hello", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ciphertext_length() {
        let ring = ring();
        let ct = ring.encrypt(b"hello", None).unwrap();
        assert_eq!(ct.len(), MIN_CIPHERTEXT_LEN + "hello".len());
        assert_eq!(MIN_CIPHERTEXT_LEN, 29);
    }

    #[test]
    fn test_tamper_detection() {
        let ring = ring();
        let mut ct = ring.encrypt(b"hello", None).unwrap();
        // Flip the low bit of the first ciphertext byte (index 13, past the
        // version byte and IV).
        ct[13] ^= 0x01;
        assert_eq!(ring.decrypt(&ct, None).unwrap_err(), CryptoError::OpFailed);
    }

    #[test]
    fn test_unknown_version() {
        let ring = ring();
        let mut ct = ring.encrypt(b"hello", None).unwrap();
        ct[0] = 99;
        assert_eq!(
            ring.decrypt(&ct, None).unwrap_err(),
            CryptoError::KeyNotFound { version: 99 }
        );
    }

    #[test]
    fn test_short_ciphertext() {
        let ring = ring();
        assert_eq!(
            ring.decrypt(&[1u8; 28], None).unwrap_err(),
            CryptoError::InvalidFormat
        );
    }

    #[test]
    fn test_reencrypt_rotates_version() {
        let v1_only = ring();
        let ct_v1 = v1_only.encrypt(b"rotate me", None).unwrap();
        assert_eq!(ct_v1[0], 1);

        let ring = two_key_ring();
        assert_eq!(ring.current_version(), 2);
        let ct_v2 = ring.reencrypt(&ct_v1).unwrap();
        assert_eq!(ct_v2[0], 2);
        assert_eq!(ring.decrypt(&ct_v2, None).unwrap(), b"rotate me");

        // Already current: byte-identical no-op.
        assert_eq!(ring.reencrypt(&ct_v2).unwrap(), ct_v2);
    }

    #[test]
    fn test_keyring_from_env_precedence() {
        let single = base64::engine::general_purpose::STANDARD.encode([3u8; 32]);
        let keys = format!(
            "[{{\"version\":1,\"key\":\"{}\"}},{{\"version\":2,\"key\":\"{}\"}}]",
            base64::engine::general_purpose::STANDARD.encode([1u8; 32]),
            base64::engine::general_purpose::STANDARD.encode([2u8; 32]),
        );
        // ENCRYPTION_KEYS wins when both are present.
        let ring = KeyRing::from_env(Some(&keys), Some(&single)).unwrap();
        assert_eq!(ring.current_version(), 2);

        let ring = KeyRing::from_env(None, Some(&single)).unwrap();
        assert_eq!(ring.current_version(), 1);

        assert!(KeyRing::from_env(None, None).is_err());
    }

    #[test]
    fn test_sha256_vectors() {
        assert_eq!(
            hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_rfc4231_tc2() {
        assert_eq!(
            hmac("Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_compare() {
        assert!(compare("abc", "abc"));
        assert!(!compare("abc", "abd"));
        assert!(!compare("abc", "abcd"));
    }

    #[test]
    fn test_pair_invariants() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let pair = pair();
            assert_eq!(pair.hash, hash(&pair.token));
            assert!(seen.insert(pair.token), "token collision");
        }
    }
}
