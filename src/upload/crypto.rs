//! Secret-keyed primitives
//!
//! - AES-256-GCM encryption of chunks at rest, keyed by a PBKDF2 derivation
//!   of the server secret (derived once per process)
//! - Uploader fingerprints (one-way hash of the network address)
//! - Unguessable chunk blob names

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed application salt for key derivation
const KDF_SALT: &[u8] = b"chunkdrop-chunk-encryption-salt";

/// GCM nonce length
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Bytes prepended to every encrypted blob
pub const HEADER_LEN: usize = NONCE_LEN + TAG_LEN;

/// Encryption failures
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encrypted blob too short: {0} bytes")]
    Truncated(usize),

    #[error("AEAD encryption failed")]
    EncryptionFailed,

    #[error("AEAD authentication failed")]
    AuthenticationFailed,
}

// ============================================================================
// Chunk Cipher
// ============================================================================

/// Authenticated chunk cipher.
///
/// Blob layout: `nonce (12) || tag (16) || ciphertext`. The blob name is
/// bound as associated data, so a blob moved under another name fails to
/// decrypt.
#[derive(Clone)]
pub struct ChunkCipher {
    cipher: Aes256Gcm,
}

impl ChunkCipher {
    /// Derive the chunk key from the server secret.
    ///
    /// Deliberately slow; build one cipher per process and share it.
    pub fn derive(secret: &str, iterations: u32) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, iterations.max(1), &mut key);
        let cipher = Aes256Gcm::new(&key.into());
        key.fill(0);
        Self { cipher }
    }

    /// Encrypt a chunk for storage under `blob_name`
    pub fn seal(&self, blob_name: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut body = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), blob_name.as_bytes(), &mut body)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(HEADER_LEN + body.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(tag.as_slice());
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    /// Decrypt a stored chunk. Any tampering is an error.
    pub fn open(&self, blob_name: &str, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < HEADER_LEN {
            return Err(CryptoError::Truncated(blob.len()));
        }
        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut body = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                blob_name.as_bytes(),
                &mut body,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Ok(body)
    }
}

// ============================================================================
// Fingerprints & Names
// ============================================================================

/// One-way hash of an uploader's network address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash an address with the server secret. Missing addresses map to `unknown`.
    pub fn from_address(address: Option<&str>, secret: &str) -> Self {
        match address.map(str::trim).filter(|a| !a.is_empty()) {
            Some(address) => {
                let mut hasher = Sha256::new();
                hasher.update(address.as_bytes());
                hasher.update(secret.as_bytes());
                Self(hex::encode(hasher.finalize()))
            }
            None => Self("unknown".to_string()),
        }
    }

    /// Wrap an already-hashed value read back from the ledger
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix suitable for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// On-disk chunk name: `hex(sha256(index ‖ secret ‖ fingerprint ‖ session)) + "_" + index`
pub fn chunk_blob_name(index: u32, secret: &str, owner: &Fingerprint, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(secret.as_bytes());
    hasher.update(owner.as_str().as_bytes());
    hasher.update(session_id.as_bytes());
    format!("{}_{}", hex::encode(hasher.finalize()), index)
}

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn cipher() -> ChunkCipher {
        ChunkCipher::derive(SECRET, 1_000)
    }

    #[test]
    fn test_round_trip_preserves_bytes() {
        let cipher = cipher();
        for len in [0usize, 1, 17, 64 * 1024] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let blob = cipher.seal("blob_0", &data).unwrap();
            assert_eq!(blob.len(), HEADER_LEN + len);
            assert_eq!(cipher.open("blob_0", &blob).unwrap(), data);
        }
    }

    #[test]
    fn test_any_flipped_bit_fails() {
        let cipher = cipher();
        let blob = cipher.seal("blob_0", b"attack at dawn").unwrap();

        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    cipher.open("blob_0", &tampered).is_err(),
                    "flip at byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_blob_bound_to_name() {
        let cipher = cipher();
        let blob = cipher.seal("blob_0", b"payload").unwrap();
        assert!(matches!(
            cipher.open("blob_1", &blob),
            Err(CryptoError::AuthenticationFailed)
        ));
        assert!(matches!(
            cipher.open("blob_0", &blob[..10]),
            Err(CryptoError::Truncated(10))
        ));
    }

    #[test]
    fn test_different_secret_cannot_decrypt() {
        let blob = cipher().seal("blob_0", b"payload").unwrap();
        let other = ChunkCipher::derive("another-secret-another-secret-xx", 1_000);
        assert!(other.open("blob_0", &blob).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_and_opaque() {
        let a = Fingerprint::from_address(Some("203.0.113.7"), SECRET);
        let b = Fingerprint::from_address(Some("203.0.113.7"), SECRET);
        let c = Fingerprint::from_address(Some("203.0.113.8"), SECRET);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(!a.as_str().contains("203.0.113.7"));
        assert_eq!(a.short().len(), 16);
        assert_eq!(Fingerprint::from_address(None, SECRET).as_str(), "unknown");
        assert_eq!(Fingerprint::from_address(Some("  "), SECRET).as_str(), "unknown");
    }

    #[test]
    fn test_chunk_names_differ_across_sessions() {
        let owner = Fingerprint::from_address(Some("198.51.100.1"), SECRET);
        let a = chunk_blob_name(0, SECRET, &owner, "session-a");
        let b = chunk_blob_name(0, SECRET, &owner, "session-b");
        let a1 = chunk_blob_name(1, SECRET, &owner, "session-a");

        assert_ne!(a, b);
        assert_ne!(a, a1);
        assert!(a.ends_with("_0"));
        assert!(a1.ends_with("_1"));
        assert_eq!(a, chunk_blob_name(0, SECRET, &owner, "session-a"));
    }
}
