//! File object model.

use std::collections::BTreeSet;

use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use chatter_crypto::{KdfParams, NONCE_SIZE, kdf::SALT_LEN};

const ID_PREFIX: &str = "FID-";
const ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A password-protected, checksummed, optionally expiring payload.
///
/// Immutable once created; only its expiry is ever enforced against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    pub name: String,
    /// SHA-256 hex of the plaintext.
    pub checksum: String,
    pub size_bytes: u64,
    /// ChaCha20-Poly1305 output, tag included.
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub salt: [u8; SALT_LEN],
    pub kdf: KdfParams,
    /// Usernames allowed to request the object. Empty means anyone with the password.
    pub recipients: BTreeSet<String>,
    pub created_at_ms: u64,
    /// `None` never expires.
    pub expires_at_ms: Option<u64>,
    pub owner: String,
}

/// Everything about a file object except its ciphertext and key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub recipients: BTreeSet<String>,
    pub created_at_ms: u64,
    pub expires_at_ms: Option<u64>,
    pub owner: String,
}

impl FileObject {
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            checksum: self.checksum.clone(),
            size_bytes: self.size_bytes,
            recipients: self.recipients.clone(),
            created_at_ms: self.created_at_ms,
            expires_at_ms: self.expires_at_ms,
            owner: self.owner.clone(),
        }
    }

    /// Expired strictly after `expires_at_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms > at)
    }

    /// Whether a remote `username` may request this object.
    ///
    /// The owner gets no exemption: a remote peer presenting the owner's
    /// name is still checked against the list.
    pub fn allows(&self, username: &str) -> bool {
        self.recipients.is_empty() || self.recipients.contains(username)
    }

    /// Associated data binding the ciphertext to its id and name.
    pub(crate) fn aad(id: &str, name: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(id.len() + name.len() + 1);
        aad.extend_from_slice(id.as_bytes());
        aad.push(0);
        aad.extend_from_slice(name.as_bytes());
        aad
    }
}

/// Decrypted file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedFile {
    pub metadata: FileMetadata,
    pub payload: Vec<u8>,
}

/// `FID-<unix-millis>-<9 base36 chars>`.
pub fn generate_file_id(now_ms: u64) -> String {
    let mut rng = OsRng;
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect();
    format!("{ID_PREFIX}{now_ms}-{suffix}")
}

pub fn is_valid_file_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix(ID_PREFIX) else {
        return false;
    };
    let Some((millis, suffix)) = rest.split_once('-') else {
        return false;
    };
    !millis.is_empty()
        && millis.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == ID_SUFFIX_LEN
        && suffix.bytes().all(|b| BASE36.contains(&b))
}

/// SHA-256 hex digest used as the integrity checksum.
pub fn checksum_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..100 {
            let id = generate_file_id(1_700_000_000_123);
            assert!(id.starts_with("FID-1700000000123-"), "{id}");
            assert!(is_valid_file_id(&id), "{id}");
        }
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for bad in [
            "",
            "FID-",
            "FID-123",
            "FID-123-short",
            "FID-abc-abcdefghi",
            "XID-123-abcdefghi",
            "FID-123-ABCDEFGHI",
            "FID-123-abcdefghij",
        ] {
            assert!(!is_valid_file_id(bad), "{bad}");
        }
        assert!(is_valid_file_id("FID-123-abcdefghi"));
    }

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
