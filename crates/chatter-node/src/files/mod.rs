//! File object store.
//!
//! Payloads are encrypted with ChaCha20-Poly1305 under a key derived from the
//! object's password with Argon2id and a fresh per-object salt. The SHA-256
//! checksum only confirms integrity after decryption.

mod error;
mod object;
mod store;

pub use error::FileError;
pub use object::{
    FileMetadata, FileObject, RetrievedFile, checksum_hex, generate_file_id, is_valid_file_id,
};
pub use store::{FileStore, NewFileObject};
