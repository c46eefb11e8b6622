//! In-memory file object store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use chatter_core::{Clock, FileConfig};
use chatter_crypto::kdf::SALT_LEN;
use chatter_crypto::{CryptoError, KdfParams, NONCE_SIZE, TAG_SIZE, derive_key, generate_salt};

use super::error::FileError;
use super::object::{
    FileMetadata, FileObject, RetrievedFile, checksum_hex, generate_file_id, is_valid_file_id,
};

/// Upper bounds accepted on KDF parameters of imported objects.
const MAX_IMPORT_KDF_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_IMPORT_KDF_ITERATIONS: u32 = 16;
const MAX_IMPORT_KDF_PARALLELISM: u32 = 16;

/// Input to [`FileStore::create`].
pub struct NewFileObject {
    owner: String,
    name: String,
    payload: Zeroizing<Vec<u8>>,
    password: Zeroizing<String>,
    recipients: BTreeSet<String>,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for NewFileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewFileObject")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("size", &self.payload.len())
            .field("recipients", &self.recipients)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl NewFileObject {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            payload: Zeroizing::new(payload.into()),
            password: Zeroizing::new(password.into()),
            recipients: BTreeSet::new(),
            ttl: None,
        }
    }

    /// Restrict remote retrieval to these usernames.
    #[must_use]
    pub fn with_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = recipients.into_iter().map(Into::into).collect();
        self
    }

    /// Lifetime from creation. `Duration::ZERO` never expires; unset uses
    /// the store default.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Creates, holds and opens file objects.
///
/// Objects become visible only once fully encrypted, and every read
/// re-checks expiry against the injected clock.
#[derive(Debug)]
pub struct FileStore {
    objects: RwLock<HashMap<String, Arc<FileObject>>>,
    clock: Arc<dyn Clock>,
    kdf: KdfParams,
    default_ttl: Duration,
    min_password_len: usize,
}

impl FileStore {
    pub fn new(config: &FileConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            clock,
            kdf: KdfParams {
                memory_kib: config.kdf_memory_kib,
                iterations: config.kdf_iterations,
                parallelism: config.kdf_parallelism,
            },
            default_ttl: config.default_ttl(),
            min_password_len: config.min_password_len,
        }
    }

    #[must_use]
    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub const fn kdf_params(&self) -> KdfParams {
        self.kdf
    }

    /// Encrypt and store a new object.
    pub async fn create(&self, new: NewFileObject) -> Result<FileMetadata, FileError> {
        if new.name.trim().is_empty() {
            return Err(FileError::EmptyName);
        }
        if new.payload.is_empty() {
            return Err(FileError::EmptyPayload);
        }
        if new.password.chars().count() < self.min_password_len {
            return Err(FileError::PasswordTooShort {
                min: self.min_password_len,
            });
        }

        let now = self.clock.now_ms();
        let ttl = new.ttl.unwrap_or(self.default_ttl);
        let expires_at_ms = if ttl.is_zero() {
            None
        } else {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            Some(now.saturating_add(ttl_ms))
        };
        let id = generate_file_id(now);

        let kdf = self.kdf;
        let NewFileObject {
            owner,
            name,
            payload,
            password,
            recipients,
            ..
        } = new;
        let aad = FileObject::aad(&id, &name);
        let sealed = tokio::task::spawn_blocking(move || {
            let salt = generate_salt();
            let key = file_key(password.as_bytes(), &salt, kdf)?;
            let mut nonce = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce);
            let ciphertext = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()))
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &payload,
                        aad: &aad,
                    },
                )
                .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
            Ok::<_, FileError>(Sealed {
                salt,
                nonce,
                ciphertext,
                checksum: checksum_hex(&payload),
                size_bytes: payload.len() as u64,
            })
        })
        .await
        .map_err(|e| FileError::Task(e.to_string()))??;

        let object = FileObject {
            id: id.clone(),
            name,
            checksum: sealed.checksum,
            size_bytes: sealed.size_bytes,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            salt: sealed.salt,
            kdf,
            recipients,
            created_at_ms: now,
            expires_at_ms,
            owner,
        };
        let metadata = object.metadata();
        self.insert(object).await?;

        info!(
            file_id = %id,
            name = %metadata.name,
            size = metadata.size_bytes,
            expires_at_ms = ?metadata.expires_at_ms,
            recipients = metadata.recipients.len(),
            "File object created"
        );
        Ok(metadata)
    }

    /// Decrypt an object locally.
    ///
    /// Errors are distinguishable: `NotFound`, `Expired`, `WrongPassword`.
    pub async fn retrieve(&self, id: &str, password: &str) -> Result<RetrievedFile, FileError> {
        let object = self.live(id).await?;
        self.open(object, password).await
    }

    /// Decrypt an object on behalf of `requester`, enforcing the recipient
    /// allow-list.
    ///
    /// Lookup failures still pay for one KDF pass so a remote caller cannot
    /// tell unknown ids from wrong passwords by timing.
    pub async fn retrieve_for(
        &self,
        id: &str,
        password: &str,
        requester: &str,
    ) -> Result<RetrievedFile, FileError> {
        let lookup = self.live(id).await.and_then(|object| {
            if object.allows(requester) {
                Ok(object)
            } else {
                Err(FileError::NotRecipient)
            }
        });
        match lookup {
            Ok(object) => self.open(object, password).await,
            Err(e) => {
                self.equalize_timing(password).await;
                Err(e)
            }
        }
    }

    /// The stored object, if present and not expired.
    pub async fn get(&self, id: &str) -> Result<Arc<FileObject>, FileError> {
        self.live(id).await
    }

    /// Store an encrypted object received from a peer.
    pub async fn import(&self, object: FileObject) -> Result<FileMetadata, FileError> {
        validate_imported(&object)?;
        if object.is_expired_at(self.clock.now_ms()) {
            return Err(FileError::Expired(object.id));
        }
        let metadata = object.metadata();
        self.insert(object).await?;
        info!(file_id = %metadata.id, owner = %metadata.owner, "File object imported");
        Ok(metadata)
    }

    /// Serialize the encrypted form of an object as JSON.
    pub async fn export_json(&self, id: &str) -> Result<String, FileError> {
        let object = self.live(id).await?;
        Ok(serde_json::to_string_pretty(&*object)?)
    }

    pub async fn import_json(&self, json: &str) -> Result<FileMetadata, FileError> {
        let object: FileObject = serde_json::from_str(json)?;
        self.import(object).await
    }

    /// Metadata of every live object, oldest first.
    pub async fn list(&self) -> Vec<FileMetadata> {
        let now = self.clock.now_ms();
        let mut items: Vec<FileMetadata> = self
            .objects
            .read()
            .await
            .values()
            .filter(|o| !o.is_expired_at(now))
            .map(|o| o.metadata())
            .collect();
        items.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        items
    }

    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.objects.write().await.remove(id).is_some();
        if removed {
            debug!(file_id = %id, "File object removed");
        }
        removed
    }

    /// Drop every expired object. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut objects = self.objects.write().await;
        let before = objects.len();
        objects.retain(|_, o| !o.is_expired_at(now));
        let purged = before - objects.len();
        drop(objects);
        if purged > 0 {
            info!(purged, "Purged expired file objects");
        }
        purged
    }

    async fn live(&self, id: &str) -> Result<Arc<FileObject>, FileError> {
        let object = self
            .objects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;
        if object.is_expired_at(self.clock.now_ms()) {
            debug!(file_id = %id, "File object expired");
            return Err(FileError::Expired(id.to_string()));
        }
        Ok(object)
    }

    async fn insert(&self, object: FileObject) -> Result<(), FileError> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(&object.id) {
            return Err(FileError::AlreadyExists(object.id));
        }
        objects.insert(object.id.clone(), Arc::new(object));
        drop(objects);
        Ok(())
    }

    async fn open(
        &self,
        object: Arc<FileObject>,
        password: &str,
    ) -> Result<RetrievedFile, FileError> {
        let password = Zeroizing::new(password.to_owned());
        let target = Arc::clone(&object);
        let payload = tokio::task::spawn_blocking(move || decrypt(&target, password.as_bytes()))
            .await
            .map_err(|e| FileError::Task(e.to_string()))??;

        if checksum_hex(&payload) != object.checksum {
            warn!(file_id = %object.id, "Checksum mismatch after decryption");
            return Err(FileError::ChecksumMismatch(object.id.clone()));
        }
        debug!(file_id = %object.id, "File object opened");
        Ok(RetrievedFile {
            metadata: object.metadata(),
            payload,
        })
    }

    async fn equalize_timing(&self, password: &str) {
        let password = Zeroizing::new(password.to_owned());
        let kdf = self.kdf;
        let _ = tokio::task::spawn_blocking(move || {
            let _ = file_key(password.as_bytes(), &[0u8; SALT_LEN], kdf);
        })
        .await;
    }
}

struct Sealed {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
    checksum: String,
    size_bytes: u64,
}

fn file_key(
    password: &[u8],
    salt: &[u8],
    kdf: KdfParams,
) -> Result<Zeroizing<[u8; 32]>, FileError> {
    let mut key = Zeroizing::new([0u8; 32]);
    derive_key(password, salt, kdf, key.as_mut_slice())?;
    Ok(key)
}

fn decrypt(object: &FileObject, password: &[u8]) -> Result<Vec<u8>, FileError> {
    let key = file_key(password, &object.salt, object.kdf)?;
    ChaCha20Poly1305::new(Key::from_slice(key.as_slice()))
        .decrypt(
            Nonce::from_slice(&object.nonce),
            Payload {
                msg: &object.ciphertext,
                aad: &FileObject::aad(&object.id, &object.name),
            },
        )
        .map_err(|_| FileError::WrongPassword)
}

fn validate_imported(object: &FileObject) -> Result<(), FileError> {
    let invalid = |msg: &str| Err(FileError::InvalidObject(format!("{}: {msg}", object.id)));
    if !is_valid_file_id(&object.id) {
        return invalid("malformed id");
    }
    if object.name.trim().is_empty() {
        return invalid("empty name");
    }
    if object.ciphertext.len() <= TAG_SIZE {
        return invalid("ciphertext too short");
    }
    if object.size_bytes != (object.ciphertext.len() - TAG_SIZE) as u64 {
        return invalid("size does not match ciphertext");
    }
    let kdf = object.kdf;
    if kdf.memory_kib > MAX_IMPORT_KDF_MEMORY_KIB
        || kdf.iterations > MAX_IMPORT_KDF_ITERATIONS
        || kdf.parallelism > MAX_IMPORT_KDF_PARALLELISM
    {
        return invalid("KDF parameters out of range");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use chatter_core::ManualClock;

    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn store_with(clock: Arc<ManualClock>) -> FileStore {
        FileStore::new(&FileConfig::default(), clock)
            .with_kdf_params(KdfParams::insecure_for_tests())
    }

    fn store() -> (FileStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        (store_with(Arc::clone(&clock)), clock)
    }

    fn notes() -> NewFileObject {
        NewFileObject::new("P2P-BoldFox42", "notes.txt", b"meet at dawn".to_vec(), "sw0rdfish")
    }

    #[tokio::test]
    async fn create_then_retrieve_is_idempotent() {
        let (store, _) = store();
        let meta = store.create(notes().with_ttl(Duration::ZERO)).await.unwrap();
        assert_eq!(meta.name, "notes.txt");
        assert_eq!(meta.size_bytes, 12);
        assert_eq!(meta.expires_at_ms, None);
        assert!(is_valid_file_id(&meta.id));

        for _ in 0..3 {
            let file = store.retrieve(&meta.id, "sw0rdfish").await.unwrap();
            assert_eq!(file.payload, b"meet at dawn");
            assert_eq!(checksum_hex(&file.payload), meta.checksum);
        }
    }

    #[tokio::test]
    async fn retrieval_errors_are_distinguishable() {
        let (store, clock) = store();
        let meta = store
            .create(notes().with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(matches!(
            store.retrieve("FID-1-aaaaaaaaa", "sw0rdfish").await,
            Err(FileError::NotFound(_))
        ));
        assert!(matches!(
            store.retrieve(&meta.id, "swordfish").await,
            Err(FileError::WrongPassword)
        ));

        clock.advance(61_000);
        assert!(matches!(
            store.retrieve(&meta.id, "sw0rdfish").await,
            Err(FileError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn expiration_boundary() {
        let (store, clock) = store();
        let meta = store
            .create(notes().with_ttl(Duration::from_secs(1)))
            .await
            .unwrap();
        let expires_at = meta.expires_at_ms.unwrap();
        assert_eq!(expires_at, T0 + 1_000);

        clock.set(expires_at - 1);
        assert!(store.retrieve(&meta.id, "sw0rdfish").await.is_ok());

        clock.set(expires_at);
        assert!(store.retrieve(&meta.id, "sw0rdfish").await.is_ok());

        clock.set(expires_at + 1);
        assert!(matches!(
            store.retrieve(&meta.id, "sw0rdfish").await,
            Err(FileError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn default_ttl_applies_when_unset() {
        let clock = Arc::new(ManualClock::new(T0));
        let config = FileConfig {
            default_ttl_secs: 30,
            ..FileConfig::default()
        };
        let store = FileStore::new(&config, clock).with_kdf_params(KdfParams::insecure_for_tests());

        let meta = store.create(notes()).await.unwrap();
        assert_eq!(meta.expires_at_ms, Some(T0 + 30_000));

        let forever = store.create(notes().with_ttl(Duration::ZERO)).await.unwrap();
        assert_eq!(forever.expires_at_ms, None);
    }

    #[tokio::test]
    async fn creation_is_validated() {
        let (store, _) = store();
        let empty_name = NewFileObject::new("me", "  ", b"x".to_vec(), "sw0rdfish");
        assert!(matches!(store.create(empty_name).await, Err(FileError::EmptyName)));

        let empty = NewFileObject::new("me", "a.txt", Vec::new(), "sw0rdfish");
        assert!(matches!(store.create(empty).await, Err(FileError::EmptyPayload)));

        let weak = NewFileObject::new("me", "a.txt", b"x".to_vec(), "abc");
        assert!(matches!(
            store.create(weak).await,
            Err(FileError::PasswordTooShort { min: 4 })
        ));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn recipients_are_enforced_for_remote_requests() {
        let (store, _) = store();
        let meta = store
            .create(notes().with_recipients(["P2P-SlySpider7"]))
            .await
            .unwrap();

        let ok = store
            .retrieve_for(&meta.id, "sw0rdfish", "P2P-SlySpider7")
            .await
            .unwrap();
        assert_eq!(ok.payload, b"meet at dawn");

        let denied = store
            .retrieve_for(&meta.id, "sw0rdfish", "P2P-SneakyRaven1")
            .await
            .unwrap_err();
        assert!(matches!(denied, FileError::NotRecipient));
        assert!(denied.is_access_failure());

        // the owner's name is not a pass for remote requests
        assert!(matches!(
            store
                .retrieve_for(&meta.id, "sw0rdfish", "P2P-BoldFox42")
                .await,
            Err(FileError::NotRecipient)
        ));
        assert!(store.retrieve(&meta.id, "sw0rdfish").await.is_ok());
    }

    #[tokio::test]
    async fn tampered_object_fails_as_wrong_password() {
        let (store, _) = store();
        let meta = store.create(notes()).await.unwrap();
        let mut object = (*store.get(&meta.id).await.unwrap()).clone();

        // ciphertext is bound to id and name
        object.name = "other.txt".into();
        let (other, _) = self::store();
        other.import(object).await.unwrap();
        assert!(matches!(
            other.retrieve(&meta.id, "sw0rdfish").await,
            Err(FileError::WrongPassword)
        ));
    }

    #[tokio::test]
    async fn export_import_between_stores() {
        let (alice, _) = store();
        let meta = alice.create(notes()).await.unwrap();
        let json = alice.export_json(&meta.id).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.fobj.json");
        std::fs::write(&path, &json).unwrap();

        let (bob, _) = store();
        let imported = bob
            .import_json(&std::fs::read_to_string(&path).unwrap())
            .await
            .unwrap();
        assert_eq!(imported, meta);
        let file = bob.retrieve(&meta.id, "sw0rdfish").await.unwrap();
        assert_eq!(file.payload, b"meet at dawn");

        assert!(matches!(
            bob.import_json(&json).await,
            Err(FileError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn import_rejects_invalid_objects() {
        let (alice, _) = store();
        let meta = alice.create(notes()).await.unwrap();
        let good = (*alice.get(&meta.id).await.unwrap()).clone();
        let (bob, _) = store();

        let mut bad_id = good.clone();
        bad_id.id = "../../etc/passwd".into();
        assert!(matches!(bob.import(bad_id).await, Err(FileError::InvalidObject(_))));

        let mut bad_size = good.clone();
        bad_size.size_bytes += 1;
        assert!(matches!(bob.import(bad_size).await, Err(FileError::InvalidObject(_))));

        let mut costly = good;
        costly.kdf.memory_kib = u32::MAX;
        assert!(matches!(bob.import(costly).await, Err(FileError::InvalidObject(_))));
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let (store, clock) = store();
        store
            .create(notes().with_ttl(Duration::from_secs(1)))
            .await
            .unwrap();
        let keep = store.create(notes().with_ttl(Duration::ZERO)).await.unwrap();

        clock.advance(2_000);
        assert_eq!(store.list().await.len(), 1);
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.purge_expired().await, 0);
        assert_eq!(store.list().await[0].id, keep.id);
    }

    #[tokio::test]
    async fn remove_object() {
        let (store, _) = store();
        let meta = store.create(notes()).await.unwrap();
        assert!(store.remove(&meta.id).await);
        assert!(!store.remove(&meta.id).await);
        assert!(matches!(store.get(&meta.id).await, Err(FileError::NotFound(_))));
    }
}
