//! Secure channel over an established session key.
//!
//! Each direction gets its own key chain derived from the session key via
//! HKDF-SHA256, so a frame reflected back at its sender never verifies.
//! Frames are sealed with ChaCha20-Poly1305; the nonce is
//! `epoch (4, BE) || sequence (8, BE)` and the AAD carries the protocol
//! version, sequence and epoch, binding frame order into the tag.
//!
//! The receiver accepts exactly `last_accepted + 1`. Anything else is
//! `ReplayOrOutOfOrder`, never a silent drop.
//!
//! After `max_frames` frames or `max_age` in one epoch the sender ratchets:
//! `chain_{e+1} = HKDF(chain_e, "ratchet")`, and the old chain is wiped.
//! The receiver follows when it sees epoch `e + 1`.

use std::time::{Duration, Instant};

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::PROTOCOL_VERSION;
use crate::error::CryptoError;
use crate::exchange::{EstablishedKeys, Role};

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

const HKDF_SALT: &[u8] = b"p2p-chatter/channel/hkdf-salt/v1";
const INFO_INITIATOR_TO_RESPONDER: &[u8] = b"p2p-chatter/v1 chain initiator->responder";
const INFO_RESPONDER_TO_INITIATOR: &[u8] = b"p2p-chatter/v1 chain responder->initiator";
const INFO_TRAFFIC: &[u8] = b"p2p-chatter/v1 traffic";
const INFO_RATCHET: &[u8] = b"p2p-chatter/v1 ratchet";

/// One sealed application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureFrame {
    pub sequence: u64,
    pub epoch: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_SIZE],
}

/// When the sender ratchets its key chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    pub max_frames: u64,
    pub max_age: Duration,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_frames: 65_536,
            max_age: Duration::from_secs(15 * 60),
        }
    }
}

struct KeyChain {
    chain_key: Zeroizing<[u8; 32]>,
    cipher: ChaCha20Poly1305,
    epoch: u32,
}

impl KeyChain {
    fn new(session_key: &[u8; 32], direction: &[u8]) -> Result<Self, CryptoError> {
        let chain_key = hkdf_derive(session_key, direction)?;
        Self::at_epoch(chain_key, 0)
    }

    fn at_epoch(chain_key: Zeroizing<[u8; 32]>, epoch: u32) -> Result<Self, CryptoError> {
        let traffic = hkdf_derive(&chain_key, INFO_TRAFFIC)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(traffic.as_slice()));
        Ok(Self {
            chain_key,
            cipher,
            epoch,
        })
    }

    fn next(&self) -> Result<Self, CryptoError> {
        let epoch = self
            .epoch
            .checked_add(1)
            .ok_or(CryptoError::SequenceExhausted)?;
        Self::at_epoch(hkdf_derive(&self.chain_key, INFO_RATCHET)?, epoch)
    }
}

/// Derive a 32-byte key via HKDF-SHA256.
fn hkdf_derive(ikm: &[u8; 32], info: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), ikm);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(info, key.as_mut_slice())
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

fn nonce_for(epoch: u32, sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&epoch.to_be_bytes());
    nonce[4..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

fn aad_for(sequence: u64, epoch: u32) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[0] = PROTOCOL_VERSION;
    aad[1..9].copy_from_slice(&sequence.to_be_bytes());
    aad[9..].copy_from_slice(&epoch.to_be_bytes());
    aad
}

const fn direction_labels(role: Role) -> (&'static [u8], &'static [u8]) {
    match role {
        Role::Initiator => (INFO_INITIATOR_TO_RESPONDER, INFO_RESPONDER_TO_INITIATOR),
        Role::Responder => (INFO_RESPONDER_TO_INITIATOR, INFO_INITIATOR_TO_RESPONDER),
    }
}

/// Sending half: assigns sequence numbers and seals frames.
pub struct FrameSealer {
    chain: KeyChain,
    sent: u64,
    frames_in_epoch: u64,
    epoch_started: Instant,
    policy: RekeyPolicy,
}

impl FrameSealer {
    /// Seal `plaintext` as the next frame (first frame has sequence 1).
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<SecureFrame, CryptoError> {
        if self.frames_in_epoch >= self.policy.max_frames
            || self.epoch_started.elapsed() >= self.policy.max_age
        {
            self.rekey()?;
        }

        let sequence = self
            .sent
            .checked_add(1)
            .ok_or(CryptoError::SequenceExhausted)?;
        let epoch = self.chain.epoch;
        let nonce = nonce_for(epoch, sequence);
        let aad = aad_for(sequence, epoch);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .chain
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut buffer)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(&tag);

        self.sent = sequence;
        self.frames_in_epoch += 1;

        Ok(SecureFrame {
            sequence,
            epoch,
            nonce,
            ciphertext: buffer,
            auth_tag,
        })
    }

    /// Advance to the next key epoch now.
    pub fn rekey(&mut self) -> Result<(), CryptoError> {
        self.chain = self.chain.next()?;
        self.frames_in_epoch = 0;
        self.epoch_started = Instant::now();
        debug!(epoch = self.chain.epoch, "Send chain ratcheted");
        Ok(())
    }

    /// Sequence number of the last sealed frame.
    pub const fn sequence(&self) -> u64 {
        self.sent
    }

    pub const fn epoch(&self) -> u32 {
        self.chain.epoch
    }
}

/// Receiving half: enforces strict ordering and verifies frames.
pub struct FrameOpener {
    chain: KeyChain,
    accepted: u64,
}

impl FrameOpener {
    /// Verify and decrypt the next frame.
    ///
    /// Both error kinds are fatal to the session. On failure the opener
    /// state is unchanged and no plaintext is returned.
    pub fn open(&mut self, frame: &SecureFrame) -> Result<Vec<u8>, CryptoError> {
        let expected = self.expected_sequence()?;
        if frame.sequence != expected {
            return Err(CryptoError::ReplayOrOutOfOrder {
                expected,
                actual: frame.sequence,
            });
        }
        if frame.nonce != nonce_for(frame.epoch, frame.sequence) {
            return Err(CryptoError::AuthenticationFailed);
        }

        let ratcheted = if frame.epoch == self.chain.epoch {
            None
        } else if self.chain.epoch.checked_add(1) == Some(frame.epoch) {
            Some(self.chain.next()?)
        } else {
            return Err(CryptoError::AuthenticationFailed);
        };
        let cipher = ratcheted.as_ref().map_or(&self.chain.cipher, |c| &c.cipher);

        let aad = aad_for(frame.sequence, frame.epoch);
        let mut buffer = frame.ciphertext.clone();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&frame.nonce),
                &aad,
                &mut buffer,
                Tag::from_slice(&frame.auth_tag),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        if let Some(next) = ratcheted {
            self.chain = next;
            debug!(epoch = self.chain.epoch, "Receive chain ratcheted");
        }
        self.accepted = expected;
        Ok(buffer)
    }

    /// Sequence number of the last accepted frame.
    pub const fn sequence(&self) -> u64 {
        self.accepted
    }

    pub const fn epoch(&self) -> u32 {
        self.chain.epoch
    }

    fn expected_sequence(&self) -> Result<u64, CryptoError> {
        self.accepted
            .checked_add(1)
            .ok_or(CryptoError::SequenceExhausted)
    }
}

/// Bidirectional secure channel. Split it to run send and receive
/// concurrently.
pub struct SecureChannel {
    sealer: FrameSealer,
    opener: FrameOpener,
}

impl SecureChannel {
    pub fn new(keys: &EstablishedKeys, policy: RekeyPolicy) -> Result<Self, CryptoError> {
        Self::from_session_key(keys.session_key(), keys.role(), policy)
    }

    pub fn from_session_key(
        session_key: &[u8; 32],
        role: Role,
        policy: RekeyPolicy,
    ) -> Result<Self, CryptoError> {
        let (send_label, recv_label) = direction_labels(role);
        Ok(Self {
            sealer: FrameSealer {
                chain: KeyChain::new(session_key, send_label)?,
                sent: 0,
                frames_in_epoch: 0,
                epoch_started: Instant::now(),
                policy,
            },
            opener: FrameOpener {
                chain: KeyChain::new(session_key, recv_label)?,
                accepted: 0,
            },
        })
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<SecureFrame, CryptoError> {
        self.sealer.seal(plaintext)
    }

    pub fn open(&mut self, frame: &SecureFrame) -> Result<Vec<u8>, CryptoError> {
        self.opener.open(frame)
    }

    pub fn split(self) -> (FrameSealer, FrameOpener) {
        (self.sealer, self.opener)
    }
}

/// Create a matched pair of channels for testing.
///
/// Returns (`initiator_channel`, `responder_channel`).
#[cfg(any(test, feature = "test-utils"))]
pub fn test_channel_pair(
    policy: RekeyPolicy,
) -> Result<(SecureChannel, SecureChannel), CryptoError> {
    use rand::RngCore;

    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    Ok((
        SecureChannel::from_session_key(&key, Role::Initiator, policy)?,
        SecureChannel::from_session_key(&key, Role::Responder, policy)?,
    ))
}
