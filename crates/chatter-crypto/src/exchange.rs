//! Password-authenticated key exchange.
//!
//! SPAKE2-style exchange over Ristretto255. Both sides blind their ephemeral
//! public value with a scalar derived from the shared secret through
//! Argon2id, so the secret never crosses the wire and every guess costs an
//! online round trip.
//!
//! ```text
//! initiator                                   responder
//!   ClientHello { name, static, X* = xG + wM } ->
//!                <- ServerHello { name, static, Y* = yG + wN, tag_R }
//!   ClientFinish { tag_I }                     ->
//! ```
//!
//! `K = x(Y* - wN) = y(X* - wM)`. The transcript hash binds both usernames,
//! both static keys and both blinded values; HKDF over `K` and `w` with the
//! transcript as salt yields the session key and the two confirmation keys.
//! Nothing is trusted until the peer's confirmation tag verifies.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::credential::SharedSecret;
use crate::error::CryptoError;
use crate::identity::{Identity, fingerprint_of, validate_username};
use crate::kdf::{KdfParams, derive_key};

/// Argon2id salt for the blinding scalar. Fixed so both sides derive the
/// same `w` before either username is known to the responder.
const PAKE_SALT: &[u8] = b"p2p-chatter/pake/salt/v1";

const TRANSCRIPT_LABEL: &[u8] = b"p2p-chatter/pake/transcript/v1";
const LABEL_M: &[u8] = b"p2p-chatter/pake/M";
const LABEL_N: &[u8] = b"p2p-chatter/pake/N";

const INFO_SESSION_KEY: &[u8] = b"p2p-chatter/v1 session key";
const INFO_INITIATOR_CONFIRM: &[u8] = b"p2p-chatter/v1 initiator confirm";
const INFO_RESPONDER_CONFIRM: &[u8] = b"p2p-chatter/v1 responder confirm";

/// Which side of the exchange we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection.
    Initiator,
    /// Accepted the connection.
    Responder,
}

/// Phase 1: initiator's blinded ephemeral value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub username: String,
    pub static_public: [u8; 32],
    pub blinded: [u8; 32],
}

/// Phase 2: responder's blinded ephemeral value plus its confirmation tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub username: String,
    pub static_public: [u8; 32],
    pub blinded: [u8; 32],
    pub confirmation: [u8; 32],
}

/// Phase 3: initiator's confirmation tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFinish {
    pub confirmation: [u8; 32],
}

/// Output of a successful exchange.
pub struct EstablishedKeys {
    session_key: Zeroizing<[u8; 32]>,
    role: Role,
    peer_username: String,
    peer_static_public: [u8; 32],
    transcript_hash: [u8; 32],
}

impl std::fmt::Debug for EstablishedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedKeys")
            .field("role", &self.role)
            .field("peer_username", &self.peer_username)
            .field("session_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl EstablishedKeys {
    pub fn session_key(&self) -> &[u8; 32] {
        &self.session_key
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub fn peer_username(&self) -> &str {
        &self.peer_username
    }

    pub const fn peer_static_public(&self) -> &[u8; 32] {
        &self.peer_static_public
    }

    pub fn peer_fingerprint(&self) -> String {
        fingerprint_of(&self.peer_static_public)
    }

    pub const fn transcript_hash(&self) -> &[u8; 32] {
        &self.transcript_hash
    }
}

/// Initiator state between sending [`ClientHello`] and receiving [`ServerHello`].
pub struct InitiatorHandshake {
    w: Scalar,
    x: Scalar,
    hello: ClientHello,
    expected_peer: Option<String>,
}

impl Drop for InitiatorHandshake {
    fn drop(&mut self) {
        self.w.zeroize();
        self.x.zeroize();
    }
}

impl InitiatorHandshake {
    /// Derive the blinding scalar and build the first message.
    ///
    /// This runs Argon2id and is CPU/memory heavy; async callers should run
    /// it on a blocking thread.
    pub fn start(
        identity: &Identity,
        secret: &SharedSecret,
        expected_peer: Option<&str>,
        params: KdfParams,
    ) -> Result<Self, CryptoError> {
        let w = password_scalar(secret, params)?;
        let x = random_scalar();
        let blinded = RistrettoPoint::mul_base(&x) + w * point_m();

        Ok(Self {
            w,
            x,
            hello: ClientHello {
                username: identity.username().to_string(),
                static_public: identity.keypair().public_bytes(),
                blinded: blinded.compress().to_bytes(),
            },
            expected_peer: expected_peer.map(str::to_string),
        })
    }

    pub const fn hello(&self) -> &ClientHello {
        &self.hello
    }

    /// Verify the responder's tag and produce our confirmation.
    pub fn finish(
        self,
        reply: &ServerHello,
    ) -> Result<(ClientFinish, EstablishedKeys), CryptoError> {
        validate_username(&reply.username)
            .map_err(|_| CryptoError::MalformedHandshake("responder username"))?;
        let peer_blinded = decode_point(&reply.blinded)?;

        let shared = self.x * (peer_blinded - self.w * point_n());
        if shared.is_identity() {
            return Err(CryptoError::AuthenticationFailed);
        }

        let transcript = transcript_hash(
            &self.hello,
            &reply.username,
            &reply.static_public,
            &reply.blinded,
        );
        let schedule = KeySchedule::derive(&shared, &self.w, &transcript)?;

        let expected_tag = confirmation_tag(&schedule.responder_confirm, &transcript)?;
        if !tags_equal(&expected_tag, &reply.confirmation) {
            return Err(CryptoError::AuthenticationFailed);
        }
        if let Some(expected) = self.expected_peer.as_deref()
            && expected != reply.username
        {
            return Err(CryptoError::AuthenticationFailed);
        }

        let finish = ClientFinish {
            confirmation: confirmation_tag(&schedule.initiator_confirm, &transcript)?,
        };
        let keys = EstablishedKeys {
            session_key: schedule.session_key,
            role: Role::Initiator,
            peer_username: reply.username.clone(),
            peer_static_public: reply.static_public,
            transcript_hash: transcript,
        };
        Ok((finish, keys))
    }
}

/// Responder state before a [`ClientHello`] arrives.
pub struct ResponderHandshake {
    w: Scalar,
    username: String,
    static_public: [u8; 32],
    expected_peer: Option<String>,
}

impl Drop for ResponderHandshake {
    fn drop(&mut self) {
        self.w.zeroize();
    }
}

impl ResponderHandshake {
    /// Derive the blinding scalar ahead of the peer's first message.
    pub fn start(
        identity: &Identity,
        secret: &SharedSecret,
        expected_peer: Option<&str>,
        params: KdfParams,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            w: password_scalar(secret, params)?,
            username: identity.username().to_string(),
            static_public: identity.keypair().public_bytes(),
            expected_peer: expected_peer.map(str::to_string),
        })
    }

    /// Answer a [`ClientHello`]. Keys stay pending until the initiator's
    /// confirmation verifies.
    pub fn respond(
        self,
        hello: &ClientHello,
    ) -> Result<(ServerHello, PendingConfirmation), CryptoError> {
        validate_username(&hello.username)
            .map_err(|_| CryptoError::MalformedHandshake("initiator username"))?;
        let peer_blinded = decode_point(&hello.blinded)?;

        let mut y = random_scalar();
        let own_blinded = (RistrettoPoint::mul_base(&y) + self.w * point_n())
            .compress()
            .to_bytes();
        let shared = y * (peer_blinded - self.w * point_m());
        y.zeroize();
        if shared.is_identity() {
            return Err(CryptoError::AuthenticationFailed);
        }

        let transcript =
            transcript_hash(hello, &self.username, &self.static_public, &own_blinded);
        let schedule = KeySchedule::derive(&shared, &self.w, &transcript)?;

        let reply = ServerHello {
            username: self.username.clone(),
            static_public: self.static_public,
            blinded: own_blinded,
            confirmation: confirmation_tag(&schedule.responder_confirm, &transcript)?,
        };
        let expected_finish = confirmation_tag(&schedule.initiator_confirm, &transcript)?;
        let pending = PendingConfirmation {
            expected_finish: Zeroizing::new(expected_finish),
            expected_peer: self.expected_peer.clone(),
            keys: EstablishedKeys {
                session_key: schedule.session_key,
                role: Role::Responder,
                peer_username: hello.username.clone(),
                peer_static_public: hello.static_public,
                transcript_hash: transcript,
            },
        };
        Ok((reply, pending))
    }
}

/// Responder keys awaiting the initiator's [`ClientFinish`].
pub struct PendingConfirmation {
    expected_finish: Zeroizing<[u8; 32]>,
    expected_peer: Option<String>,
    keys: EstablishedKeys,
}

impl PendingConfirmation {
    pub fn confirm(self, finish: &ClientFinish) -> Result<EstablishedKeys, CryptoError> {
        if !tags_equal(&self.expected_finish, &finish.confirmation) {
            return Err(CryptoError::AuthenticationFailed);
        }
        if let Some(expected) = self.expected_peer.as_deref()
            && expected != self.keys.peer_username
        {
            return Err(CryptoError::AuthenticationFailed);
        }
        Ok(self.keys)
    }
}

struct KeySchedule {
    session_key: Zeroizing<[u8; 32]>,
    initiator_confirm: Zeroizing<[u8; 32]>,
    responder_confirm: Zeroizing<[u8; 32]>,
}

impl KeySchedule {
    fn derive(
        shared: &RistrettoPoint,
        w: &Scalar,
        transcript: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let mut ikm = Zeroizing::new([0u8; 64]);
        ikm[..32].copy_from_slice(shared.compress().as_bytes());
        ikm[32..].copy_from_slice(w.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(transcript.as_slice()), ikm.as_slice());
        let expand = |info: &[u8]| -> Result<Zeroizing<[u8; 32]>, CryptoError> {
            let mut out = Zeroizing::new([0u8; 32]);
            hk.expand(info, out.as_mut_slice())
                .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
            Ok(out)
        };

        Ok(Self {
            session_key: expand(INFO_SESSION_KEY)?,
            initiator_confirm: expand(INFO_INITIATOR_CONFIRM)?,
            responder_confirm: expand(INFO_RESPONDER_CONFIRM)?,
        })
    }
}

fn password_scalar(secret: &SharedSecret, params: KdfParams) -> Result<Scalar, CryptoError> {
    let mut wide = Zeroizing::new([0u8; 64]);
    derive_key(secret.as_bytes(), PAKE_SALT, params, wide.as_mut_slice())?;
    Ok(Scalar::from_bytes_mod_order_wide(&wide))
}

fn random_scalar() -> Scalar {
    let mut wide = Zeroizing::new([0u8; 64]);
    OsRng.fill_bytes(wide.as_mut_slice());
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn hash_to_point(label: &[u8]) -> RistrettoPoint {
    let digest = Sha512::digest(label);
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    RistrettoPoint::from_uniform_bytes(&wide)
}

fn point_m() -> RistrettoPoint {
    hash_to_point(LABEL_M)
}

fn point_n() -> RistrettoPoint {
    hash_to_point(LABEL_N)
}

fn decode_point(bytes: &[u8; 32]) -> Result<RistrettoPoint, CryptoError> {
    let point = CompressedRistretto(*bytes)
        .decompress()
        .ok_or(CryptoError::MalformedHandshake("blinded value is not a group element"))?;
    if point.is_identity() {
        return Err(CryptoError::MalformedHandshake("blinded value is the identity"));
    }
    Ok(point)
}

fn transcript_hash(
    hello: &ClientHello,
    responder_username: &str,
    responder_static: &[u8; 32],
    responder_blinded: &[u8; 32],
) -> [u8; 32] {
    fn field(hasher: &mut Sha256, bytes: &[u8]) {
        #[allow(clippy::cast_possible_truncation)]
        hasher.update((bytes.len() as u32).to_be_bytes());
        hasher.update(bytes);
    }

    let mut hasher = Sha256::new();
    field(&mut hasher, TRANSCRIPT_LABEL);
    field(&mut hasher, hello.username.as_bytes());
    field(&mut hasher, responder_username.as_bytes());
    field(&mut hasher, &hello.static_public);
    field(&mut hasher, responder_static);
    field(&mut hasher, &hello.blinded);
    field(&mut hasher, responder_blinded);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn confirmation_tag(key: &[u8; 32], transcript: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    mac.update(transcript);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

fn tags_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.as_slice().ct_eq(b.as_slice()).into()
}

/// Run both sides of the exchange in memory.
///
/// Returns `(initiator_keys, responder_keys)`.
#[cfg(any(test, feature = "test-utils"))]
pub fn perform_key_exchange(
    initiator: &Identity,
    initiator_secret: &SharedSecret,
    responder: &Identity,
    responder_secret: &SharedSecret,
    params: KdfParams,
) -> Result<(EstablishedKeys, EstablishedKeys), CryptoError> {
    let client = InitiatorHandshake::start(
        initiator,
        initiator_secret,
        Some(responder.username()),
        params,
    )?;
    let server = ResponderHandshake::start(responder, responder_secret, None, params)?;

    let (server_hello, pending) = server.respond(client.hello())?;
    let (finish, initiator_keys) = client.finish(&server_hello)?;
    let responder_keys = pending.confirm(&finish)?;
    Ok((initiator_keys, responder_keys))
}
