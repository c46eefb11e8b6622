//! Caller-owned peer session.
//!
//! A [`PeerSession`] drives one connection at a time through
//! `Idle -> Connecting -> KeyExchange -> Established -> Closing -> Closed`,
//! with `Failed(kind)` reachable from any non-terminal state. Once a session
//! ends the same value can connect or accept again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use chatter_core::{Clock, Config, NetworkPolicy, SessionConfig, SystemClock};
use chatter_crypto::{
    EstablishedKeys, FrameOpener, Identity, KdfParams, RekeyPolicy, Role, SecureChannel,
    SharedSecret, fingerprint_of, validate_username, verify_signature,
};

use crate::files::{FileError, FileStore, checksum_hex};
use crate::transport::{BoxedStream, Connection, TransportAdapter, TransportListener};
use crate::wire::{
    ChannelMessage, MessageSignature, WireError, WireMessage, read_message, text_signing_payload,
};

use super::error::SessionError;
use super::handshake::{self, HandshakeParams};
use super::types::{RemoteFile, SessionEvent, SessionState, SignatureStatus};
use super::writer::FrameWriter;

type PendingReply = oneshot::Sender<Result<RemoteFile, SessionError>>;

/// Everything a [`PeerSession`] needs besides its identity and file store.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub network: NetworkPolicy,
    pub session: SessionConfig,
    pub kdf: KdfParams,
    pub transport: TransportAdapter,
    pub clock: Arc<dyn Clock>,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            network: config.network.clone(),
            session: config.session.clone(),
            kdf: KdfParams {
                memory_kib: config.files.kdf_memory_kib,
                iterations: config.files.kdf_iterations,
                parallelism: config.files.kdf_parallelism,
            },
            transport: TransportAdapter::new(),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub const fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportAdapter) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct ActiveSession {
    session_id: Uuid,
    peer_username: String,
    peer_fingerprint: String,
    established_at_ms: u64,
    writer: tokio::sync::Mutex<FrameWriter<WriteHalf<BoxedStream>>>,
    pending: tokio::sync::Mutex<HashMap<u64, PendingReply>>,
    next_request_id: AtomicU64,
    /// Bounds concurrent decryption of the peer's file requests.
    file_requests: Arc<Semaphore>,
    offers: OfferBudget,
    shutdown: CancellationToken,
}

/// What the peer has offered so far in this session, against the limits.
struct OfferBudget {
    files: AtomicUsize,
    bytes: AtomicU64,
    max_files: usize,
    max_bytes: u64,
}

impl OfferBudget {
    fn new(config: &SessionConfig) -> Self {
        Self {
            files: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            max_files: config.max_offered_files,
            max_bytes: config.max_offered_bytes,
        }
    }

    /// Only the reader task charges the budget, so check-then-add is race free.
    fn charge(&self, size: u64) -> Result<(), FileError> {
        let files = self.files.load(Ordering::SeqCst);
        let bytes = self.bytes.load(Ordering::SeqCst);
        if files >= self.max_files {
            return Err(FileError::QuotaExceeded(format!(
                "{} file objects per session",
                self.max_files
            )));
        }
        if bytes.saturating_add(size) > self.max_bytes {
            return Err(FileError::QuotaExceeded(format!(
                "{} offered bytes per session",
                self.max_bytes
            )));
        }
        self.files.store(files + 1, Ordering::SeqCst);
        self.bytes.store(bytes + size, Ordering::SeqCst);
        Ok(())
    }

    fn refund(&self, size: u64) {
        self.files.fetch_sub(1, Ordering::SeqCst);
        self.bytes.fetch_sub(size, Ordering::SeqCst);
    }
}

/// State shared with the background reader.
struct Shared {
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    active: RwLock<Option<Arc<ActiveSession>>>,
    files: Arc<FileStore>,
    clock: Arc<dyn Clock>,
    sent: Arc<AtomicU64>,
    received: AtomicU64,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
        debug!(state = %state, "Session state changed");
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Detach `active` if it is still the current session.
    async fn teardown(&self, active: &Arc<ActiveSession>) -> bool {
        {
            let mut slot = self.active.write().await;
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, active) => *slot = None,
                _ => return false,
            }
        }
        active.shutdown.cancel();
        // Dropping the senders wakes every waiting request.
        active.pending.lock().await.clear();
        true
    }

    async fn fail(&self, active: &Arc<ActiveSession>, err: &SessionError) {
        if !self.teardown(active).await {
            return;
        }
        let kind = err.kind();
        error!(
            session_id = %active.session_id,
            peer = %active.peer_username,
            kind = %kind,
            error = %err,
            "Session failed"
        );
        self.set_state(SessionState::Failed(kind));
        self.emit(SessionEvent::Error {
            kind,
            detail: err.to_string(),
        });
    }

    async fn close_remote(&self, active: &Arc<ActiveSession>) {
        if !self.teardown(active).await {
            return;
        }
        info!(
            session_id = %active.session_id,
            peer = %active.peer_username,
            "Peer closed the session"
        );
        self.set_state(SessionState::Closing);
        self.set_state(SessionState::Closed);
    }
}

/// Result of handling one inbound message.
enum Flow {
    Continue,
    PeerClosed,
}

/// One peer-to-peer chat session.
pub struct PeerSession {
    shared: Arc<Shared>,
    identity: RwLock<Identity>,
    options: SessionOptions,
    attempt: Mutex<CancellationToken>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PeerSession {
    pub fn new(identity: Identity, files: Arc<FileStore>, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(options.session.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state,
                events,
                active: RwLock::new(None),
                files,
                clock: Arc::clone(&options.clock),
                sent: Arc::new(AtomicU64::new(0)),
                received: AtomicU64::new(0),
            }),
            identity: RwLock::new(identity),
            options,
            attempt: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Sequence number of the last frame we sent in the current session.
    pub fn send_sequence(&self) -> u64 {
        self.shared.sent.load(Ordering::SeqCst)
    }

    /// Sequence number of the last frame we accepted in the current session.
    pub fn recv_sequence(&self) -> u64 {
        self.shared.received.load(Ordering::SeqCst)
    }

    pub fn files(&self) -> &Arc<FileStore> {
        &self.shared.files
    }

    pub async fn username(&self) -> String {
        self.identity.read().await.username().to_string()
    }

    pub async fn fingerprint(&self) -> String {
        self.identity.read().await.fingerprint()
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.current().await.map(|a| a.session_id)
    }

    /// Unix millis at which the current session was established.
    pub async fn established_at_ms(&self) -> Option<u64> {
        self.current().await.map(|a| a.established_at_ms)
    }

    pub async fn peer_username(&self) -> Option<String> {
        self.current().await.map(|a| a.peer_username.clone())
    }

    /// Fingerprint of the peer's static key, for out-of-band comparison.
    pub async fn peer_fingerprint(&self) -> Option<String> {
        self.current().await.map(|a| a.peer_fingerprint.clone())
    }

    /// Pick a fresh random username. Only allowed between sessions.
    pub async fn rotate_username(&self) -> Result<String, SessionError> {
        let mut identity = self.identity.write().await;
        let state = self.state();
        if !state.can_start() {
            return Err(SessionError::InvalidState(state));
        }
        let username = identity.rotate_username().to_string();
        info!(username = %username, "Username rotated");
        Ok(username)
    }

    /// Dial `address` and authenticate as the initiator.
    ///
    /// `peer_username` must match the name the responder presents.
    pub async fn connect(
        &self,
        address: &str,
        peer_username: &str,
        secret: SharedSecret,
    ) -> Result<(), SessionError> {
        validate_username(peer_username)?;
        let token = self.begin_attempt()?;
        if secret.is_weak() {
            warn!("Shared secret is shorter than recommended");
        }
        info!(address, peer = peer_username, "Connecting to peer");

        let attempt = async {
            let connection = self
                .options
                .transport
                .connect(address, &self.options.network)
                .await?;
            let params = self.handshake_params(secret, Some(peer_username)).await;
            self.key_exchange(connection, params, Role::Initiator).await
        };
        self.finish_attempt(&token, attempt).await
    }

    /// Wait for one inbound connection on `listener` and authenticate it.
    pub async fn accept(
        &self,
        listener: &TransportListener,
        secret: SharedSecret,
    ) -> Result<(), SessionError> {
        let token = self.begin_attempt()?;
        let attempt = async {
            let connection = listener.accept().await?;
            let params = self.handshake_params(secret, None).await;
            self.key_exchange(connection, params, Role::Responder).await
        };
        self.finish_attempt(&token, attempt).await
    }

    /// Authenticate an already accepted connection as the responder.
    pub async fn accept_connection(
        &self,
        connection: Connection,
        secret: SharedSecret,
    ) -> Result<(), SessionError> {
        let token = self.begin_attempt()?;
        let attempt = async {
            let params = self.handshake_params(secret, None).await;
            self.key_exchange(connection, params, Role::Responder).await
        };
        self.finish_attempt(&token, attempt).await
    }

    /// Abort an in-flight connect or accept. The pending call returns
    /// [`SessionError::Cancelled`] and the session ends up `Closed`.
    pub fn cancel(&self) {
        let token = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
    }

    /// Gracefully end the session. A no-op when nothing is running.
    pub async fn close(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Connecting | SessionState::KeyExchange => {
                self.cancel();
                Ok(())
            }
            SessionState::Established => {
                let Some(active) = self.current().await else {
                    return Ok(());
                };
                self.shared.set_state(SessionState::Closing);
                {
                    let mut writer = active.writer.lock().await;
                    if let Err(e) = writer.send(&ChannelMessage::Close).await {
                        debug!(error = %e, "Close notification not delivered");
                    }
                    writer.shutdown().await;
                }
                if self.shared.teardown(&active).await {
                    info!(session_id = %active.session_id, "Session closed");
                    self.shared.set_state(SessionState::Closed);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Send a chat message. Returns the frame's sequence number.
    pub async fn send_message(&self, body: &str) -> Result<u64, SessionError> {
        self.send_text(body, false).await
    }

    /// Send a chat message signed with the identity's Ed25519 key.
    pub async fn send_signed_message(&self, body: &str) -> Result<u64, SessionError> {
        self.send_text(body, true).await
    }

    /// Fingerprint of the key behind [`PeerSession::send_signed_message`].
    pub async fn signing_fingerprint(&self) -> String {
        self.identity.read().await.signing_keys().fingerprint()
    }

    async fn send_text(&self, body: &str, sign: bool) -> Result<u64, SessionError> {
        let active = self.established().await?;
        let sent_at_ms = self.shared.clock.now_ms();
        let signature = if sign {
            let identity = self.identity.read().await;
            let keys = identity.signing_keys();
            let payload = text_signing_payload(identity.username(), sent_at_ms, body);
            Some(MessageSignature {
                verifying_key: keys.verifying_bytes(),
                signature: keys.sign(&payload).to_vec(),
            })
        } else {
            None
        };
        let msg = ChannelMessage::Text {
            body: body.to_string(),
            sent_at_ms,
            signature,
        };
        self.send_on(&active, &msg).await
    }

    /// Hand a local file object to the peer. Only the ciphertext travels.
    pub async fn offer_file(&self, file_id: &str) -> Result<u64, SessionError> {
        let active = self.established().await?;
        let object = self.shared.files.get(file_id).await?;
        let seq = self
            .send_on(
                &active,
                &ChannelMessage::FileOffer {
                    object: (*object).clone(),
                },
            )
            .await?;
        info!(session_id = %active.session_id, file_id, "File object offered");
        Ok(seq)
    }

    /// Ask the peer to open one of its file objects for us.
    ///
    /// Every refusal arrives as [`SessionError::AccessDenied`]; the peer does
    /// not say why.
    pub async fn request_file(
        &self,
        file_id: &str,
        password: &str,
    ) -> Result<RemoteFile, SessionError> {
        let active = self.established().await?;
        let request_id = active.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        active.pending.lock().await.insert(request_id, tx);

        let msg = ChannelMessage::FileRequest {
            request_id,
            file_id: file_id.to_string(),
            password: password.to_string(),
        };
        if let Err(e) = self.send_on(&active, &msg).await {
            active.pending.lock().await.remove(&request_id);
            return Err(e);
        }
        debug!(session_id = %active.session_id, request_id, file_id, "File requested");

        let timeout = self.options.session.io_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SessionError::InvalidState(self.state())),
            Err(_) => {
                active.pending.lock().await.remove(&request_id);
                Err(SessionError::Network(format!(
                    "no reply to file request after {timeout:?}"
                )))
            }
        }
    }

    async fn current(&self) -> Option<Arc<ActiveSession>> {
        self.shared.active.read().await.clone()
    }

    async fn established(&self) -> Result<Arc<ActiveSession>, SessionError> {
        let state = self.state();
        match self.current().await {
            Some(active) if state == SessionState::Established => Ok(active),
            _ => Err(SessionError::InvalidState(state)),
        }
    }

    async fn send_on(
        &self,
        active: &Arc<ActiveSession>,
        msg: &ChannelMessage,
    ) -> Result<u64, SessionError> {
        let result = active.writer.lock().await.send(msg).await;
        if let Err(e) = &result
            && e.is_fatal()
        {
            self.shared.fail(active, e).await;
        }
        result
    }

    /// Atomically move a startable state to `Connecting`.
    fn begin_attempt(&self) -> Result<CancellationToken, SessionError> {
        let mut slot = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
        let mut current = SessionState::Idle;
        let started = self.shared.state.send_if_modified(|state| {
            current = *state;
            if state.can_start() {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SessionError::AlreadyConnected(current));
        }
        self.shared.emit(SessionEvent::StateChanged(SessionState::Connecting));
        self.shared.sent.store(0, Ordering::SeqCst);
        self.shared.received.store(0, Ordering::SeqCst);

        let token = CancellationToken::new();
        *slot = token.clone();
        Ok(token)
    }

    async fn handshake_params(
        &self,
        secret: SharedSecret,
        expected_peer: Option<&str>,
    ) -> HandshakeParams {
        HandshakeParams {
            identity: self.identity.read().await.clone(),
            secret,
            expected_peer: expected_peer.map(str::to_string),
            kdf: self.options.kdf,
            max_frame_bytes: self.options.session.max_frame_bytes,
        }
    }

    async fn key_exchange(
        &self,
        connection: Connection,
        params: HandshakeParams,
        role: Role,
    ) -> Result<(EstablishedKeys, BoxedStream), SessionError> {
        self.shared.set_state(SessionState::KeyExchange);
        debug!(peer_addr = connection.peer(), ?role, "Starting key exchange");

        let mut stream = connection.into_stream();
        let timeout = self.options.session.handshake_timeout();
        let exchange = async {
            match role {
                Role::Initiator => handshake::initiate(&mut stream, params).await,
                Role::Responder => handshake::respond(&mut stream, params).await,
            }
        };
        let keys = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| SessionError::HandshakeTimeout(timeout))??;
        Ok((keys, stream))
    }

    async fn finish_attempt<F>(
        &self,
        token: &CancellationToken,
        attempt: F,
    ) -> Result<(), SessionError>
    where
        F: Future<Output = Result<(EstablishedKeys, BoxedStream), SessionError>>,
    {
        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(SessionError::Cancelled),
            result = attempt => result,
        };
        let result = match outcome {
            Ok((keys, stream)) => self.install(&keys, stream).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(SessionError::Cancelled) => {
                info!("Connection attempt cancelled");
                self.shared.set_state(SessionState::Closed);
                Err(SessionError::Cancelled)
            }
            Err(e) => {
                let kind = e.kind();
                warn!(kind = %kind, error = %e, "Session setup failed");
                self.shared.set_state(SessionState::Failed(kind));
                self.shared.emit(SessionEvent::Error {
                    kind,
                    detail: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Build the channel from fresh keys and start the reader.
    async fn install(
        &self,
        keys: &EstablishedKeys,
        stream: BoxedStream,
    ) -> Result<(), SessionError> {
        let config = &self.options.session;
        let policy = RekeyPolicy {
            max_frames: config.rekey_after_frames,
            max_age: config.rekey_after(),
        };
        let (sealer, opener) = SecureChannel::new(keys, policy)?.split();
        let (reader, sink) = tokio::io::split(stream);

        let active = Arc::new(ActiveSession {
            session_id: Uuid::new_v4(),
            peer_username: keys.peer_username().to_string(),
            peer_fingerprint: keys.peer_fingerprint(),
            established_at_ms: self.shared.clock.now_ms(),
            writer: tokio::sync::Mutex::new(FrameWriter::new(
                sealer,
                sink,
                config.max_frame_bytes,
                config.io_timeout(),
                Arc::clone(&self.shared.sent),
            )),
            pending: tokio::sync::Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            file_requests: Arc::new(Semaphore::new(config.max_concurrent_file_requests.max(1))),
            offers: OfferBudget::new(config),
            shutdown: CancellationToken::new(),
        });

        *self.shared.active.write().await = Some(Arc::clone(&active));
        self.shared.set_state(SessionState::Established);
        info!(
            session_id = %active.session_id,
            peer = %active.peer_username,
            fingerprint = %active.peer_fingerprint,
            "Session established"
        );

        tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            active,
            reader,
            opener,
            config.max_frame_bytes,
        ));
        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel();
        if let Ok(slot) = self.shared.active.try_read()
            && let Some(active) = slot.as_ref()
        {
            active.shutdown.cancel();
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    active: Arc<ActiveSession>,
    mut reader: ReadHalf<BoxedStream>,
    mut opener: FrameOpener,
    max_frame_bytes: usize,
) {
    loop {
        let next = tokio::select! {
            () = active.shutdown.cancelled() => return,
            next = read_message(&mut reader, max_frame_bytes) => next,
        };

        let outcome = match next {
            Ok(WireMessage::Frame(frame)) => match opener.open(&frame) {
                Ok(plaintext) => {
                    let plaintext = Zeroizing::new(plaintext);
                    shared.received.store(opener.sequence(), Ordering::SeqCst);
                    handle_message(&shared, &active, &plaintext).await
                }
                Err(e) => Err(e.into()),
            },
            Ok(other) => Err(SessionError::ProtocolViolation(format!(
                "unexpected {} after key exchange",
                other.name()
            ))),
            Err(WireError::Closed) => Ok(Flow::PeerClosed),
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::PeerClosed) => {
                shared.close_remote(&active).await;
                return;
            }
            Err(e) => {
                shared.fail(&active, &e).await;
                return;
            }
        }
    }
}

async fn handle_message(
    shared: &Arc<Shared>,
    active: &Arc<ActiveSession>,
    plaintext: &[u8],
) -> Result<Flow, SessionError> {
    let msg = ChannelMessage::from_bytes(plaintext)?;
    debug!(
        session_id = %active.session_id,
        sequence = shared.received.load(Ordering::SeqCst),
        kind = msg.name(),
        "Frame received"
    );

    match msg {
        ChannelMessage::Text {
            body,
            sent_at_ms,
            signature,
        } => {
            let signature =
                check_signature(&active.peer_username, sent_at_ms, &body, signature.as_ref());
            if signature == SignatureStatus::Invalid {
                warn!(session_id = %active.session_id, "Message signature does not verify");
            }
            shared.emit(SessionEvent::MessageReceived {
                body,
                sender: active.peer_username.clone(),
                timestamp_ms: shared.clock.now_ms(),
                signature,
            });
        }
        ChannelMessage::FileOffer { object } => {
            let file_id = object.id.clone();
            let size = object.ciphertext.len() as u64;
            let imported = match active.offers.charge(size) {
                Ok(()) => {
                    let result = shared.files.import(object).await;
                    if result.is_err() {
                        active.offers.refund(size);
                    }
                    result
                }
                Err(e) => Err(e),
            };
            match imported {
                Ok(metadata) => {
                    info!(
                        session_id = %active.session_id,
                        file_id = %file_id,
                        "File object received"
                    );
                    shared.emit(SessionEvent::FileObjectAvailable(metadata));
                }
                Err(e) => {
                    warn!(file_id = %file_id, error = %e, "Rejected offered file object");
                    let e = SessionError::from(e);
                    shared.emit(SessionEvent::Error {
                        kind: e.kind(),
                        detail: e.to_string(),
                    });
                }
            }
        }
        ChannelMessage::FileRequest {
            request_id,
            file_id,
            password,
        } => {
            let password = Zeroizing::new(password);
            let Ok(permit) = Arc::clone(&active.file_requests).try_acquire_owned() else {
                warn!(
                    session_id = %active.session_id,
                    request_id,
                    file_id = %file_id,
                    "Too many file requests in flight, denying"
                );
                let denied = ChannelMessage::AccessDenied { request_id };
                active.writer.lock().await.send(&denied).await?;
                return Ok(Flow::Continue);
            };
            tokio::spawn(serve_file_request(
                Arc::clone(shared),
                Arc::clone(active),
                permit,
                request_id,
                file_id,
                password,
            ));
        }
        ChannelMessage::FileContent {
            request_id,
            file_id,
            name,
            checksum,
            payload,
        } => {
            let reply = if checksum_hex(&payload) == checksum {
                Ok(RemoteFile {
                    file_id,
                    name,
                    checksum,
                    payload,
                })
            } else {
                Err(FileError::ChecksumMismatch(file_id).into())
            };
            resolve(active, request_id, reply).await;
        }
        ChannelMessage::AccessDenied { request_id } => {
            resolve(active, request_id, Err(SessionError::AccessDenied)).await;
        }
        ChannelMessage::Close => return Ok(Flow::PeerClosed),
    }
    Ok(Flow::Continue)
}

fn check_signature(
    sender: &str,
    sent_at_ms: u64,
    body: &str,
    signature: Option<&MessageSignature>,
) -> SignatureStatus {
    let Some(signature) = signature else {
        return SignatureStatus::Unsigned;
    };
    let payload = text_signing_payload(sender, sent_at_ms, body);
    match verify_signature(&signature.verifying_key, &payload, &signature.signature) {
        Ok(()) => SignatureStatus::Verified {
            fingerprint: fingerprint_of(&signature.verifying_key),
        },
        Err(_) => SignatureStatus::Invalid,
    }
}

async fn resolve(
    active: &ActiveSession,
    request_id: u64,
    reply: Result<RemoteFile, SessionError>,
) {
    match active.pending.lock().await.remove(&request_id) {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => debug!(request_id, "Reply for unknown or abandoned file request"),
    }
}

async fn serve_file_request(
    shared: Arc<Shared>,
    active: Arc<ActiveSession>,
    _permit: OwnedSemaphorePermit,
    request_id: u64,
    file_id: String,
    password: Zeroizing<String>,
) {
    let reply = match shared
        .files
        .retrieve_for(&file_id, &password, &active.peer_username)
        .await
    {
        Ok(file) => {
            info!(session_id = %active.session_id, file_id = %file_id, "Serving file to peer");
            ChannelMessage::FileContent {
                request_id,
                file_id,
                name: file.metadata.name,
                checksum: file.metadata.checksum,
                payload: file.payload,
            }
        }
        Err(e) => {
            info!(
                session_id = %active.session_id,
                file_id = %file_id,
                reason = %e,
                "Denied file request"
            );
            ChannelMessage::AccessDenied { request_id }
        }
    };

    let mut writer = active.writer.lock().await;
    let mut result = writer.send(&reply).await;
    if matches!(result, Err(SessionError::TooLarge { .. })) {
        warn!(request_id, "File too large for one frame");
        result = writer.send(&ChannelMessage::AccessDenied { request_id }).await;
    }
    drop(writer);

    if let Err(e) = result {
        shared.fail(&active, &e).await;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chatter_core::ManualClock;

    use super::*;
    use crate::session::ErrorKind;

    fn session(name: &str) -> PeerSession {
        let config = Config::default();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let files = Arc::new(
            FileStore::new(&config.files, Arc::clone(&clock))
                .with_kdf_params(KdfParams::insecure_for_tests()),
        );
        let options = SessionOptions::from_config(&config)
            .with_kdf_params(KdfParams::insecure_for_tests())
            .with_clock(clock);
        PeerSession::new(Identity::with_username(name).unwrap(), files, options)
    }

    #[tokio::test]
    async fn operations_need_an_established_session() {
        let peer = session("P2P-BoldFox42");
        assert_eq!(peer.state(), SessionState::Idle);

        let err = peer.send_message("hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = peer.request_file("FID-1-aaaaaaaaa", "pw").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(peer.peer_fingerprint().await.is_none());
    }

    #[tokio::test]
    async fn close_when_idle_is_a_no_op() {
        let peer = session("P2P-BoldFox42");
        peer.close().await.unwrap();
        assert_eq!(peer.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn rotate_username_between_sessions() {
        let peer = session("P2P-BoldFox42");
        let name = peer.rotate_username().await.unwrap();
        assert_eq!(peer.username().await, name);
        validate_username(&name).unwrap();
    }

    #[tokio::test]
    async fn invalid_peer_username_is_rejected_before_connecting() {
        let peer = session("P2P-BoldFox42");
        let err = peer
            .connect("127.0.0.1:1", "not a username", SharedSecret::from("s3cret-words"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(peer.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn connect_failure_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let peer = session("P2P-BoldFox42");
        let err = peer
            .connect(&addr.to_string(), "P2P-SlySpider7", SharedSecret::from("s3cret-words"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(peer.state(), SessionState::Failed(ErrorKind::NetworkError));

        // A failed session can be retried.
        assert!(peer.state().can_start());
    }

    #[tokio::test]
    async fn silent_peer_times_out_the_handshake() {
        let listener = TransportListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(conn);
        });

        let config = Config::default();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let files = Arc::new(FileStore::new(&config.files, Arc::clone(&clock)));
        let mut options = SessionOptions::from_config(&config)
            .with_kdf_params(KdfParams::insecure_for_tests());
        options.session.handshake_timeout_ms = 100;
        let peer = PeerSession::new(Identity::generate(), files, options);

        let err = peer
            .connect(&addr.to_string(), "P2P-SlySpider7", SharedSecret::from("s3cret-words"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
        assert_eq!(peer.state(), SessionState::Failed(ErrorKind::HandshakeTimeout));
    }
}
