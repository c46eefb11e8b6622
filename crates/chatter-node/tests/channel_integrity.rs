// Integration tests use unwrap for brevity.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! A hand-driven initiator that misbehaves after the key exchange.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chatter_core::{Clock, Config, ManualClock};
use chatter_crypto::{
    EstablishedKeys, Identity, InitiatorHandshake, KdfParams, RekeyPolicy, SecureChannel,
    SharedSecret, SigningKeyPair,
};
use chatter_node::files::{FileStore, NewFileObject};
use chatter_node::session::{ErrorKind, PeerSession, SessionEvent, SessionState, SignatureStatus};
use chatter_node::transport::Connection;
use chatter_node::wire::{
    ChannelMessage, MessageSignature, WireMessage, read_message, text_signing_payload,
    write_message,
};
use tokio::io::DuplexStream;

use common::{ALICE, BOB, SECRET, next_event, options, peer, wait_for_state};

const MAX: usize = 64 * 1024;

/// Run the initiator side by hand against `bob`.
async fn raw_initiator(bob: &PeerSession) -> (DuplexStream, EstablishedKeys) {
    let (mut io, remote) = tokio::io::duplex(MAX);
    let initiator = async {
        let identity = Identity::with_username(ALICE).unwrap();
        let state = InitiatorHandshake::start(
            &identity,
            &SharedSecret::from(SECRET),
            Some(BOB),
            KdfParams::insecure_for_tests(),
        )
        .unwrap();
        write_message(&mut io, &WireMessage::ClientHello(state.hello().clone()), MAX)
            .await
            .unwrap();
        let WireMessage::ServerHello(reply) = read_message(&mut io, MAX).await.unwrap() else {
            panic!("expected ServerHello");
        };
        let (finish, keys) = state.finish(&reply).unwrap();
        write_message(&mut io, &WireMessage::ClientFinish(finish), MAX)
            .await
            .unwrap();
        keys
    };
    let (accepted, keys) = tokio::join!(
        bob.accept_connection(Connection::new(remote, "duplex"), SharedSecret::from(SECRET)),
        initiator,
    );
    accepted.unwrap();
    (io, keys)
}

fn text(body: &str) -> Vec<u8> {
    ChannelMessage::Text {
        body: body.into(),
        sent_at_ms: 0,
        signature: None,
    }
    .to_bytes()
    .unwrap()
}

fn signed_text(body: &str, signature: MessageSignature) -> Vec<u8> {
    ChannelMessage::Text {
        body: body.into(),
        sent_at_ms: 0,
        signature: Some(signature),
    }
    .to_bytes()
    .unwrap()
}

fn sign_as(keys: &SigningKeyPair, sender: &str, body: &str) -> MessageSignature {
    MessageSignature {
        verifying_key: keys.verifying_bytes(),
        signature: keys.sign(&text_signing_payload(sender, 0, body)).to_vec(),
    }
}

async fn received_signature(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    want_body: &str,
) -> SignatureStatus {
    let event = next_event(events, |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;
    let SessionEvent::MessageReceived { body, signature, .. } = event else {
        unreachable!()
    };
    assert_eq!(body, want_body);
    signature
}

#[tokio::test]
async fn replayed_frame_ends_the_session() {
    let (bob, _) = peer(BOB);
    let mut events = bob.subscribe();
    let mut states = bob.watch_state();
    let (mut io, keys) = raw_initiator(&bob).await;
    let mut channel = SecureChannel::new(&keys, RekeyPolicy::default()).unwrap();

    let frame = channel.seal(&text("once")).unwrap();
    write_message(&mut io, &WireMessage::Frame(frame.clone()), MAX).await.unwrap();
    write_message(&mut io, &WireMessage::Frame(frame), MAX).await.unwrap();

    let first = next_event(&mut events, |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;
    assert!(matches!(first, SessionEvent::MessageReceived { body, .. } if body == "once"));

    wait_for_state(&mut states, SessionState::Failed(ErrorKind::ReplayOrOutOfOrder)).await;
    assert_eq!(bob.recv_sequence(), 1);
    assert!(bob.peer_fingerprint().await.is_none());
}

#[tokio::test]
async fn skipped_sequence_ends_the_session() {
    let (bob, _) = peer(BOB);
    let mut states = bob.watch_state();
    let (mut io, keys) = raw_initiator(&bob).await;
    let mut channel = SecureChannel::new(&keys, RekeyPolicy::default()).unwrap();

    let _dropped = channel.seal(&text("lost")).unwrap();
    let second = channel.seal(&text("early")).unwrap();
    write_message(&mut io, &WireMessage::Frame(second), MAX).await.unwrap();

    wait_for_state(&mut states, SessionState::Failed(ErrorKind::ReplayOrOutOfOrder)).await;
    assert_eq!(bob.recv_sequence(), 0);
}

#[tokio::test]
async fn tampered_frame_fails_authentication() {
    let (bob, _) = peer(BOB);
    let mut events = bob.subscribe();
    let mut states = bob.watch_state();
    let (mut io, keys) = raw_initiator(&bob).await;
    let mut channel = SecureChannel::new(&keys, RekeyPolicy::default()).unwrap();

    let mut frame = channel.seal(&text("secret")).unwrap();
    frame.ciphertext[0] ^= 0x01;
    write_message(&mut io, &WireMessage::Frame(frame), MAX).await.unwrap();

    wait_for_state(&mut states, SessionState::Failed(ErrorKind::AuthenticationFailed)).await;
    let error = next_event(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert!(matches!(
        error,
        SessionEvent::Error {
            kind: ErrorKind::AuthenticationFailed,
            ..
        }
    ));
    assert!(!events
        .try_recv()
        .is_ok_and(|e| matches!(e, SessionEvent::MessageReceived { .. })));
}

#[tokio::test]
async fn handshake_message_after_establishment_is_a_protocol_violation() {
    let (bob, _) = peer(BOB);
    let mut states = bob.watch_state();
    let (mut io, _keys) = raw_initiator(&bob).await;

    write_message(
        &mut io,
        &WireMessage::ClientFinish(chatter_crypto::ClientFinish {
            confirmation: [0u8; 32],
        }),
        MAX,
    )
    .await
    .unwrap();

    wait_for_state(&mut states, SessionState::Failed(ErrorKind::ProtocolViolation)).await;
}

#[tokio::test]
async fn peer_hangup_closes_the_session() {
    let (bob, _) = peer(BOB);
    let mut states = bob.watch_state();
    let (io, _keys) = raw_initiator(&bob).await;

    drop(io);
    wait_for_state(&mut states, SessionState::Closed).await;
}

#[tokio::test]
async fn forged_signatures_are_flagged_but_delivered() {
    let (bob, _) = peer(BOB);
    let mut events = bob.subscribe();
    let (mut io, keys) = raw_initiator(&bob).await;
    let mut channel = SecureChannel::new(&keys, RekeyPolicy::default()).unwrap();
    let signer = SigningKeyPair::generate();

    // signed honestly
    let good = sign_as(&signer, ALICE, "hello");
    let frame = channel.seal(&signed_text("hello", good)).unwrap();
    write_message(&mut io, &WireMessage::Frame(frame), MAX).await.unwrap();
    assert_eq!(
        received_signature(&mut events, "hello").await,
        SignatureStatus::Verified {
            fingerprint: signer.fingerprint()
        }
    );

    // signature lifted from a different body
    let lifted = sign_as(&signer, ALICE, "hello");
    let frame = channel.seal(&signed_text("goodbye", lifted)).unwrap();
    write_message(&mut io, &WireMessage::Frame(frame), MAX).await.unwrap();
    assert_eq!(
        received_signature(&mut events, "goodbye").await,
        SignatureStatus::Invalid
    );

    // signed under another sender name
    let renamed = sign_as(&signer, "P2P-SneakyRaven1", "again");
    let frame = channel.seal(&signed_text("again", renamed)).unwrap();
    write_message(&mut io, &WireMessage::Frame(frame), MAX).await.unwrap();
    assert_eq!(
        received_signature(&mut events, "again").await,
        SignatureStatus::Invalid
    );

    // garbage signature bytes
    let garbage = MessageSignature {
        verifying_key: signer.verifying_bytes(),
        signature: vec![0u8; 12],
    };
    let frame = channel.seal(&signed_text("noise", garbage)).unwrap();
    write_message(&mut io, &WireMessage::Frame(frame), MAX).await.unwrap();
    assert_eq!(
        received_signature(&mut events, "noise").await,
        SignatureStatus::Invalid
    );

    assert_eq!(bob.state(), SessionState::Established);
}

#[tokio::test]
async fn file_request_flood_is_answered_within_the_concurrency_limit() {
    const REQUESTS: u64 = 8;

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000_000));
    let mut opts = options(Arc::clone(&clock));
    opts.session.max_concurrent_file_requests = 1;
    // Costly enough that one decryption outlasts writing the whole burst.
    let slow_kdf = KdfParams {
        memory_kib: 8 * 1024,
        iterations: 2,
        parallelism: 1,
    };
    let files = Arc::new(FileStore::new(&Config::default().files, clock).with_kdf_params(slow_kdf));
    let bob = PeerSession::new(Identity::with_username(BOB).unwrap(), files, opts);
    let meta = bob
        .files()
        .create(NewFileObject::new(BOB, "notes.txt", b"payload".to_vec(), "sw0rdfish"))
        .await
        .unwrap();

    let (mut io, keys) = raw_initiator(&bob).await;
    let mut channel = SecureChannel::new(&keys, RekeyPolicy::default()).unwrap();
    for request_id in 1..=REQUESTS {
        let request = ChannelMessage::FileRequest {
            request_id,
            file_id: meta.id.clone(),
            password: "sw0rdfish".into(),
        };
        let frame = channel.seal(&request.to_bytes().unwrap()).unwrap();
        write_message(&mut io, &WireMessage::Frame(frame), MAX).await.unwrap();
    }

    let (mut served, mut denied) = (0, 0);
    for _ in 0..REQUESTS {
        let reply = tokio::time::timeout(Duration::from_secs(30), read_message(&mut io, MAX))
            .await
            .unwrap()
            .unwrap();
        let WireMessage::Frame(frame) = reply else {
            panic!("expected a frame");
        };
        match ChannelMessage::from_bytes(&channel.open(&frame).unwrap()).unwrap() {
            ChannelMessage::FileContent { payload, .. } => {
                assert_eq!(payload, b"payload");
                served += 1;
            }
            ChannelMessage::AccessDenied { .. } => denied += 1,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    assert!(served >= 1);
    assert!(denied >= 1);
    assert_eq!(served + denied, REQUESTS);
    assert_eq!(bob.state(), SessionState::Established);
}
