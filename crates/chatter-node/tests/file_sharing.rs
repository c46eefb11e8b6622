// Integration tests use unwrap for brevity.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! File objects exchanged between established peers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chatter_core::{Clock, ManualClock};
use chatter_crypto::SharedSecret;
use chatter_node::files::NewFileObject;
use chatter_node::session::{ErrorKind, SessionEvent, SessionState};

use common::{ALICE, BOB, SECRET, establish, listener, next_event, options, peer, peer_with};

const PAYLOAD: &[u8] = b"meet at the usual place";

#[tokio::test]
async fn remote_request_needs_the_right_password() {
    let (alice, _) = peer(ALICE);
    let (bob, _) = peer(BOB);
    establish(&alice, &bob).await;

    let meta = alice
        .files()
        .create(
            NewFileObject::new(ALICE, "notes.txt", PAYLOAD, "sw0rdfish").with_ttl(Duration::ZERO),
        )
        .await
        .unwrap();

    let err = bob.request_file(&meta.id, "wrong-password").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    let file = bob.request_file(&meta.id, "sw0rdfish").await.unwrap();
    assert_eq!(file.file_id, meta.id);
    assert_eq!(file.name, "notes.txt");
    assert_eq!(file.checksum, meta.checksum);
    assert_eq!(file.payload, PAYLOAD);

    // Retrieval is repeatable and does not consume the object.
    let again = bob.request_file(&meta.id, "sw0rdfish").await.unwrap();
    assert_eq!(again.payload, PAYLOAD);
}

#[tokio::test]
async fn every_remote_failure_looks_the_same() {
    let (alice, alice_clock) = peer(ALICE);
    let (bob, _) = peer(BOB);
    establish(&alice, &bob).await;

    let restricted = alice
        .files()
        .create(
            NewFileObject::new(ALICE, "plan.txt", PAYLOAD, "sw0rdfish")
                .with_recipients(["P2P-Someone1"]),
        )
        .await
        .unwrap();
    let short_lived = alice
        .files()
        .create(
            NewFileObject::new(ALICE, "gone.txt", PAYLOAD, "sw0rdfish")
                .with_ttl(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    alice_clock.advance(2_000);

    for id in [restricted.id.as_str(), short_lived.id.as_str(), "FID-1-aaaaaaaaa"] {
        let err = bob.request_file(id, "sw0rdfish").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied, "{id}");
    }

    // Denials do not end the session.
    bob.send_message("still talking").await.unwrap();
}

#[tokio::test]
async fn listed_recipient_can_retrieve() {
    let (alice, _) = peer(ALICE);
    let (bob, _) = peer(BOB);
    establish(&alice, &bob).await;

    let meta = alice
        .files()
        .create(NewFileObject::new(ALICE, "plan.txt", PAYLOAD, "sw0rdfish").with_recipients([BOB]))
        .await
        .unwrap();
    let file = bob.request_file(&meta.id, "sw0rdfish").await.unwrap();
    assert_eq!(file.payload, PAYLOAD);
}

#[tokio::test]
async fn peer_using_the_owners_name_is_not_a_recipient() {
    let (alice, _) = peer(ALICE);
    // Usernames are self-declared, so nothing stops a peer from taking Alice's.
    let (mallory, _) = peer(ALICE);

    let (listener, addr) = listener().await;
    let (accepted, connected) = tokio::join!(
        alice.accept(&listener, SharedSecret::from(SECRET)),
        mallory.connect(&addr, ALICE, SharedSecret::from(SECRET)),
    );
    accepted.unwrap();
    connected.unwrap();
    assert_eq!(alice.peer_username().await.as_deref(), Some(ALICE));

    let meta = alice
        .files()
        .create(NewFileObject::new(ALICE, "plan.txt", PAYLOAD, "sw0rdfish").with_recipients([BOB]))
        .await
        .unwrap();

    let err = mallory.request_file(&meta.id, "sw0rdfish").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    // Alice herself still opens it locally.
    let file = alice.files().retrieve(&meta.id, "sw0rdfish").await.unwrap();
    assert_eq!(file.payload, PAYLOAD);
}

#[tokio::test]
async fn offers_beyond_the_session_limit_are_rejected() {
    let (alice, _) = peer(ALICE);
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000_000));
    let mut opts = options(Arc::clone(&clock));
    opts.session.max_offered_files = 1;
    let bob = peer_with(BOB, clock, opts);
    let mut bob_events = bob.subscribe();
    establish(&alice, &bob).await;

    let mut ids = Vec::new();
    for name in ["one.txt", "two.txt"] {
        let meta = alice
            .files()
            .create(NewFileObject::new(ALICE, name, PAYLOAD, "sw0rdfish"))
            .await
            .unwrap();
        alice.offer_file(&meta.id).await.unwrap();
        ids.push(meta.id);
    }

    let accepted = next_event(&mut bob_events, |e| {
        matches!(e, SessionEvent::FileObjectAvailable(_))
    })
    .await;
    assert!(matches!(accepted, SessionEvent::FileObjectAvailable(m) if m.id == ids[0]));
    let rejected = next_event(&mut bob_events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert!(matches!(
        rejected,
        SessionEvent::Error {
            kind: ErrorKind::InvalidInput,
            ..
        }
    ));

    let held: Vec<String> = bob.files().list().await.into_iter().map(|m| m.id).collect();
    assert_eq!(held, [ids[0].clone()]);
    assert_eq!(bob.state(), SessionState::Established);
}

#[tokio::test]
async fn offered_object_opens_locally_with_the_password() {
    let (alice, _) = peer(ALICE);
    let (bob, _) = peer(BOB);
    let mut bob_events = bob.subscribe();
    establish(&alice, &bob).await;

    let meta = alice
        .files()
        .create(
            NewFileObject::new(ALICE, "notes.txt", PAYLOAD, "sw0rdfish").with_ttl(Duration::ZERO),
        )
        .await
        .unwrap();
    alice.offer_file(&meta.id).await.unwrap();

    let event = next_event(&mut bob_events, |e| {
        matches!(e, SessionEvent::FileObjectAvailable(_))
    })
    .await;
    let SessionEvent::FileObjectAvailable(offered) = event else {
        unreachable!()
    };
    assert_eq!(offered, meta);

    let err = bob.files().retrieve(&meta.id, "wrong-password").await.unwrap_err();
    assert_eq!(
        chatter_node::session::SessionError::from(err).kind(),
        ErrorKind::WrongPassword
    );
    let file = bob.files().retrieve(&meta.id, "sw0rdfish").await.unwrap();
    assert_eq!(file.payload, PAYLOAD);
    assert_eq!(file.metadata.owner, ALICE);
}

#[tokio::test]
async fn offering_an_unknown_object_is_a_local_error() {
    let (alice, _) = peer(ALICE);
    let (bob, _) = peer(BOB);
    establish(&alice, &bob).await;

    let err = alice.offer_file("FID-1-aaaaaaaaa").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    alice.send_message("session unaffected").await.unwrap();
}
