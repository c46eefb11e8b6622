#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! Helpers shared by the peer session integration tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use chatter_core::{Clock, Config, ManualClock};
use chatter_crypto::{Identity, KdfParams, SharedSecret};
use chatter_node::files::FileStore;
use chatter_node::session::{PeerSession, SessionEvent, SessionOptions, SessionState};
use chatter_node::transport::TransportListener;

pub const ALICE: &str = "P2P-BoldFox42";
pub const BOB: &str = "P2P-SlySpider7";
pub const SECRET: &str = "correct-horse-battery";

const WAIT: Duration = Duration::from_secs(10);

pub fn options(clock: Arc<dyn Clock>) -> SessionOptions {
    SessionOptions::from_config(&Config::default())
        .with_kdf_params(KdfParams::insecure_for_tests())
        .with_clock(clock)
}

pub fn peer_with(name: &str, clock: Arc<dyn Clock>, options: SessionOptions) -> PeerSession {
    let files = Arc::new(
        FileStore::new(&Config::default().files, clock)
            .with_kdf_params(KdfParams::insecure_for_tests()),
    );
    PeerSession::new(Identity::with_username(name).unwrap(), files, options)
}

/// A peer with a manual clock it can advance.
pub fn peer(name: &str) -> (PeerSession, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let session = peer_with(name, dyn_clock.clone(), options(dyn_clock));
    (session, clock)
}

pub async fn listener() -> (TransportListener, String) {
    let listener = TransportListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Connect `alice` to `bob` over loopback TCP with the given secrets.
pub async fn establish_with(
    alice: &PeerSession,
    bob: &PeerSession,
    alice_secret: &str,
    bob_secret: &str,
) -> (
    Result<(), chatter_node::session::SessionError>,
    Result<(), chatter_node::session::SessionError>,
) {
    let (listener, addr) = listener().await;
    tokio::join!(
        alice.connect(&addr, BOB, SharedSecret::from(alice_secret)),
        bob.accept(&listener, SharedSecret::from(bob_secret)),
    )
}

pub async fn establish(alice: &PeerSession, bob: &PeerSession) {
    let (a, b) = establish_with(alice, bob, SECRET, SECRET).await;
    a.unwrap();
    b.unwrap();
    assert_eq!(alice.state(), SessionState::Established);
    assert_eq!(bob.state(), SessionState::Established);
}

/// Next event matching `pred`, skipping everything else.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for state")
        .unwrap();
}
