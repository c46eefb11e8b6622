//! P2P Chatter Core Library
//!
//! Shared functionality for the chatter crates:
//! - Configuration resolution (network policy, session and file settings)
//! - Tracing initialisation
//! - Wall-clock abstraction used for expiry decisions
//! - Common error types

pub mod clock;
pub mod config;
pub mod error;
pub mod tracing_init;

pub use clock::{Clock, SystemClock};
#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;
pub use config::{Config, FileConfig, NetworkPolicy, ProxyMode, SessionConfig};
pub use error::{Error, Result};
