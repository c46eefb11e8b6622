//! Peer-to-peer wire protocol: handshake messages and sealed frames on the
//! stream, [`ChannelMessage`] payloads inside the frames.

mod codec;
mod message;

pub use codec::{WireError, WireMessage, decode, encode, read_message, write_message};
pub use message::{ChannelMessage, MessageSignature, text_signing_payload};
