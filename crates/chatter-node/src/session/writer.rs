//! Sending half of an established session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;
use zeroize::Zeroizing;

use chatter_crypto::{FrameSealer, NONCE_SIZE, TAG_SIZE};

use crate::wire::{ChannelMessage, WireMessage, write_message};

use super::error::SessionError;

/// Wire bytes a sealed frame adds on top of its plaintext: the message
/// header, sequence, epoch, nonce, ciphertext length and tag.
const FRAME_OVERHEAD: usize = 2 + 8 + 4 + NONCE_SIZE + 8 + TAG_SIZE;

pub(crate) struct FrameWriter<W> {
    sealer: FrameSealer,
    sink: W,
    max_frame_bytes: usize,
    io_timeout: Duration,
    sent: Arc<AtomicU64>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) const fn new(
        sealer: FrameSealer,
        sink: W,
        max_frame_bytes: usize,
        io_timeout: Duration,
        sent: Arc<AtomicU64>,
    ) -> Self {
        Self {
            sealer,
            sink,
            max_frame_bytes,
            io_timeout,
            sent,
        }
    }

    /// Seal and write one message, returning its sequence number.
    ///
    /// Oversized messages are refused before a sequence number is spent.
    pub(crate) async fn send(&mut self, msg: &ChannelMessage) -> Result<u64, SessionError> {
        let plaintext = Zeroizing::new(msg.to_bytes()?);
        let len = plaintext.len() + FRAME_OVERHEAD;
        if len > self.max_frame_bytes {
            return Err(SessionError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        let frame = self.sealer.seal(&plaintext)?;
        let sequence = frame.sequence;
        let wire = WireMessage::Frame(frame);
        let write = write_message(&mut self.sink, &wire, self.max_frame_bytes);
        tokio::time::timeout(self.io_timeout, write)
            .await
            .map_err(|_| {
                SessionError::Network(format!("write timed out after {:?}", self.io_timeout))
            })??;

        self.sent.store(sequence, Ordering::SeqCst);
        trace!(sequence, epoch = self.sealer.epoch(), kind = msg.name(), "Frame sent");
        Ok(sequence)
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.sink.shutdown().await;
    }
}
