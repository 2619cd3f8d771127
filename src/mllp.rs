//! MLLP framing codec
//!
//! Frame format on the wire:
//!
//! ```text
//! ┌─────────┬──────────────────┬─────────┬─────────┐
//! │ SB 0x0B │   payload bytes  │ EB 0x1C │ CR 0x0D │
//! └─────────┴──────────────────┴─────────┴─────────┘
//! ```
//!
//! The payload is opaque; the codec never transcodes. All decode errors
//! abort the current frame and the decoder recovers at the next start byte.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::domain::MaxMessageSize;
use crate::error::{EngineError, Result};

/// Start-of-block byte.
pub const START_BLOCK: u8 = 0x0B;
/// End-of-block byte.
pub const END_BLOCK: u8 = 0x1C;
/// Trailing carriage return.
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Wraps a payload in MLLP framing.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 3);
    frame.extend_from_slice(&[START_BLOCK]);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[END_BLOCK, CARRIAGE_RETURN]);
    frame.freeze()
}

/// Streaming MLLP decoder over any byte stream.
///
/// Produces a finite, non-restartable sequence of payloads via
/// [`MllpDecoder::read_message`]. Not cancel-safe mid-frame: callers racing
/// it against shutdown should drop the decoder rather than resume it.
pub struct MllpDecoder<R> {
    reader: R,
    buf: BytesMut,
    max_message_size: usize,
    read_timeout: std::time::Duration,
    /// Set after an aborted frame: silently discard bytes until the next SB.
    resync: bool,
    /// Prefix of the frame that was being read when the last error occurred.
    /// Inbound hosts use it to construct a NACK when a partial MSH is there.
    partial: Option<Bytes>,
}

impl<R: AsyncRead + Unpin> MllpDecoder<R> {
    #[must_use]
    pub fn new(reader: R, max_message_size: MaxMessageSize, read_timeout: std::time::Duration) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            max_message_size: max_message_size.as_usize(),
            read_timeout,
            resync: false,
            partial: None,
        }
    }

    /// Prefix of the last aborted frame, if any.
    #[must_use]
    pub fn partial_frame(&self) -> Option<&Bytes> {
        self.partial.as_ref()
    }

    /// Reads the next framed payload.
    ///
    /// Returns `Ok(None)` on clean end of stream (no partial frame pending).
    /// Errors abort the current frame; the decoder remains usable and will
    /// resynchronise at the next start byte.
    pub async fn read_message(&mut self) -> Result<Option<Bytes>> {
        self.partial = None;
        if !self.seek_start_block().await? {
            return Ok(None);
        }
        self.read_until_end_block().await.map(Some)
    }

    /// Consumes bytes until a start block has been consumed. Returns `false`
    /// on clean end of stream.
    async fn seek_start_block(&mut self) -> Result<bool> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == START_BLOCK) {
                if pos > 0 && !self.resync {
                    // Garbage before the start byte. Drop it, flag the
                    // stream, and let the caller decide what to do.
                    let _ = self.buf.split_to(pos);
                    return Err(EngineError::framing(format!(
                        "expected start block, got {pos} stray byte(s)"
                    )));
                }
                let _ = self.buf.split_to(pos + 1);
                self.resync = false;
                return Ok(true);
            }

            // No SB buffered. Anything here is garbage or resync residue.
            if !self.buf.is_empty() {
                let stray = self.buf.len();
                self.buf.clear();
                if !self.resync {
                    return Err(EngineError::framing(format!(
                        "expected start block, got {stray} stray byte(s)"
                    )));
                }
            }

            if self.fill().await? == 0 {
                self.resync = false;
                return Ok(false);
            }
        }
    }

    /// Reads payload bytes up to the end block and trailing CR.
    async fn read_until_end_block(&mut self) -> Result<Bytes> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == END_BLOCK) {
                if pos > self.max_message_size {
                    // The frame end is buffered: drop exactly this frame and
                    // stay in sync for the next one.
                    self.keep_partial();
                    let consumed = (pos + 2).min(self.buf.len());
                    let _ = self.buf.split_to(consumed);
                    return Err(EngineError::MessageTooLarge {
                        size: pos,
                        max: self.max_message_size,
                    });
                }
                // The CR may not have arrived yet.
                while self.buf.len() < pos + 2 {
                    if self.fill().await? == 0 {
                        return Err(self.abort_truncated());
                    }
                }
                let payload = self.buf.split_to(pos).freeze();
                let trailer = self.buf.split_to(2);
                if trailer[1] != CARRIAGE_RETURN {
                    return Err(EngineError::framing(format!(
                        "end block not followed by CR (got 0x{:02X})",
                        trailer[1]
                    )));
                }
                return Ok(payload);
            }

            if self.buf.len() > self.max_message_size {
                // No frame end in sight: discard and resynchronise at the
                // next start byte.
                let size = self.buf.len();
                self.keep_partial();
                self.buf.clear();
                self.resync = true;
                return Err(EngineError::MessageTooLarge {
                    size,
                    max: self.max_message_size,
                });
            }

            if self.fill().await? == 0 {
                return Err(self.abort_truncated());
            }
        }
    }

    fn abort_truncated(&mut self) -> EngineError {
        self.keep_partial();
        self.buf.clear();
        EngineError::Truncated
    }

    fn keep_partial(&mut self) {
        let keep = self.buf.len().min(1024);
        self.partial = Some(Bytes::copy_from_slice(&self.buf[..keep]));
    }

    /// Reads more bytes with the configured timeout. Returns the byte count
    /// (0 on EOF).
    async fn fill(&mut self) -> Result<usize> {
        match timeout(self.read_timeout, self.reader.read_buf(&mut self.buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(EngineError::Io(e)),
            Err(_elapsed) => {
                // Per protocol: on timeout, ignore everything received so
                // far and wait for a fresh frame.
                self.keep_partial();
                self.buf.clear();
                Err(EngineError::ReadTimeout {
                    timeout_ms: u64::try_from(self.read_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MaxMessageSize;
    use std::io::Cursor;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn max(bytes: usize) -> MaxMessageSize {
        MaxMessageSize::try_new(bytes).unwrap()
    }

    fn decoder(data: Vec<u8>, cap: usize) -> MllpDecoder<Cursor<Vec<u8>>> {
        MllpDecoder::new(Cursor::new(data), max(cap), TIMEOUT)
    }

    #[test_log::test(tokio::test)]
    async fn decodes_single_frame() {
        let frame = encode_frame(b"MSH|^~\\&|A");
        let mut dec = decoder(frame.to_vec(), 1024);
        let payload = dec.read_message().await.unwrap().unwrap();
        assert_eq!(&payload[..], b"MSH|^~\\&|A");
        assert!(dec.read_message().await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn decodes_back_to_back_frames() {
        let mut data = encode_frame(b"one").to_vec();
        data.extend_from_slice(&encode_frame(b"two"));
        let mut dec = decoder(data, 1024);
        assert_eq!(&dec.read_message().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&dec.read_message().await.unwrap().unwrap()[..], b"two");
        assert!(dec.read_message().await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn payload_may_contain_carriage_returns() {
        let payload = b"MSH|a\rPID|b\rOBX|c";
        let frame = encode_frame(payload);
        let mut dec = decoder(frame.to_vec(), 1024);
        assert_eq!(&dec.read_message().await.unwrap().unwrap()[..], payload);
    }

    #[test_log::test(tokio::test)]
    async fn garbage_before_start_is_a_framing_error_then_recovers() {
        let mut data = b"noise".to_vec();
        data.extend_from_slice(&encode_frame(b"real"));
        let mut dec = decoder(data, 1024);

        assert!(matches!(
            dec.read_message().await,
            Err(EngineError::Framing { .. })
        ));
        // Recovered at the next SB.
        assert_eq!(&dec.read_message().await.unwrap().unwrap()[..], b"real");
    }

    #[test_log::test(tokio::test)]
    async fn eof_mid_frame_is_truncated() {
        let frame = encode_frame(b"cut short");
        let mut dec = decoder(frame[..frame.len() - 2].to_vec(), 1024);
        assert!(matches!(dec.read_message().await, Err(EngineError::Truncated)));
        assert!(dec.partial_frame().is_some());
    }

    #[test_log::test(tokio::test)]
    async fn frame_at_limit_accepted_over_limit_rejected() {
        let at_limit = vec![b'x'; 64];
        let mut dec = decoder(encode_frame(&at_limit).to_vec(), 64);
        assert_eq!(dec.read_message().await.unwrap().unwrap().len(), 64);

        let over = vec![b'x'; 65];
        let mut dec = decoder(encode_frame(&over).to_vec(), 64);
        assert!(matches!(
            dec.read_message().await,
            Err(EngineError::MessageTooLarge { size: 65, max: 64 })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn oversized_frame_resyncs_silently() {
        let mut data = encode_frame(&vec![b'x'; 100]).to_vec();
        data.extend_from_slice(&encode_frame(b"ok"));
        let mut dec = decoder(data, 64);

        assert!(matches!(
            dec.read_message().await,
            Err(EngineError::MessageTooLarge { .. })
        ));
        assert_eq!(&dec.read_message().await.unwrap().unwrap()[..], b"ok");
    }

    #[test_log::test(tokio::test)]
    async fn missing_cr_after_end_block() {
        let data = vec![START_BLOCK, b'a', END_BLOCK, b'Z'];
        let mut dec = decoder(data, 1024);
        assert!(matches!(
            dec.read_message().await,
            Err(EngineError::Framing { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn stalled_reader_times_out() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut dec = MllpDecoder::new(rx, max(1024), Duration::from_millis(20));
        assert!(matches!(
            dec.read_message().await,
            Err(EngineError::ReadTimeout { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn empty_payload_round_trips() {
        let mut dec = decoder(encode_frame(b"").to_vec(), 64);
        assert_eq!(dec.read_message().await.unwrap().unwrap().len(), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn encode_decode_inverse(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
                // EB terminates the frame, so it cannot appear in a payload.
                prop_assume!(!payload.contains(&END_BLOCK));

                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap();
                let decoded = rt.block_on(async {
                    let mut dec = decoder(encode_frame(&payload).to_vec(), 4096);
                    dec.read_message().await.unwrap().unwrap()
                });
                prop_assert_eq!(&decoded[..], &payload[..]);
            }
        }
    }
}
