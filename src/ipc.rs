//! Frame codec for the process-worker wire protocol
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │     json payload       │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(payload), NOT including the 4-byte
//! prefix. Envelopes cross the boundary as JSON (raw bytes ride base64 via
//! the envelope's own serde); pending request slots stay in the parent.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::Item;
use crate::error::{EngineError, Result};
use crate::host::ProcessOutcome;

/// Frame type: envelope for processing.
pub const FRAME_ENVELOPE: u8 = 0x01;
/// Frame type: processing outcome.
pub const FRAME_OUTCOME: u8 = 0x02;
/// Frame type: processing failure.
pub const FRAME_ERROR: u8 = 0x03;
/// Frame type: orderly shutdown request.
pub const FRAME_SHUTDOWN: u8 = 0x04;

/// Worker frames are bounded well above the MLLP payload cap.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Failure detail crossing the process boundary.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct WorkerFailure {
    pub detail: String,
}

/// Read one frame from the stream.
///
/// Returns `(frame_type, payload_bytes)`, or `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {frame_len} bytes"),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too short: missing type byte",
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    let frame_type = frame_data[0];
    let payload = frame_data[1..].to_vec();

    Ok(Some((frame_type, payload)))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = 1u32 + u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "payload exceeds u32")
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[frame_type]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Child-side main loop for the `worker` mode of the binary.
///
/// Reconstructs the behaviour from the item document, then answers envelope
/// frames on stdin with outcome frames on stdout until shutdown or EOF.
pub async fn run_worker(item_json: &str) -> Result<()> {
    let item: Item = serde_json::from_str(item_json)?;
    let behaviour = crate::hosts::build_behaviour(&item)?;

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    debug!(item = %item.name, "process worker ready");
    loop {
        let frame = read_frame(&mut stdin).await?;
        match frame {
            Some((FRAME_ENVELOPE, payload)) => {
                let envelope: crate::envelope::Envelope = serde_json::from_slice(&payload)?;
                match behaviour.process(envelope).await {
                    Ok(outcome) => {
                        let body = serde_json::to_vec(&outcome)?;
                        write_frame(&mut stdout, FRAME_OUTCOME, &body).await?;
                    }
                    Err(err) => {
                        let body = serde_json::to_vec(&WorkerFailure {
                            detail: err.to_string(),
                        })?;
                        write_frame(&mut stdout, FRAME_ERROR, &body).await?;
                    }
                }
            }
            Some((FRAME_SHUTDOWN, _)) | None => break,
            Some((other, _)) => {
                return Err(EngineError::internal(format!(
                    "unexpected worker frame type: 0x{other:02X}"
                )));
            }
        }
    }
    debug!(item = %item.name, "process worker exiting");
    Ok(())
}

/// Parses an outcome frame on the parent side.
pub fn decode_worker_reply(frame_type: u8, payload: &[u8]) -> Result<ProcessOutcome> {
    match frame_type {
        FRAME_OUTCOME => Ok(serde_json::from_slice(payload)?),
        FRAME_ERROR => {
            let failure: WorkerFailure = serde_json::from_slice(payload)?;
            Err(EngineError::internal(format!(
                "process worker failed: {}",
                failure.detail
            )))
        }
        other => Err(EngineError::internal(format!(
            "unexpected worker reply type: 0x{other:02X}"
        ))),
    }
}
