//! Length-prefixed JSON framing for the warden ↔ scan host byte stream.
//!
//! Every frame is a 4-byte little-endian unsigned length followed by exactly
//! that many bytes of UTF-8 JSON. Inbound frames above 64 MiB, and
//! zero-length frames, are rejected. A stream that ends cleanly between
//! frames reads as `Ok(None)`; one that ends inside a frame is an error the
//! caller should treat as an abnormal disconnect.

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on a single inbound frame.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("zero-length frame")]
    Empty,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(u64),
    #[error("stream closed mid-frame after {0} of 4 header bytes")]
    Truncated(usize),
    #[error("frame io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame is not serializable json: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Read one frame. `Ok(None)` means the peer closed the stream at a frame
/// boundary, which is how a scan host signals a normal shutdown.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated(filled));
        }
        filled += n;
    }
    let len = u32::from_le_bytes(header);
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len as u64));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len() as u64))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize `msg` and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    write_frame(writer, &payload).await
}
