//! Length-prefixed frame codec.
//!
//! Reads drive the underlying byte stream until the full header and payload
//! are consumed; writes emit header then payload. Single-writer discipline
//! on a stream is the caller's responsibility.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_LEN;

/// Errors from the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Declared payload length exceeds the 2^31 - 1 cap.
    #[error("frame too large: {0} bytes")]
    TooLarge(u64),

    /// Underlying stream error or short read.
    #[error("frame i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes one frame: type byte, little-endian u64 length, payload.
pub async fn write_frame<W>(w: &mut W, typ: u8, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut hdr = [0u8; 9];
    hdr[0] = typ;
    hdr[1..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    w.write_all(&hdr).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Reads one frame, returning its type and payload.
///
/// The length is validated against [`MAX_FRAME_LEN`] before any payload
/// allocation happens.
pub async fn read_frame<R>(r: &mut R) -> Result<(u8, Vec<u8>), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 9];
    r.read_exact(&mut hdr).await?;
    let typ = hdr[0];
    let len = u64::from_le_bytes(hdr[1..].try_into().unwrap());
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        r.read_exact(&mut payload).await?;
    }
    Ok((typ, payload))
}
