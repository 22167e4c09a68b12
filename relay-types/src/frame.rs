//! Length-prefixed framing.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes
//! of [`Message`](crate::Message) body.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::WireError;

/// Largest accepted frame body.
///
/// A 32 MiB chunk can nearly double under MessagePack's integer-sequence
/// encoding of `Vec<u8>`, plus envelope and AEAD overhead.
pub const MAX_FRAME_SIZE: usize = 96 * 1024 * 1024;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Decode a length prefix, rejecting oversized frames.
pub fn frame_length(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, WireError> {
    let size = u32::from_be_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(size)
}

/// Read one frame body.
///
/// I/O errors (including EOF) pass through untouched; an oversized length
/// prefix surfaces as `InvalidData` wrapping the [`WireError`].
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let size = frame_length(header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one frame body and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            WireError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            },
        ));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}
