//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |       Payload Length (4B, BE)     |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! One frame carries exactly one datagram. Frames are never split or
//! coalesced.

use crate::protocol::LENGTH_PREFIX_LEN;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload representable by the length prefix
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Framing errors
#[derive(Debug, Error)]
pub enum FramingError {
    /// Stream ended cleanly on a frame boundary
    #[error("Stream closed")]
    Closed,

    /// Stream ended in the middle of a length prefix or payload
    #[error("Stream closed mid-frame: got {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },

    #[error("Frame too large: {0} > {1}")]
    TooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Clean close on a frame boundary
    pub fn is_clean_close(&self) -> bool {
        matches!(self, FramingError::Closed)
    }
}

/// Encode a payload into a length-prefixed frame
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FramingError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FramingError::TooLarge(payload.len(), MAX_FRAME_LEN));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Decode one frame from a stream, without a size limit
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin,
{
    read_frame_limited(reader, MAX_FRAME_LEN).await
}

/// Decode one frame from a stream, rejecting payloads above `max_len`
pub async fn read_frame_limited<R>(reader: &mut R, max_len: usize) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    let got = read_full(reader, &mut len_buf).await?;
    if got == 0 {
        return Err(FramingError::Closed);
    }
    if got < LENGTH_PREFIX_LEN {
        return Err(FramingError::Truncated {
            expected: LENGTH_PREFIX_LEN,
            received: got,
        });
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FramingError::TooLarge(len, max_len));
    }

    let mut payload = BytesMut::zeroed(len);
    let got = read_full(reader, &mut payload).await?;
    if got < len {
        return Err(FramingError::Truncated {
            expected: len,
            received: got,
        });
    }

    Ok(payload.freeze())
}

/// Encode and write one frame, then flush
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    // Length prefix and payload go out in a single write
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read until `buf` is full or EOF; returns the number of bytes read
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, std::io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
