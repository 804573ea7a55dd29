//! Frame envelope: `[tag: i32 BE][payload length: i32 BE][payload]`.
//!
//! Framing needs no knowledge of message shapes, so a reader always finds the
//! next frame boundary, even after a tag it cannot decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Size of the tag and length fields preceding every payload.
pub const FRAME_HEADER_LEN: usize = 8;

/// Maximum payload size (64 MB). Safety valve against malformed headers.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// One framed message: its type tag and the still-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: i32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Serialize header and payload into one contiguous buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let len = i32::try_from(self.payload.len()).map_err(|_| ProtocolError::FieldTooLarge {
            field: "payload",
            len: self.payload.len(),
        })?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_i32(self.tag);
        buf.put_i32(len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied. On error nothing
    /// is consumed: the caller's buffer is untouched.
    pub fn parse(buf: &[u8], max_payload: u32) -> Result<(Self, usize)> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::malformed(format!(
                "frame header needs {FRAME_HEADER_LEN} bytes, {} available",
                buf.len()
            )));
        }
        let mut header = &buf[..FRAME_HEADER_LEN];
        let tag = header.get_i32();
        let len = payload_len(header.get_i32(), max_payload)?;

        let end = FRAME_HEADER_LEN + len;
        if buf.len() < end {
            return Err(ProtocolError::malformed(format!(
                "frame declares {len} payload bytes, {} available",
                buf.len() - FRAME_HEADER_LEN
            )));
        }
        let frame = Self::new(tag, Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..end]));
        Ok((frame, end))
    }
}

fn payload_len(raw: i32, max_payload: u32) -> Result<usize> {
    let len = u32::try_from(raw)
        .map_err(|_| ProtocolError::malformed(format!("negative payload length {raw}")))?;
    if len > max_payload {
        return Err(ProtocolError::malformed(format!(
            "payload length {len} exceeds max frame size {max_payload}"
        )));
    }
    Ok(len as usize)
}

/// Write one frame and flush.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, blocking until it is complete.
///
/// EOF or an I/O error at any point is [`ProtocolError::ChannelClosed`]. A
/// negative or oversized length is [`ProtocolError::MalformedMessage`]; the
/// stream position is then unknown, so callers must treat it as fatal.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    max_payload: u32,
) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let mut cursor = &header[..];
    let tag = cursor.get_i32();
    let len = payload_len(cursor.get_i32(), max_payload)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame::new(tag, payload))
}
