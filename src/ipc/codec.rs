//! Frame codec for the IPC wire protocol.
//!
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! `len` counts the type byte and the payload, not the prefix itself.

use std::io::{Error as IoError, ErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Request = 0x01,
    Response = 0x02,
    StreamChunk = 0x03,
    StreamEnd = 0x04,
    Error = 0xFF,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameType::Request),
            0x02 => Some(FrameType::Response),
            0x03 => Some(FrameType::StreamChunk),
            0x04 => Some(FrameType::StreamEnd),
            0xFF => Some(FrameType::Error),
            _ => None,
        }
    }
}

/// One decoded frame. `kind` is the raw type byte so unknown types can be
/// reported back to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_byte(self.kind)
    }
}

/// Read one frame. `Ok(None)` on clean EOF before a length prefix.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<Frame>> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(prefix);
    if len == 0 {
        return Err(IoError::new(ErrorKind::InvalidData, "frame missing type byte"));
    }
    if len > max_frame_bytes {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {max_frame_bytes}"),
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let payload = body.split_off(1);
    Ok(Some(Frame {
        kind: body[0],
        payload,
    }))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: FrameType,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .and_then(|n| n.checked_add(1))
        .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "payload too large to frame"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[kind as u8]).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}
