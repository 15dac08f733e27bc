//! Length-prefixed protobuf frames: a 4-byte big-endian length, then the body.

use crate::error::SyncError;
use crate::proto::realtime::Frame;
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

impl From<FrameError> for SyncError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { .. } => SyncError::Validation(err.to_string()),
            FrameError::Io(_) | FrameError::Decode(_) => {
                SyncError::TransientIo(err.to_string())
            }
        }
    }
}

/// Read one frame, or None if the peer closed between frames
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    // Read length prefix (4 bytes big-endian)
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_bytes {
        return Err(FrameError::TooLarge {
            len,
            max: max_bytes,
        });
    }

    // Read message body
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Frame::decode(&buf[..])?))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode_to_vec();
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
