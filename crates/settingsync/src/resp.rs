//! RESP framing for the settings API, shared by the listener and the client
//! transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Incomplete")]
    Incomplete,
    #[error("Value exceeds {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<RespValue>),
    Null,
}

impl RespValue {
    /// Parse RESP value from buffer
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<RespValue, RespError> {
        if !buf.has_remaining() {
            return Err(RespError::Incomplete);
        }

        match buf.get_u8() {
            b'+' => Ok(RespValue::SimpleString(read_text(buf)?)),
            b'-' => Ok(RespValue::Error(read_text(buf)?)),
            b':' => Ok(RespValue::Integer(read_number(buf)?)),
            b'$' => {
                let len = read_number(buf)?;
                if len == -1 {
                    return Ok(RespValue::Null);
                }
                let len = usize::try_from(len).map_err(|_| RespError::InvalidProtocol)?;
                if buf.remaining() < len + 2 {
                    return Err(RespError::Incomplete);
                }

                let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
                buf.advance(len);
                if buf.get_u8() != b'\r' || buf.get_u8() != b'\n' {
                    return Err(RespError::InvalidProtocol);
                }
                Ok(RespValue::BulkString(data))
            }
            b'*' => {
                let count = read_number(buf)?;
                if count == -1 {
                    return Ok(RespValue::Null);
                }
                let count = usize::try_from(count).map_err(|_| RespError::InvalidProtocol)?;

                let mut array = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    array.push(RespValue::parse(buf)?);
                }
                Ok(RespValue::Array(array))
            }
            _ => Err(RespError::InvalidProtocol),
        }
    }

    /// Serialize RESP value to buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put(s.as_bytes());
                buf.put(&b"\r\n"[..]);
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.put(s.as_bytes());
                buf.put(&b"\r\n"[..]);
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.put(n.to_string().as_bytes());
                buf.put(&b"\r\n"[..]);
            }
            RespValue::BulkString(data) => {
                buf.put_u8(b'$');
                buf.put(data.len().to_string().as_bytes());
                buf.put(&b"\r\n"[..]);
                buf.put(data.as_ref());
                buf.put(&b"\r\n"[..]);
            }
            RespValue::Array(arr) => {
                buf.put_u8(b'*');
                buf.put(arr.len().to_string().as_bytes());
                buf.put(&b"\r\n"[..]);
                for val in arr {
                    val.serialize(buf);
                }
            }
            RespValue::Null => {
                buf.put(&b"$-1\r\n"[..]);
            }
        }
    }

    /// A command as sent by clients: an array of bulk strings
    pub fn command<I, T>(parts: I) -> RespValue
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        RespValue::Array(
            parts
                .into_iter()
                .map(|part| RespValue::BulkString(Bytes::copy_from_slice(part.as_ref())))
                .collect(),
        )
    }

    pub fn bulk(data: impl Into<Bytes>) -> RespValue {
        RespValue::BulkString(data.into())
    }

    pub fn simple(s: &str) -> RespValue {
        RespValue::SimpleString(s.to_string())
    }

    /// Helper to extract array of bulk strings (for commands)
    pub fn as_bulk_string_array(&self) -> Option<Vec<Bytes>> {
        match self {
            RespValue::Array(arr) => arr
                .iter()
                .map(|val| match val {
                    RespValue::BulkString(data) => Some(data.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// Accumulates bytes from a stream until one whole value parses
pub struct RespReader {
    buffer: BytesMut,
    max_bytes: usize,
}

impl RespReader {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_bytes,
        }
    }

    /// Next value, or None on a clean end of stream between values
    pub async fn read<R>(&mut self, reader: &mut R) -> Result<Option<RespValue>, RespError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if !self.buffer.is_empty() {
                let mut cursor = Cursor::new(&self.buffer[..]);
                match RespValue::parse(&mut cursor) {
                    Ok(value) => {
                        let pos = cursor.position() as usize;
                        self.buffer.advance(pos);
                        return Ok(Some(value));
                    }
                    Err(RespError::Incomplete) => {}
                    Err(e) => return Err(e),
                }
            }

            if self.buffer.len() >= self.max_bytes {
                return Err(RespError::TooLarge(self.max_bytes));
            }

            let n = reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(RespError::Io(io::ErrorKind::UnexpectedEof.into()))
                };
            }
        }
    }
}

pub async fn write_value<W>(writer: &mut W, value: &RespValue) -> Result<(), RespError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    value.serialize(&mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

fn read_line(buf: &mut Cursor<&[u8]>) -> Result<Vec<u8>, RespError> {
    let start = buf.position() as usize;
    let slice = &buf.get_ref()[start..];

    match slice.windows(2).position(|w| w == b"\r\n") {
        Some(i) => {
            let line = slice[..i].to_vec();
            buf.advance(i + 2);
            Ok(line)
        }
        None => Err(RespError::Incomplete),
    }
}

fn read_text(buf: &mut Cursor<&[u8]>) -> Result<String, RespError> {
    let line = read_line(buf)?;
    Ok(String::from_utf8_lossy(&line).to_string())
}

fn read_number(buf: &mut Cursor<&[u8]>) -> Result<i64, RespError> {
    read_text(buf)?
        .parse::<i64>()
        .map_err(|_| RespError::InvalidProtocol)
}
