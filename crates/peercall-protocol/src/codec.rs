//! Newline-delimited JSON framing.
//!
//! One envelope per line. Compact JSON never contains a raw `\n`, so the
//! terminator alone delimits frames on a long-lived stream.

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Upper bound on one encoded envelope, excluding the terminator
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("stream ended mid-frame after {read} bytes")]
    Truncated { read: usize },
}

impl CodecError {
    /// Whether the stream can still be used after this error.
    ///
    /// Encoding failures are detected before anything is written.
    pub fn is_recoverable_on_write(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::FrameTooLarge { .. })
    }
}

/// Encode a value as one json line (terminator included).
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_bytes(reader, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Read the next frame. `Ok(None)` means the stream closed cleanly
    /// between frames.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        self.buf.clear();
        let limit = self.max_frame_bytes as u64 + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }

        if self.buf.last() != Some(&b'\n') {
            if self.buf.len() > self.max_frame_bytes {
                return Err(CodecError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
            }
            return Err(CodecError::Truncated { read: n });
        }

        self.buf.pop();
        Ok(Some(serde_json::from_slice(&self.buf)?))
    }

    pub async fn read_request(&mut self) -> Result<Option<RequestEnvelope>, CodecError> {
        self.read_frame().await
    }

    pub async fn read_response(&mut self) -> Result<Option<ResponseEnvelope>, CodecError> {
        self.read_frame().await
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self::with_max_frame_bytes(writer, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    /// Encode and write one frame, flushing it to the stream.
    ///
    /// Oversized frames are rejected before any byte is written.
    pub async fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let line = encode_line(value)?;
        if line.len() - 1 > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                limit: self.max_frame_bytes,
            });
        }
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_request(&mut self, request: &RequestEnvelope) -> Result<(), CodecError> {
        self.write_frame(request).await
    }

    pub async fn write_response(&mut self, response: &ResponseEnvelope) -> Result<(), CodecError> {
        self.write_frame(response).await
    }

    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
