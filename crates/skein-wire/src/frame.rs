//! Length-delimited framing over async byte streams.
//!
//! Each frame is a `u32` little-endian length prefix followed by the frame
//! body (header + payload). The reader enforces a per-frame byte budget and
//! rejects oversized frames before reading their body, so a misbehaving
//! peer cannot make us buffer arbitrary amounts of data. The writer counts
//! bytes written since the last flush; the encoder uses that counter to
//! decide when to flush its micro-batch of frames.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::{encode_payload, Header, MsgType};

/// Error reading a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame exceeds the configured receive size limit.
    #[error("message too big: frame of {size} bytes exceeds the {limit} byte limit")]
    TooBig { size: usize, limit: usize },
    /// The frame body did not start with a well-formed header.
    #[error("malformed frame header: {0}")]
    Header(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes frames to the outbound half of a transport.
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
    since_flush: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
            since_flush: 0,
        }
    }

    /// Write one frame. The bytes land in the write buffer; call
    /// [`flush`](Self::flush) to push them to the transport.
    pub async fn write_frame(
        &mut self,
        msg_type: MsgType,
        chan_id: u32,
        payload: &[u8],
    ) -> io::Result<()> {
        self.write_frame_raw(msg_type.wire(), chan_id, payload).await
    }

    /// Like [`write_frame`](Self::write_frame) but with an arbitrary
    /// message-type byte. Intended for protocol-level tests that need to
    /// emit reserved or invalid frames.
    pub async fn write_frame_raw(
        &mut self,
        msg_type: u8,
        chan_id: u32,
        payload: &[u8],
    ) -> io::Result<()> {
        let header = encode_payload(&Header { msg_type, chan_id })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let body_len = header.len() + payload.len();
        let prefix = u32::try_from(body_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too long to encode"))?;
        self.inner.write_all(&prefix.to_le_bytes()).await?;
        self.inner.write_all(&header).await?;
        self.inner.write_all(payload).await?;
        self.since_flush += 4 + body_len;
        Ok(())
    }

    /// Bytes handed to the writer since the last successful flush.
    pub fn bytes_since_flush(&self) -> usize {
        self.since_flush
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await?;
        self.since_flush = 0;
        Ok(())
    }

    /// Flush and shut down the write side of the transport.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Reads frames from the inbound half of a transport, enforcing the
/// session's message size limit.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `limit` is the maximum accepted frame body length; callers clamp it
    /// to at least [`MIN_MSG_SIZE_LIMIT`](crate::MIN_MSG_SIZE_LIMIT).
    pub fn new(reader: R, limit: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            limit,
        }
    }

    /// Read the next frame, returning its header and payload.
    pub async fn read_frame(&mut self) -> Result<(Header, Vec<u8>), FrameError> {
        let mut prefix = [0u8; 4];
        self.inner.read_exact(&mut prefix).await?;
        let body_len = u32::from_le_bytes(prefix) as usize;
        if body_len > self.limit {
            return Err(FrameError::TooBig {
                size: body_len,
                limit: self.limit,
            });
        }
        if body_len == 0 {
            return Err(FrameError::Header("empty frame".into()));
        }
        let mut body = vec![0u8; body_len];
        self.inner.read_exact(&mut body).await?;
        let (header, rest): (Header, &[u8]) =
            postcard::take_from_bytes(&body).map_err(|e| FrameError::Header(e.to_string()))?;
        Ok((header, rest.to_vec()))
    }
}
