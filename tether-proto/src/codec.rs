//! Length-prefixed frame codec over any async byte stream.
//!
//! Each frame is: `[u32 big-endian length][postcard FrameHeader][payload]`.
//! The length covers the header and the payload.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// What a frame does to its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FrameKind {
    /// Carries one encoded event. Opens the stream on first use.
    Data,
    /// The sender will not use the stream again.
    Close,
}

/// Routing header that precedes every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FrameHeader {
    /// Stream the frame belongs to.
    pub stream: u32,
    /// Frame type.
    pub kind: FrameKind,
}

impl FrameHeader {
    /// Creates a header.
    pub const fn new(stream: u32, kind: FrameKind) -> Self {
        Self { stream, kind }
    }
}

/// Writes one frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    header: FrameHeader,
    payload: &[u8],
) -> io::Result<()> {
    let mut buf =
        postcard::to_allocvec(&header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.extend_from_slice(payload);
    let len = u32::try_from(buf.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&buf).await?;
    w.flush().await
}

/// Reads one frame.
///
/// A clean end-of-stream before the length prefix surfaces as
/// [`io::ErrorKind::UnexpectedEof`].
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<(FrameHeader, Vec<u8>)> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    let (header, payload) = postcard::take_from_bytes::<FrameHeader>(&buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((header, payload.to_vec()))
}
