//! Connection handshake
//!
//! The first thing a client writes on a new connection is a single JSON object
//! terminated by a newline. JSON is used regardless of the codec being
//! negotiated, so the server can read it before it knows which codec to build.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CodecType, MAGIC_NUMBER, MAX_FRAME_SIZE};

/// Upper bound on the encoded handshake, newline included
pub const MAX_HANDSHAKE_SIZE: usize = 1024;

/// Handshake errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed handshake: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid magic number {0:#x}")]
    InvalidMagic(u32),

    #[error("Invalid codec type {0}")]
    UnsupportedCodec(String),

    #[error("Handshake exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Handshake timeout")]
    Timeout,
}

/// Handshake record as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic_number: u32,
    pub codec_type: String,
}

/// Client connection options
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Protocol identity; always forced to `MAGIC_NUMBER` before use
    pub magic_number: u32,
    /// Codec for every frame after the handshake
    pub codec_type: CodecType,
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Largest header or body the client will read or write
    pub max_frame_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
            connect_timeout: Duration::from_secs(10),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Options {
    pub fn new(codec_type: CodecType) -> Self {
        Self {
            codec_type,
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Merge caller options over the defaults
    pub fn parse(options: Option<Options>) -> Options {
        let mut options = options.unwrap_or_default();
        options.magic_number = MAGIC_NUMBER;
        options
    }

    /// The record sent to the server
    pub fn handshake(&self) -> Handshake {
        Handshake {
            magic_number: self.magic_number,
            codec_type: self.codec_type.tag().to_string(),
        }
    }
}

/// Write the handshake line and flush it
pub async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = serde_json::to_vec(handshake)?;
    line.push(b'\n');
    if line.len() > MAX_HANDSHAKE_SIZE {
        return Err(HandshakeError::TooLarge(MAX_HANDSHAKE_SIZE));
    }
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the handshake line.
///
/// Reads one byte at a time so that no bytes belonging to the first frame are
/// consumed from the stream.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            return Err(HandshakeError::Closed);
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() >= MAX_HANDSHAKE_SIZE {
            return Err(HandshakeError::TooLarge(MAX_HANDSHAKE_SIZE));
        }
    }
    Ok(serde_json::from_slice(&line)?)
}
