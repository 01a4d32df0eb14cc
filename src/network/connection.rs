//! Connection setup for CoreRPC
//!
//! Runs the handshake on a freshly connected stream and turns it into a codec:
//! - Server side reads and validates the preamble
//! - Client side writes the preamble
//! - Both sides then split the stream into codec halves

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    lookup, read_handshake, write_handshake, Codec, CodecType, HandshakeError, Options,
    MAGIC_NUMBER,
};

/// State of a server-side connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, handshake not yet read
    AwaitingHandshake,
    /// Reading requests and dispatching them
    Serving,
    /// Read side finished, waiting for in-flight handlers
    Draining,
    /// Connection has been closed
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::AwaitingHandshake => "awaiting-handshake",
            ConnectionState::Serving => "serving",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Perform the server-side handshake.
///
/// On any failure the stream is dropped without a reply.
pub async fn accept_handshake<S>(
    mut stream: S,
    timeout: Duration,
    max_frame_size: usize,
) -> Result<Codec, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let handshake = match tokio::time::timeout(timeout, read_handshake(&mut stream)).await {
        Ok(result) => result?,
        Err(_) => return Err(HandshakeError::Timeout),
    };

    if handshake.magic_number != MAGIC_NUMBER {
        return Err(HandshakeError::InvalidMagic(handshake.magic_number));
    }

    let codec = CodecType::from_tag(&handshake.codec_type)
        .and_then(|codec_type| Codec::over(codec_type, stream, max_frame_size))
        .ok_or_else(|| HandshakeError::UnsupportedCodec(handshake.codec_type.clone()))?;

    tracing::debug!("Handshake accepted, codec {}", codec.codec_type);
    Ok(codec)
}

/// Perform the client-side handshake.
///
/// The stream is shut down if the preamble cannot be written.
pub async fn initiate_handshake<S>(mut stream: S, options: &Options) -> Result<Codec, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let new_codec = lookup(options.codec_type)
        .ok_or_else(|| HandshakeError::UnsupportedCodec(options.codec_type.to_string()))?;

    if let Err(e) = write_handshake(&mut stream, &options.handshake()).await {
        let _ = stream.shutdown().await;
        return Err(e);
    }

    let (read_half, write_half) = tokio::io::split(stream);
    Ok(new_codec(
        Box::new(read_half),
        Box::new(write_half),
        options.max_frame_size,
    ))
}
