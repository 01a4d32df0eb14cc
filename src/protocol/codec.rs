//! Protocol codec for encoding/decoding frames
//!
//! A codec frames a `Header` plus an opaque body over one half of a byte
//! stream. The read and write halves are separate objects so that one task can
//! read responses while other tasks write requests on the same connection.

use std::fmt;
use std::io;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Header, Payload};

/// Length prefix size for each part of a frame
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Connection closed")]
    Closed,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether this error is a clean end-of-stream between frames
    pub fn is_closed(&self) -> bool {
        matches!(self, CodecError::Closed)
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Serialization format negotiated during the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecType {
    #[default]
    #[serde(rename = "application/bincode")]
    Bincode,
    #[serde(rename = "application/json")]
    Json,
}

impl CodecType {
    /// Tag sent in the handshake
    pub const fn tag(&self) -> &'static str {
        match self {
            CodecType::Bincode => "application/bincode",
            CodecType::Json => "application/json",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "application/bincode" => Some(CodecType::Bincode),
            "application/json" => Some(CodecType::Json),
            _ => None,
        }
    }

    /// Serialize a value in this format
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        match self {
            CodecType::Bincode => Ok(bincode::serialize(value)?),
            CodecType::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserialize a value in this format
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        match self {
            CodecType::Bincode => Ok(bincode::deserialize(bytes)?),
            CodecType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CodecType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bincode" => Ok(CodecType::Bincode),
            "json" => Ok(CodecType::Json),
            other => CodecType::from_tag(other).ok_or_else(|| format!("unknown codec type: {}", other)),
        }
    }
}

/// Read half of a codec
#[async_trait]
pub trait CodecReader: Send {
    /// Read the next header. A clean end-of-stream yields `CodecError::Closed`.
    async fn read_header(&mut self) -> CodecResult<Header>;

    /// Read the body that follows the last header
    async fn read_body(&mut self) -> CodecResult<Payload>;

    /// Consume the body that follows the last header without keeping it
    async fn discard_body(&mut self) -> CodecResult<()> {
        self.read_body().await.map(|_| ())
    }
}

/// Write half of a codec
#[async_trait]
pub trait CodecWriter: Send {
    /// Write one complete header + body frame and flush it.
    ///
    /// Not synchronized: callers sharing a writer must hold a lock around this.
    async fn write(&mut self, header: &Header, body: &Payload) -> CodecResult<()>;

    /// Shut down the underlying stream
    async fn close(&mut self) -> CodecResult<()>;
}

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of a codec bound to one connection
pub struct Codec {
    pub codec_type: CodecType,
    pub reader: Box<dyn CodecReader>,
    pub writer: Box<dyn CodecWriter>,
}

impl Codec {
    /// Split a duplex stream and build the registered codec for `codec_type` over it
    pub fn over<S>(codec_type: CodecType, stream: S, max_frame_size: usize) -> Option<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let new_codec = lookup(codec_type)?;
        let (read_half, write_half) = tokio::io::split(stream);
        Some(new_codec(Box::new(read_half), Box::new(write_half), max_frame_size))
    }
}

/// Constructor stored in the codec registry
pub type NewCodecFn = fn(BoxReader, BoxWriter, usize) -> Codec;

/// Registered codecs. Fixed at compile time and never mutated.
static REGISTRY: &[(CodecType, NewCodecFn)] = &[
    (CodecType::Bincode, new_bincode_codec),
    (CodecType::Json, new_json_codec),
];

/// Look up the constructor for a codec type
pub fn lookup(codec_type: CodecType) -> Option<NewCodecFn> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == codec_type)
        .map(|(_, new_codec)| *new_codec)
}

fn new_bincode_codec(reader: BoxReader, writer: BoxWriter, max_frame_size: usize) -> Codec {
    stream_codec(CodecType::Bincode, reader, writer, max_frame_size)
}

fn new_json_codec(reader: BoxReader, writer: BoxWriter, max_frame_size: usize) -> Codec {
    stream_codec(CodecType::Json, reader, writer, max_frame_size)
}

fn stream_codec(
    codec_type: CodecType,
    reader: BoxReader,
    writer: BoxWriter,
    max_frame_size: usize,
) -> Codec {
    Codec {
        codec_type,
        reader: Box::new(StreamReader::new(codec_type, reader, max_frame_size)),
        writer: Box::new(StreamWriter::new(codec_type, writer, max_frame_size)),
    }
}

/// Length-prefixed frame reader
pub struct StreamReader {
    codec_type: CodecType,
    inner: BoxReader,
    max_frame_size: usize,
}

impl StreamReader {
    pub fn new(codec_type: CodecType, inner: BoxReader, max_frame_size: usize) -> Self {
        Self {
            codec_type,
            inner,
            max_frame_size,
        }
    }

    /// Read a length prefix. EOF before the first byte is `Closed` when allowed.
    async fn read_length(&mut self, eof_is_clean: bool) -> CodecResult<usize> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        if eof_is_clean {
            if self.inner.read(&mut prefix[..1]).await? == 0 {
                return Err(CodecError::Closed);
            }
            self.inner.read_exact(&mut prefix[1..]).await?;
        } else {
            self.inner.read_exact(&mut prefix).await?;
        }

        let length = u32::from_be_bytes(prefix) as usize;
        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(length, self.max_frame_size));
        }
        Ok(length)
    }

    async fn read_part(&mut self, length: usize) -> CodecResult<Bytes> {
        let mut buf = vec![0u8; length];
        self.inner.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl CodecReader for StreamReader {
    async fn read_header(&mut self) -> CodecResult<Header> {
        let length = self.read_length(true).await?;
        let bytes = self.read_part(length).await?;
        self.codec_type.decode(&bytes)
    }

    async fn read_body(&mut self) -> CodecResult<Payload> {
        let length = self.read_length(false).await?;
        let bytes = self.read_part(length).await?;
        Ok(Payload::new(self.codec_type, bytes))
    }

    async fn discard_body(&mut self) -> CodecResult<()> {
        let length = self.read_length(false).await? as u64;
        let skipped = tokio::io::copy(&mut (&mut self.inner).take(length), &mut tokio::io::sink()).await?;
        if skipped != length {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}

/// Length-prefixed frame writer
pub struct StreamWriter {
    codec_type: CodecType,
    inner: BoxWriter,
    max_frame_size: usize,
    write_buf: BytesMut,
}

impl StreamWriter {
    pub fn new(codec_type: CodecType, inner: BoxWriter, max_frame_size: usize) -> Self {
        Self {
            codec_type,
            inner,
            max_frame_size,
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    fn check_size(&self, length: usize) -> CodecResult<()> {
        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(length, self.max_frame_size));
        }
        Ok(())
    }

    async fn flush_frame(&mut self) -> io::Result<()> {
        self.inner.write_all(&self.write_buf).await?;
        self.inner.flush().await
    }
}

#[async_trait]
impl CodecWriter for StreamWriter {
    async fn write(&mut self, header: &Header, body: &Payload) -> CodecResult<()> {
        let header_bytes = self.codec_type.encode(header)?;
        self.check_size(header_bytes.len())?;
        self.check_size(body.len())?;

        self.write_buf.clear();
        self.write_buf.put_u32(header_bytes.len() as u32);
        self.write_buf.put_slice(&header_bytes);
        self.write_buf.put_u32(body.len() as u32);
        self.write_buf.put_slice(body.bytes());

        if let Err(e) = self.flush_frame().await {
            // A partial frame may be on the wire; the stream cannot be reused.
            tracing::warn!("Write failed, closing stream: {}", e);
            let _ = self.inner.shutdown().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn close(&mut self) -> CodecResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_FRAME_SIZE;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn pair(codec_type: CodecType) -> (Codec, Codec) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Codec::over(codec_type, a, MAX_FRAME_SIZE).unwrap(),
            Codec::over(codec_type, b, MAX_FRAME_SIZE).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_frame_roundtrip_both_codecs() {
        for codec_type in [CodecType::Bincode, CodecType::Json] {
            let (mut left, mut right) = pair(codec_type);
            let header = Header::new("Foo.Sum", 3);
            let body = Payload::encode(codec_type, "req 3").unwrap();

            left.writer.write(&header, &body).await.unwrap();

            let read = right.reader.read_header().await.unwrap();
            assert_eq!(read, header);
            let body = right.reader.read_body().await.unwrap();
            assert_eq!(body.decode::<String>().unwrap(), "req 3");
        }
    }

    #[tokio::test]
    async fn test_discard_body_keeps_stream_in_sync() {
        let (mut left, mut right) = pair(CodecType::Bincode);
        let skipped = Payload::encode(CodecType::Bincode, &vec![7u32; 100]).unwrap();
        let kept = Payload::encode(CodecType::Bincode, "second").unwrap();

        left.writer.write(&Header::new("A.B", 1), &skipped).await.unwrap();
        left.writer.write(&Header::new("A.B", 2), &kept).await.unwrap();

        assert_eq!(right.reader.read_header().await.unwrap().seq, 1);
        right.reader.discard_body().await.unwrap();
        assert_eq!(right.reader.read_header().await.unwrap().seq, 2);
        let body = right.reader.read_body().await.unwrap();
        assert_eq!(body.decode::<String>().unwrap(), "second");
    }

    #[tokio::test]
    async fn test_clean_eof_is_closed() {
        let (mut left, mut right) = pair(CodecType::Bincode);
        left.writer.close().await.unwrap();
        let err = right.reader.read_header().await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_io_error() {
        let (a, mut b) = tokio::io::duplex(1024);
        b.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(b);

        let mut codec = Codec::over(CodecType::Bincode, a, MAX_FRAME_SIZE).unwrap();
        match codec.reader.read_header().await {
            Err(CodecError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_oversize_frames_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let mut small = Codec::over(CodecType::Bincode, a, 48).unwrap();
        let mut reader = Codec::over(CodecType::Bincode, b, 48).unwrap();

        let body = Payload::new(CodecType::Bincode, vec![0u8; 64]);
        let err = small.writer.write(&Header::new("A.B", 1), &body).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(64, 48)));

        // Nothing was written, so the stream is still usable.
        let ok = Payload::new(CodecType::Bincode, vec![1u8; 4]);
        small.writer.write(&Header::new("A.B", 2), &ok).await.unwrap();
        assert_eq!(reader.reader.read_header().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_concurrent_writes_never_interleave() {
        let (left, mut right) = pair(CodecType::Bincode);
        let writer = Arc::new(Mutex::new(left.writer));

        let mut tasks = Vec::new();
        for seq in 0..20u64 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let body = Payload::encode(CodecType::Bincode, &vec![seq; 500]).unwrap();
                writer.lock().await.write(&Header::new("Foo.Sum", seq), &body).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..20 {
            let header = right.reader.read_header().await.unwrap();
            let body: Vec<u64> = right.reader.read_body().await.unwrap().decode().unwrap();
            assert!(body.iter().all(|v| *v == header.seq));
            seen.push(header.seq);
        }
        for task in tasks {
            task.await.unwrap();
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_registry_lookup() {
        assert!(lookup(CodecType::Bincode).is_some());
        assert!(lookup(CodecType::Json).is_some());
        assert_eq!(CodecType::from_tag("application/gob"), None);
        assert_eq!(CodecType::from_tag("application/json"), Some(CodecType::Json));
    }

    #[test]
    fn test_codec_type_parsing() {
        assert_eq!("json".parse::<CodecType>().unwrap(), CodecType::Json);
        assert_eq!("application/bincode".parse::<CodecType>().unwrap(), CodecType::Bincode);
        assert!("gob".parse::<CodecType>().is_err());
        assert_eq!(CodecType::default(), CodecType::Bincode);
    }
}
