//! CoreRPC Server
//!
//! The server accepts connections, runs the handshake, then serves each
//! connection with a loop that reads requests in order, dispatches every
//! request to its own task and writes responses under a per-connection lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::connection::{accept_handshake, ConnectionState};
use crate::protocol::{Codec, CodecWriter, HandshakeError, Header, Payload, MAX_FRAME_SIZE};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Failure of a single dispatched request, reported in the response header
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("rpc server: service/method request ill-formed: {0}")]
    MalformedName(String),

    #[error("rpc server: can't find method {0}")]
    UnknownMethod(String),

    #[error("rpc server: bad arguments for {method}: {reason}")]
    BadArgs { method: String, reason: String },

    #[error("rpc server: reply for {method} rejected: {reason}")]
    BadReply { method: String, reason: String },

    #[error("rpc server: handler for {0} panicked")]
    Panicked(String),

    #[error("{0}")]
    Handler(String),
}

/// Resolves a service method to code and runs it
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
    async fn invoke(&self, service_method: &str, args: Payload) -> Result<Payload, InvokeError>;
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum time a new connection may take to send its handshake
    pub handshake_timeout: Duration,
    /// Largest header or body accepted or sent
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

type SharedWriter = Arc<Mutex<Box<dyn CodecWriter>>>;

/// CoreRPC Server
#[derive(Clone)]
pub struct Server {
    invoker: Arc<dyn Invoker>,
    config: ServerConfig,
}

impl Server {
    /// Create a new server with the default configuration
    pub fn new(invoker: impl Invoker) -> Self {
        Self::with_config(invoker, ServerConfig::default())
    }

    pub fn with_config(invoker: impl Invoker, config: ServerConfig) -> Self {
        Self {
            invoker: Arc::new(invoker),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections until the listener fails, serving each on its own task
    pub async fn accept(&self, listener: TcpListener) -> ServerResult<()> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("rpc server: accept error: {}", e);
                    return Err(e.into());
                }
            };

            tracing::info!("New connection from {}", addr);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_conn(stream).await {
                    tracing::warn!("Connection from {} rejected: {}", addr, e);
                }
            });
        }
    }

    /// Serve a single connection until the peer stops sending requests.
    ///
    /// Returns once every dispatched request has been answered and the
    /// connection is closed.
    pub async fn serve_conn<S>(&self, stream: S) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tracing::debug!("Connection {}", ConnectionState::AwaitingHandshake);
        let codec = accept_handshake(
            stream,
            self.config.handshake_timeout,
            self.config.max_frame_size,
        )
        .await?;

        self.serve_codec(codec).await;
        Ok(())
    }

    async fn serve_codec(&self, codec: Codec) {
        let Codec { mut reader, writer, .. } = codec;
        let sending: SharedWriter = Arc::new(Mutex::new(writer));
        let mut handlers = JoinSet::new();
        let mut requests = 0u64;

        tracing::debug!("Connection {}", ConnectionState::Serving);
        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    tracing::warn!("rpc server: read header error: {}", e);
                    break;
                }
            };

            let args = match reader.read_body().await {
                Ok(args) => args,
                Err(e) => {
                    tracing::warn!("rpc server: read body error for seq {}: {}", header.seq, e);
                    break;
                }
            };

            requests += 1;
            handlers.spawn(handle_request(
                self.invoker.clone(),
                header,
                args,
                sending.clone(),
                self.config.max_frame_size,
            ));
        }

        tracing::debug!(
            "Connection {} with {} request(s) in flight",
            ConnectionState::Draining,
            handlers.len()
        );
        while let Some(result) = handlers.join_next().await {
            if let Err(e) = result {
                tracing::error!("rpc server: request task failed: {}", e);
            }
        }

        if let Err(e) = sending.lock().await.close().await {
            tracing::debug!("rpc server: close error: {}", e);
        }
        tracing::debug!("Connection {} after {} request(s)", ConnectionState::Closed, requests);
    }
}

/// Run one request and write its response
async fn handle_request(
    invoker: Arc<dyn Invoker>,
    mut header: Header,
    args: Payload,
    sending: SharedWriter,
    max_frame_size: usize,
) {
    let codec_type = args.codec_type();
    let method = header.service_method.clone();
    tracing::debug!("rpc server: {} seq={} ({} bytes)", method, header.seq, args.len());

    // Run the invoker on its own task so a panic still produces a response.
    let outcome = tokio::spawn(async move { invoker.invoke(&method, args).await }).await;

    let result = match outcome {
        Ok(result) => result,
        Err(_) => Err(InvokeError::Panicked(header.service_method.clone())),
    };

    let reply = match result {
        Ok(reply) if reply.len() > max_frame_size => {
            header.error = InvokeError::BadReply {
                method: header.service_method.clone(),
                reason: format!("{} bytes exceeds {}", reply.len(), max_frame_size),
            }
            .to_string();
            Payload::empty(codec_type)
        }
        Ok(reply) => reply,
        Err(e) => {
            header.error = e.to_string();
            Payload::empty(codec_type)
        }
    };

    let mut writer = sending.lock().await;
    if let Err(e) = writer.write(&header, &reply).await {
        tracing::error!("rpc server: write response error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::initiate_handshake;
    use crate::network::Router;
    use crate::protocol::{write_handshake, CodecType, Handshake, Options, MAGIC_NUMBER};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn router() -> Router {
        let mut router = Router::new();
        router
            .register("Foo.Sum", |args: String| async move {
                Ok::<_, String>(format!("resp {}", args))
            })
            .register("Foo.Slow", |millis: u64| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, String>(millis)
            })
            .register("Foo.Panic", |_: ()| async move {
                if true {
                    panic!("boom");
                }
                Ok::<_, String>(())
            })
            .register("Foo.Big", |size: usize| async move {
                Ok::<_, String>(vec![0u8; size])
            });
        router
    }

    async fn raw_client(server: Server) -> (Codec, tokio::task::JoinHandle<ServerResult<()>>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { server.serve_conn(server_io).await });
        let codec = initiate_handshake(client_io, &Options::default()).await.unwrap();
        (codec, task)
    }

    #[tokio::test]
    async fn test_bad_magic_closes_without_reply() {
        let (mut client_io, server_io) = tokio::io::duplex(4096);
        let handshake = Handshake {
            magic_number: MAGIC_NUMBER + 1,
            codec_type: CodecType::Bincode.tag().to_string(),
        };
        write_handshake(&mut client_io, &handshake).await.unwrap();

        let result = Server::new(router()).serve_conn(server_io).await;
        assert!(matches!(
            result,
            Err(ServerError::Handshake(HandshakeError::InvalidMagic(_)))
        ));

        let mut received = Vec::new();
        client_io.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_reported_in_header() {
        let (mut codec, _task) = raw_client(Server::new(router())).await;
        let args = Payload::encode(CodecType::Bincode, "req 0").unwrap();
        codec.writer.write(&Header::new("Bar.Nope", 1), &args).await.unwrap();

        let header = codec.reader.read_header().await.unwrap();
        assert_eq!(header.seq, 1);
        assert_eq!(header.error, "rpc server: can't find method Bar.Nope");
        assert!(codec.reader.read_body().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_request_does_not_block_reads() {
        let (mut codec, _task) = raw_client(Server::new(router())).await;
        let slow = Payload::encode(CodecType::Bincode, &300u64).unwrap();
        let fast = Payload::encode(CodecType::Bincode, "quick").unwrap();

        codec.writer.write(&Header::new("Foo.Slow", 1), &slow).await.unwrap();
        codec.writer.write(&Header::new("Foo.Sum", 2), &fast).await.unwrap();

        let first = codec.reader.read_header().await.unwrap();
        assert_eq!(first.seq, 2);
        let body: String = codec.reader.read_body().await.unwrap().decode().unwrap();
        assert_eq!(body, "resp quick");

        let second = codec.reader.read_header().await.unwrap();
        assert_eq!(second.seq, 1);
        codec.reader.discard_body().await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_requests_answered_after_eof() {
        let (mut codec, task) = raw_client(Server::new(router())).await;
        let slow = Payload::encode(CodecType::Bincode, &50u64).unwrap();
        for seq in 1..=3 {
            codec.writer.write(&Header::new("Foo.Slow", seq), &slow).await.unwrap();
        }
        codec.writer.close().await.unwrap();

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let header = codec.reader.read_header().await.unwrap();
            assert!(!header.is_error());
            let millis: u64 = codec.reader.read_body().await.unwrap().decode().unwrap();
            assert_eq!(millis, 50);
            seqs.push(header.seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3]);

        assert!(codec.reader.read_header().await.unwrap_err().is_closed());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error_response() {
        let (mut codec, _task) = raw_client(Server::new(router())).await;
        let args = Payload::encode(CodecType::Bincode, &()).unwrap();
        codec.writer.write(&Header::new("Foo.Panic", 9), &args).await.unwrap();

        let header = codec.reader.read_header().await.unwrap();
        assert_eq!(header.seq, 9);
        assert_eq!(header.error, "rpc server: handler for Foo.Panic panicked");
        codec.reader.discard_body().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_reply_becomes_error_response() {
        let config = ServerConfig {
            max_frame_size: 1024,
            ..Default::default()
        };
        let (mut codec, _task) = raw_client(Server::with_config(router(), config)).await;
        let args = Payload::encode(CodecType::Bincode, &4096usize).unwrap();
        codec.writer.write(&Header::new("Foo.Big", 4), &args).await.unwrap();

        let header = codec.reader.read_header().await.unwrap();
        assert!(header.error.starts_with("rpc server: reply for Foo.Big rejected"));
        assert!(codec.reader.read_body().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_header_ends_connection() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = Server::new(router());
        let task = tokio::spawn(async move { server.serve_conn(server_io).await });

        let mut client_io = client_io;
        write_handshake(&mut client_io, &Options::default().handshake()).await.unwrap();
        client_io.write_all(&[0, 0, 0, 3, 0xff, 0xff, 0xff]).await.unwrap();

        task.await.unwrap().unwrap();
        let mut received = Vec::new();
        client_io.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_accept_serves_tcp_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(router());
        tokio::spawn(async move { server.accept(listener).await });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut codec = initiate_handshake(stream, &Options::default()).await.unwrap();
        let args = Payload::encode(CodecType::Bincode, "tcp").unwrap();
        codec.writer.write(&Header::new("Foo.Sum", 1), &args).await.unwrap();

        codec.reader.read_header().await.unwrap();
        let reply: String = codec.reader.read_body().await.unwrap().decode().unwrap();
        assert_eq!(reply, "resp tcp");
    }
}
