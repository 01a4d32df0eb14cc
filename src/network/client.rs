//! CoreRPC Client
//!
//! Multiplexes many outstanding calls over one connection:
//! - Each call gets a sequence number and waits in the pending table
//! - Request frames are written one at a time under the send lock
//! - A single background task reads responses and completes calls
//! - When that task hits a read error every pending call fails

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::connection::initiate_handshake;
use crate::protocol::{
    Codec, CodecError, CodecReader, CodecType, CodecWriter, HandshakeError, Header, Options,
    Payload,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("Call timeout")]
    Timeout,
}

impl ClientError {
    /// Whether the client refused the operation because it is shut down
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ClientError::Call(CallError::Shutdown))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Outcome of a failed call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("connection is shut down")]
    Shutdown,

    #[error("{0}")]
    Server(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("writing request: {0}")]
    Send(String),

    #[error("reading body: {0}")]
    Body(String),
}

/// Completion endpoint for a call. Must have capacity for at least one call.
pub type Done = mpsc::Sender<Call>;

/// Receiving end of a completion channel created by `Client::go`
pub type Completions = mpsc::Receiver<Call>;

/// Capacity of the completion channel `Client::go` creates when none is given
pub const DEFAULT_DONE_CAPACITY: usize = 10;

/// One outstanding invocation
#[derive(Debug)]
pub struct Call {
    /// Sequence number, zero until the call is registered
    pub seq: u64,
    pub service_method: String,
    pub args: Payload,
    reply: Option<Payload>,
    error: Option<CallError>,
    done: Done,
}

impl Call {
    fn new(service_method: &str, args: Payload, done: Done) -> Self {
        Self {
            seq: 0,
            service_method: service_method.to_string(),
            args,
            reply: None,
            error: None,
            done,
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        self.error.as_ref()
    }

    /// Raw reply, present only when the call succeeded
    pub fn reply_payload(&self) -> Option<&Payload> {
        self.reply.as_ref()
    }

    /// Decode the reply. Check this before trusting any reply value.
    pub fn reply<R: DeserializeOwned>(&self) -> ClientResult<R> {
        if let Some(error) = &self.error {
            return Err(error.clone().into());
        }
        let payload = self
            .reply
            .as_ref()
            .ok_or_else(|| CallError::Body("missing reply".to_string()))?;
        Ok(payload.decode()?)
    }

    fn fail(mut self, error: CallError) {
        self.error = Some(error);
        self.finish();
    }

    /// Hand the call to its completion endpoint without blocking the caller
    fn finish(self) {
        let done = self.done.clone();
        match done.try_send(self) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => match Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let _ = done.send(call).await;
                    });
                }
                Err(_) => {
                    tracing::warn!("rpc client: no runtime to deliver call {}", call.seq);
                }
            },
            Err(TrySendError::Closed(call)) => {
                tracing::debug!("rpc client: nobody waiting for call {}", call.seq);
            }
        }
    }
}

/// Send side state, guarded by the send lock
struct Sending {
    writer: Box<dyn CodecWriter>,
    header: Header,
}

/// Bookkeeping state, guarded by the bookkeeping lock
struct CallTable {
    seq: u64,
    pending: HashMap<u64, Call>,
    closing: bool,
    shutdown: bool,
}

struct ClientInner {
    codec_type: CodecType,
    sending: Mutex<Sending>,
    table: Mutex<CallTable>,
}

impl ClientInner {
    /// Assign a sequence number and insert the call, unless the client is shut down
    async fn register_call(&self, mut call: Call) -> Result<u64, Call> {
        let mut table = self.table.lock().await;
        if table.closing || table.shutdown {
            return Err(call);
        }
        let seq = table.seq;
        table.seq += 1;
        call.seq = seq;
        table.pending.insert(seq, call);
        Ok(seq)
    }

    async fn remove_call(&self, seq: u64) -> Option<Call> {
        self.table.lock().await.pending.remove(&seq)
    }

    /// Register and write a call. Returns its sequence number if it was registered.
    async fn send(&self, call: Call) -> Option<u64> {
        let service_method = call.service_method.clone();
        let args = call.args.clone();

        let seq = match self.register_call(call).await {
            Ok(seq) => seq,
            Err(call) => {
                call.fail(CallError::Shutdown);
                return None;
            }
        };

        let result = {
            let mut sending = self.sending.lock().await;
            let Sending { writer, header } = &mut *sending;
            header.service_method = service_method;
            header.seq = seq;
            header.error.clear();
            writer.write(header, &args).await
        };

        if let Err(e) = result {
            // The call may already have been failed by the receive loop.
            if let Some(call) = self.remove_call(seq).await {
                call.fail(CallError::Send(e.to_string()));
            }
        }
        Some(seq)
    }

    /// Read responses until the connection fails, then fail everything pending
    async fn receive(self: Arc<Self>, mut reader: Box<dyn CodecReader>) {
        let error = loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => break e,
            };

            match self.remove_call(header.seq).await {
                None => {
                    tracing::debug!("rpc client: response for unknown call {}", header.seq);
                    if let Err(e) = reader.discard_body().await {
                        break e;
                    }
                }
                Some(mut call) if header.is_error() => {
                    call.error = Some(CallError::Server(header.error));
                    let result = reader.discard_body().await;
                    call.finish();
                    if let Err(e) = result {
                        break e;
                    }
                }
                Some(mut call) => match reader.read_body().await {
                    Ok(reply) => {
                        call.reply = Some(reply);
                        call.finish();
                    }
                    Err(e) => {
                        call.fail(CallError::Body(e.to_string()));
                        break e;
                    }
                },
            }
        };

        if error.is_closed() {
            tracing::debug!("rpc client: connection closed by server");
        } else {
            tracing::warn!("rpc client: receive error: {}", error);
        }
        self.terminate_calls(error).await;
    }

    async fn terminate_calls(&self, error: CodecError) {
        let reason = error.to_string();
        let _sending = self.sending.lock().await;
        let mut table = self.table.lock().await;
        table.shutdown = true;
        for (_, call) in table.pending.drain() {
            call.fail(CallError::ConnectionLost(reason.clone()));
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for (_, call) in self.table.get_mut().pending.drain() {
            call.fail(CallError::ConnectionLost("client dropped".to_string()));
        }
    }
}

/// Aborts the receive loop when the last client handle goes away.
///
/// The loop owns the read half and a reference to the write half, so the
/// connection is released only once it stops.
struct ReceiveTask(JoinHandle<()>);

impl Drop for ReceiveTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// CoreRPC Client
///
/// Cheap to clone; all clones share one connection. Dropping the last clone
/// closes the connection and fails any calls still pending.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    _receive_task: Arc<ReceiveTask>,
}

impl Client {
    /// Connect to a server over TCP and perform the handshake
    pub async fn dial(addr: impl ToSocketAddrs, options: Option<Options>) -> ClientResult<Self> {
        let options = Options::parse(options);

        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::ConnectTimeout),
        };
        stream.set_nodelay(true)?;

        Self::new(stream, Some(options)).await
    }

    /// Perform the handshake on an established stream
    pub async fn new<S>(stream: S, options: Option<Options>) -> ClientResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = Options::parse(options);
        match initiate_handshake(stream, &options).await {
            Ok(codec) => Ok(Self::with_codec(codec)),
            Err(e) => {
                tracing::warn!("rpc client: options error: {}", e);
                Err(e.into())
            }
        }
    }

    /// Build a client over an already negotiated codec and start its receive loop
    pub fn with_codec(codec: Codec) -> Self {
        let Codec {
            codec_type,
            reader,
            writer,
        } = codec;

        let inner = Arc::new(ClientInner {
            codec_type,
            sending: Mutex::new(Sending {
                writer,
                header: Header::default(),
            }),
            table: Mutex::new(CallTable {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });

        let receiver = tokio::spawn(inner.clone().receive(reader));
        Self {
            inner,
            _receive_task: Arc::new(ReceiveTask(receiver)),
        }
    }

    pub fn codec_type(&self) -> CodecType {
        self.inner.codec_type
    }

    /// Start a call. The completed `Call` is delivered on `done` exactly once.
    ///
    /// Without `done` a channel of `DEFAULT_DONE_CAPACITY` is created and its
    /// receiving end returned. Fails without delivering anything only if the
    /// arguments cannot be encoded.
    pub async fn go<A>(
        &self,
        service_method: &str,
        args: &A,
        done: Option<Done>,
    ) -> ClientResult<Option<Completions>>
    where
        A: Serialize + ?Sized,
    {
        let (done, completions) = match done {
            Some(done) => {
                assert!(done.max_capacity() > 0, "rpc client: done channel is unbuffered");
                (done, None)
            }
            None => {
                let (done, completions) = mpsc::channel(DEFAULT_DONE_CAPACITY);
                (done, Some(completions))
            }
        };

        let args = Payload::encode(self.inner.codec_type, args)?;
        self.inner.send(Call::new(service_method, args, done)).await;
        Ok(completions)
    }

    /// Invoke a method and wait for its reply
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> ClientResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (done, mut rx) = mpsc::channel(1);
        self.go(service_method, args, Some(done)).await?;
        let call = rx.recv().await.ok_or(CallError::Shutdown)?;
        call.reply()
    }

    /// Invoke a method and wait at most `deadline` for its reply.
    ///
    /// On expiry the call is forgotten; a late response is read and dropped.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        deadline: Duration,
    ) -> ClientResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (done, mut rx) = mpsc::channel(1);
        let args = Payload::encode(self.inner.codec_type, args)?;
        let seq = self.inner.send(Call::new(service_method, args, done)).await;

        let call = match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(call) => call,
            Err(_) => {
                let abandoned = match seq {
                    Some(seq) => self.inner.remove_call(seq).await.is_some(),
                    None => false,
                };
                if abandoned {
                    return Err(ClientError::Timeout);
                }
                // Completed concurrently with the deadline; take the result.
                rx.recv().await
            }
        };

        call.ok_or(CallError::Shutdown)?.reply()
    }

    /// Close the connection.
    ///
    /// Only the write side is shut down, so requests already sent are still
    /// answered; pending calls fail once the server hangs up. A call whose
    /// handler never returns keeps its waiter blocked, so bound such calls
    /// with `call_timeout`.
    pub async fn close(&self) -> ClientResult<()> {
        {
            let mut table = self.inner.table.lock().await;
            if table.closing {
                return Err(CallError::Shutdown.into());
            }
            table.closing = true;
        }

        let mut sending = self.inner.sending.lock().await;
        sending.writer.close().await?;
        Ok(())
    }

    /// Whether the client still accepts calls
    pub async fn is_available(&self) -> bool {
        let table = self.inner.table.lock().await;
        !table.closing && !table.shutdown
    }

    /// Number of calls waiting for a response
    pub async fn pending_calls(&self) -> usize {
        self.inner.table.lock().await.pending.len()
    }
}
