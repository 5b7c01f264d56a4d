//! Client multiplexer: many in-flight calls over one stream connection.
//!
//! Every call is assigned a sequence number and parked in the pending table
//! until the receive loop matches its reply or the connection terminates.
//! Completion is a `oneshot` send, so each call is woken exactly once: the
//! receive path and `terminate_calls` race through table removal, and only
//! the winner holds the sender.
//!
//! Lock discipline: the state lock (pending table, sequence counter, flags)
//! is never held across I/O; the send lock serializes codec writes and is
//! acquired only after the state lock has been released.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::codec::{new_codec, CodecReader, CodecWriter, Header, WireFormat};
use crate::error::{ClientError, CodecError};
use crate::http;
use crate::options::{write_options, Options};

/// Per-call knobs. The default is a plain blocking call with no deadline,
/// no server budget, and no cancellation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Client-side deadline; on expiry the call is abandoned and removed
    /// from the pending table.
    pub timeout: Option<Duration>,
    /// Server-side handling budget carried in the request header.
    pub handle_timeout: Option<Duration>,
    /// Cooperative cancellation; observed like the deadline.
    pub cancel: Option<CancellationToken>,
}

enum CallOutcome {
    Reply(Bytes),
    Fail(ClientError),
}

struct PendingCall {
    done: oneshot::Sender<CallOutcome>,
}

struct ClientState {
    next_seq: u64,
    pending: HashMap<u64, PendingCall>,
    closing: bool,
    shutdown: bool,
}

/// Writer half plus the reused header buffer, both owned by the send lock.
struct SendState {
    writer: Box<dyn CodecWriter>,
    header: Header,
}

struct ClientInner {
    format: WireFormat,
    options: Options,
    send: tokio::sync::Mutex<SendState>,
    state: Mutex<ClientState>,
    closed: CancellationToken,
}

/// A connection to one RPC server, shared freely across tasks.
///
/// Cloning is cheap; all clones multiplex over the same stream.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Client")
            .field("pending", &state.pending.len())
            .field("closing", &state.closing)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// One outstanding call produced by [`Client::go`].
pub struct ReplyHandle {
    seq: u64,
    inner: Arc<ClientInner>,
    rx: oneshot::Receiver<CallOutcome>,
}

impl ReplyHandle {
    /// The sequence number assigned to this call.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for completion and decode the reply.
    pub async fn recv<R: DeserializeOwned>(self) -> Result<R, ClientError> {
        let ReplyHandle { inner, rx, .. } = self;
        match rx.await {
            Ok(CallOutcome::Reply(body)) => inner
                .format
                .decode(&body)
                .map_err(|err| ClientError::ReadBody {
                    message: err.to_string(),
                }),
            Ok(CallOutcome::Fail(err)) => Err(err),
            Err(_) => Err(ClientError::Shutdown),
        }
    }
}

impl Client {
    /// Hand-shake over an established stream and start the receive loop.
    ///
    /// The option preamble is written first; codec frames follow on the
    /// same stream.
    pub async fn new<S>(stream: S, options: Options) -> Result<Client, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let format = options
            .wire_format()
            .ok_or_else(|| ClientError::InvalidCodec {
                selector: options.codec_type.clone(),
            })?;
        let mut stream = stream;
        write_options(&mut stream, &options)
            .await
            .map_err(|err| ClientError::Handshake {
                message: err.to_string(),
            })?;
        let (reader, writer) = new_codec(format, stream);
        let inner = Arc::new(ClientInner {
            format,
            options,
            send: tokio::sync::Mutex::new(SendState {
                writer,
                header: Header::default(),
            }),
            state: Mutex::new(ClientState {
                next_seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            closed: CancellationToken::new(),
        });
        tokio::spawn(receive_loop(Arc::clone(&inner), reader));
        Ok(Client { inner })
    }

    /// The option snapshot this client was created with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Whether the client can still accept new calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    /// Number of calls currently awaiting replies. Diagnostic.
    pub fn pending_calls(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Close the connection. Pending calls are terminated by the receive
    /// loop; calling twice returns [`ClientError::Shutdown`].
    pub async fn close(&self) -> Result<(), ClientError> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(ClientError::Shutdown);
            }
            state.closing = true;
        }
        self.inner.closed.cancel();
        let mut send = self.inner.send.lock().await;
        send.writer
            .close()
            .await
            .map_err(|err| ClientError::Codec {
                source: Arc::new(err),
            })
    }

    /// Start a call without waiting for its reply.
    pub async fn go<A: Serialize>(
        &self,
        service_method: &str,
        args: &A,
        handle_timeout: Option<Duration>,
    ) -> Result<ReplyHandle, ClientError> {
        let body = self
            .inner
            .format
            .encode(args)
            .map_err(|err| ClientError::EncodeArgs {
                message: err.to_string(),
            })?;
        self.go_raw(service_method, Bytes::from(body), handle_timeout)
            .await
    }

    /// Blocking call with default options.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_opts(service_method, args, CallOptions::default())
            .await
    }

    /// Blocking call with explicit deadline, server budget, or cancellation.
    pub async fn call_opts<A, R>(
        &self,
        service_method: &str,
        args: &A,
        opts: CallOptions,
    ) -> Result<R, ClientError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self
            .inner
            .format
            .encode(args)
            .map_err(|err| ClientError::EncodeArgs {
                message: err.to_string(),
            })?;
        let raw = self
            .call_raw(service_method, Bytes::from(body), opts)
            .await?;
        self.inner
            .format
            .decode(&raw)
            .map_err(|err| ClientError::ReadBody {
                message: err.to_string(),
            })
    }

    /// Type-erased call used by the pooled client: args already encoded,
    /// reply returned as raw bytes.
    pub(crate) async fn call_raw(
        &self,
        service_method: &str,
        body: Bytes,
        opts: CallOptions,
    ) -> Result<Bytes, ClientError> {
        let CallOptions {
            timeout,
            handle_timeout,
            cancel,
        } = opts;
        let mut handle = self.go_raw(service_method, body, handle_timeout).await?;
        tokio::select! {
            outcome = &mut handle.rx => match outcome {
                Ok(CallOutcome::Reply(body)) => Ok(body),
                Ok(CallOutcome::Fail(err)) => Err(err),
                Err(_) => Err(ClientError::Shutdown),
            },
            _ = cancelled_or_pending(cancel.as_ref()) => {
                // Best effort: the receive loop may complete the call first,
                // in which case the late reply is simply dropped.
                remove_call(&self.inner, handle.seq);
                Err(ClientError::Canceled)
            }
            _ = sleep_or_pending(timeout) => {
                remove_call(&self.inner, handle.seq);
                Err(ClientError::CallTimeout {
                    timeout: timeout.unwrap_or_default(),
                })
            }
        }
    }

    async fn go_raw(
        &self,
        service_method: &str,
        body: Bytes,
        handle_timeout: Option<Duration>,
    ) -> Result<ReplyHandle, ClientError> {
        let (done, rx) = oneshot::channel();
        let seq = register_call(&self.inner, done)?;
        let write_result = {
            let mut send = self.inner.send.lock().await;
            let SendState { writer, header } = &mut *send;
            header.service_method.clear();
            header.service_method.push_str(service_method);
            header.seq = seq;
            header.error.clear();
            header.timeout = handle_timeout.unwrap_or(Duration::ZERO);
            writer.write(header, &body).await
        };
        if let Err(err) = write_result {
            // Remove if still present; the receive loop may have raced a
            // termination in between.
            if let Some(call) = remove_call(&self.inner, seq) {
                let _ = call.done.send(CallOutcome::Fail(ClientError::Codec {
                    source: Arc::new(err),
                }));
            }
        }
        Ok(ReplyHandle {
            seq,
            inner: Arc::clone(&self.inner),
            rx,
        })
    }
}

fn register_call(
    inner: &ClientInner,
    done: oneshot::Sender<CallOutcome>,
) -> Result<u64, ClientError> {
    let mut state = inner.state.lock();
    if state.closing || state.shutdown {
        return Err(ClientError::Shutdown);
    }
    let seq = state.next_seq;
    state.next_seq += 1;
    state.pending.insert(seq, PendingCall { done });
    Ok(seq)
}

fn remove_call(inner: &ClientInner, seq: u64) -> Option<PendingCall> {
    inner.state.lock().pending.remove(&seq)
}

/// Fail every pending call with the terminal error and refuse new
/// registrations. The send lock is taken so an in-flight write cannot
/// interleave with the fan-out.
async fn terminate_calls(inner: &Arc<ClientInner>, err: ClientError) {
    let drained: Vec<PendingCall> = {
        let mut state = inner.state.lock();
        state.shutdown = true;
        state.pending.drain().map(|(_, call)| call).collect()
    };
    let _send = inner.send.lock().await;
    for call in drained {
        let _ = call.done.send(CallOutcome::Fail(err.clone()));
    }
}

/// The long-lived receive task: match replies to pending calls by sequence
/// number until the transport dies, then terminate everything outstanding.
async fn receive_loop(inner: Arc<ClientInner>, mut reader: Box<dyn CodecReader>) {
    let err = loop {
        let header = tokio::select! {
            _ = inner.closed.cancelled() => break ClientError::Shutdown,
            header = reader.read_header() => match header {
                Ok(header) => header,
                Err(err) => {
                    if !matches!(err, CodecError::Eof) {
                        warn!(error = %err, "read header failed");
                    }
                    break ClientError::Codec { source: Arc::new(err) };
                }
            },
        };
        match remove_call(&inner, header.seq) {
            None => {
                // Call already gone (cancelled or timed out); the reply body
                // is discarded quietly.
                if let Err(err) = reader.read_body().await {
                    break ClientError::Codec {
                        source: Arc::new(err),
                    };
                }
            }
            Some(call) if !header.error.is_empty() => {
                let body = reader.read_body().await;
                let _ = call.done.send(CallOutcome::Fail(ClientError::Remote {
                    message: header.error,
                }));
                if let Err(err) = body {
                    break ClientError::Codec {
                        source: Arc::new(err),
                    };
                }
            }
            Some(call) => match reader.read_body().await {
                Ok(body) => {
                    let _ = call.done.send(CallOutcome::Reply(body));
                }
                Err(err) => {
                    // The matched call sees the failure, and so does every
                    // other pending call via termination below.
                    let err = ClientError::Codec {
                        source: Arc::new(err),
                    };
                    let _ = call.done.send(CallOutcome::Fail(err.clone()));
                    break err;
                }
            },
        }
    };
    terminate_calls(&inner, err).await;
}

/// Dial a plain TCP address (`host:port`) and handshake.
pub async fn dial(address: &str, options: Options) -> Result<Client, ClientError> {
    dial_with(address, options, Client::new).await
}

/// Dial with a custom client factory, racing `ConnectTimeout` against both
/// the TCP connect and the factory (handshake + codec init). A zero timeout
/// disables the race. Primarily a seam for tests and custom transports.
pub async fn dial_with<F, Fut>(
    address: &str,
    options: Options,
    factory: F,
) -> Result<Client, ClientError>
where
    F: FnOnce(TcpStream, Options) -> Fut,
    Fut: Future<Output = Result<Client, ClientError>>,
{
    let timeout = options.connect_timeout;
    let fut = async move {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|err| ClientError::Dial {
                message: err.to_string(),
            })?;
        factory(stream, options).await
    };
    connect_deadline(timeout, fut).await
}

/// Dial an address of the form `network@host:port`.
///
/// `tcp@` dials directly, `http@` performs the CONNECT upgrade first, and
/// `unix@` connects to a filesystem socket path.
pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Client, ClientError> {
    let (network, address) = rpc_addr
        .split_once('@')
        .ok_or_else(|| ClientError::BadAddress {
            address: rpc_addr.to_string(),
        })?;
    match network {
        "tcp" => dial(address, options).await,
        "http" => http::dial_http(address, options).await,
        #[cfg(unix)]
        "unix" => {
            let timeout = options.connect_timeout;
            let address = address.to_string();
            let fut = async move {
                let stream =
                    UnixStream::connect(&address)
                        .await
                        .map_err(|err| ClientError::Dial {
                            message: err.to_string(),
                        })?;
                Client::new(stream, options).await
            };
            connect_deadline(timeout, fut).await
        }
        _ => Err(ClientError::BadAddress {
            address: rpc_addr.to_string(),
        }),
    }
}

pub(crate) async fn connect_deadline<Fut>(
    timeout: Duration,
    fut: Fut,
) -> Result<Client, ClientError>
where
    Fut: Future<Output = Result<Client, ClientError>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::ConnectTimeout { timeout }),
    }
}

async fn cancelled_or_pending(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_timeout_is_enforced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let options = Options {
            connect_timeout: Duration::from_millis(200),
            ..Options::default()
        };
        let err = dial_with(&address, options, |_stream, _options| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Err(ClientError::Shutdown)
        })
        .await
        .expect_err("expected a timeout error");
        assert!(err.to_string().contains("connect timeout"), "{err}");
    }

    #[tokio::test]
    async fn zero_connect_timeout_disables_the_race() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let options = Options {
            connect_timeout: Duration::ZERO,
            ..Options::default()
        };
        // The sentinel error must come back unchanged: no deadline fired.
        let err = dial_with(&address, options, |_stream, _options| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Err(ClientError::Shutdown)
        })
        .await
        .expect_err("factory sentinel");
        assert!(matches!(err, ClientError::Shutdown));
    }

    // A reply is delivered at most once even if a confused peer repeats a
    // sequence number; the duplicate finds no pending call and its body is
    // discarded without disturbing the connection.
    #[tokio::test]
    async fn duplicate_replies_are_discarded() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = Client::new(client_io, Options::default())
            .await
            .expect("client");

        tokio::spawn(async move {
            let mut server_io = tokio::io::BufReader::new(server_io);
            let options = crate::options::read_options(&mut server_io)
                .await
                .expect("server read options");
            let format = options.wire_format().expect("wire format");
            let (mut reader, mut writer) = new_codec(format, server_io);
            let request = reader.read_header().await.expect("request header");
            let body = reader.read_body().await.expect("request body");
            let reply = Header {
                service_method: request.service_method.clone(),
                seq: request.seq,
                error: String::new(),
                timeout: Duration::ZERO,
            };
            writer.write(&reply, &body).await.expect("reply");
            writer.write(&reply, &body).await.expect("duplicate reply");
            // Hold the stream open so the duplicate is actually processed.
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let echoed: i64 = client.call("Echo.Echo", &41i64).await.expect("call");
        assert_eq!(echoed, 41);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.pending_calls(), 0);
        assert!(client.is_available(), "duplicate reply killed the client");
    }

    #[tokio::test]
    async fn malformed_addresses_are_rejected() {
        let err = xdial("127.0.0.1:9999", Options::default())
            .await
            .expect_err("missing network tag");
        assert!(matches!(err, ClientError::BadAddress { .. }));

        let err = xdial("carrier-pigeon@somewhere", Options::default())
            .await
            .expect_err("unsupported network");
        assert!(matches!(err, ClientError::BadAddress { .. }));
    }
}
