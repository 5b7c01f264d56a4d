//! Server multiplexer: accept connections, dispatch requests concurrently.
//!
//! One task per connection and one task per request. Requests on a
//! connection share a single codec writer behind a send lock; a reply-sent
//! latch guarantees at most one reply frame per request even when a handler
//! races its own timeout.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::codec::{new_codec, CodecReader, CodecWriter, Header, WireFormat};
use crate::error::{CodecError, ServerError};
use crate::options::{read_options, MAGIC_NUMBER};
use crate::service::{BoxedArgs, MethodDescriptor, Service};

pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn CodecWriter>>>;

/// An RPC server: a registry of services plus the per-connection serve loop.
///
/// Construct one explicitly and share it via `Arc`; there is no process-wide
/// default instance.
#[derive(Debug, Default)]
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

/// One received request, alive for the duration of a single handler task.
struct Request {
    header: Header,
    method: Arc<MethodDescriptor>,
    args: BoxedArgs,
}

enum ReadOutcome {
    /// A well-formed request ready to dispatch.
    Request(Request),
    /// The frame parsed but dispatch or argument decoding failed; reply
    /// with the error and keep the connection.
    Bad { header: Header, error: String },
    /// Clean end of stream.
    Eof,
    /// The connection is unusable.
    Fatal(CodecError),
}

impl Server {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Fails if a service with the same canonical name
    /// already exists.
    pub fn register(&self, service: Service) -> Result<(), ServerError> {
        let mut services = self.services.write();
        match services.entry(service.name().to_string()) {
            Entry::Occupied(entry) => Err(ServerError::DuplicateService {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Resolve `"Service.Method"` into a method descriptor.
    ///
    /// The two lookup failures are kind-distinct so callers can tell an
    /// unknown service from an unknown method.
    pub fn find_service(
        &self,
        service_method: &str,
    ) -> Result<Arc<MethodDescriptor>, ServerError> {
        let (service_name, method_name) = service_method.split_once('.').ok_or_else(|| {
            ServerError::InvalidServiceMethod {
                name: service_method.to_string(),
            }
        })?;
        if method_name.contains('.') {
            return Err(ServerError::InvalidServiceMethod {
                name: service_method.to_string(),
            });
        }
        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| ServerError::ServiceNotFound {
                service: service_name.to_string(),
            })?;
        service
            .method_arc(method_name)
            .ok_or_else(|| ServerError::MethodNotFound {
                method: method_name.to_string(),
            })
    }

    /// Accept connections until the listener fails. Each accepted stream is
    /// serviced on its own task; a listener error ends the accept loop but
    /// not connections already being served.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    tokio::spawn(Arc::clone(&self).serve_stream(stream));
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    /// Serve one connection: option handshake, magic check, codec
    /// selection, then the request loop. Handshake failures close the
    /// stream after a log line.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut stream = BufReader::new(stream);
        let options = match read_options(&mut stream).await {
            Ok(options) => options,
            Err(err) => {
                warn!(error = %err, "option exchange failed");
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            warn!(magic = options.magic_number, "invalid magic number");
            return;
        }
        let Some(format) = options.wire_format() else {
            warn!(codec = %options.codec_type, "invalid codec type");
            return;
        };
        let (reader, writer) = new_codec(format, stream);
        self.serve_codec(reader, writer, format).await;
    }

    /// The per-connection request loop. Well-formed requests are handled
    /// concurrently; the codec is closed only after every outstanding
    /// handler task has finished.
    pub async fn serve_codec(
        self: Arc<Self>,
        mut reader: Box<dyn CodecReader>,
        writer: Box<dyn CodecWriter>,
        format: WireFormat,
    ) {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let tracker = TaskTracker::new();
        loop {
            match self.read_request(reader.as_mut(), format).await {
                ReadOutcome::Request(request) => {
                    tracker.spawn(handle_request(Arc::clone(&writer), format, request));
                }
                ReadOutcome::Bad { mut header, error } => {
                    header.error = error;
                    let replied = AtomicBool::new(false);
                    send_response(&writer, &header, &[], &replied).await;
                }
                ReadOutcome::Eof => break,
                ReadOutcome::Fatal(err) => {
                    warn!(error = %err, "read request failed");
                    break;
                }
            }
        }
        tracker.close();
        tracker.wait().await;
        let close_result = writer.lock().await.close().await;
        if let Err(err) = close_result {
            debug!(error = %err, "close codec failed");
        }
    }

    async fn read_request(&self, reader: &mut dyn CodecReader, format: WireFormat) -> ReadOutcome {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(CodecError::Eof) => return ReadOutcome::Eof,
            Err(err) => return ReadOutcome::Fatal(err),
        };
        // The body frame is consumed unconditionally so a dispatch failure
        // leaves the stream aligned on the next header.
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(err) => return ReadOutcome::Fatal(err),
        };
        let method = match self.find_service(&header.service_method) {
            Ok(method) => method,
            Err(err) => {
                return ReadOutcome::Bad {
                    header,
                    error: err.to_string(),
                }
            }
        };
        let args = match method.decode_args(format, &body) {
            Ok(args) => args,
            Err(err) => {
                let error = ServerError::DecodeArgs {
                    message: err.to_string(),
                }
                .to_string();
                return ReadOutcome::Bad { header, error };
            }
        };
        ReadOutcome::Request(Request {
            header,
            method,
            args,
        })
    }
}

/// Per-request state machine: Dispatched, then Called or Timeout, then Sent.
///
/// The handler runs on an inner task. With no budget in the header we wait
/// for it to finish and send its reply. With a budget we race the clock
/// against handler completion; on expiry an error reply goes out
/// immediately. The inner task is not cancelled, so its eventual send must
/// lose the latch instead of producing a second frame.
async fn handle_request(writer: SharedWriter, format: WireFormat, request: Request) {
    let Request {
        mut header,
        method,
        args,
    } = request;
    let timeout = header.timeout;
    let replied = Arc::new(AtomicBool::new(false));
    let (called_tx, called_rx) = tokio::sync::oneshot::channel::<()>();

    let inner = tokio::spawn({
        let writer = Arc::clone(&writer);
        let replied = Arc::clone(&replied);
        let mut header = header.clone();
        async move {
            let result = method.invoke(args, format).await;
            let _ = called_tx.send(());
            match result {
                Ok(body) => send_response(&writer, &header, &body, &replied).await,
                Err(message) => {
                    header.error = message;
                    send_response(&writer, &header, &[], &replied).await;
                }
            }
        }
    });

    if timeout.is_zero() {
        let _ = inner.await;
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            header.error =
                format!("rpc server: handle request timeout: expect within {timeout:?}");
            send_response(&writer, &header, &[], &replied).await;
        }
        _ = called_rx => {
            let _ = inner.await;
        }
    }
}

/// Write one reply frame under the connection's send lock. The latch is
/// flipped while the lock is held, so a timeout reply and a late handler
/// reply can never both reach the stream.
async fn send_response(writer: &SharedWriter, header: &Header, body: &[u8], replied: &AtomicBool) {
    let mut writer = writer.lock().await;
    if replied.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Err(err) = writer.write(header, body).await {
        error!(error = %err, "write response failed");
    }
}
