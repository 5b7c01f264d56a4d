//! Frame codec: header/body pairs over a byte stream.
//!
//! Every frame on a connection is a `Header` followed by an opaque body,
//! each length-prefixed with a little-endian `u32`. The header and body are
//! encoded in the wire format negotiated during the option handshake; typed
//! decoding of bodies happens above this layer so replies can be discarded
//! without knowing their type.
//!
//! Frame sizes are bounded by [`MAX_FRAME_SIZE`] to keep a misbehaving peer
//! from forcing unbounded allocations.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;

/// Upper bound on a single header or body frame (1 MiB).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Codec selector for the default binary wire format.
pub const POSTCARD_SELECTOR: &str = "application/postcard";

/// Codec selector for the JSON wire format.
pub const JSON_SELECTOR: &str = "application/json";

/// Frame header carried on every request and reply.
///
/// On replies `service_method` is echoed back and `error` is populated on
/// failure. `timeout` is the server-side handling budget; zero means no
/// limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Symbolic `"Service.Method"` name.
    pub service_method: String,
    /// Sequence number assigned by the client.
    pub seq: u64,
    /// Error string; empty means success.
    pub error: String,
    /// Server-side handling budget; zero disables the limit.
    pub timeout: Duration,
}

/// Wire format selected by the option handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Compact binary encoding via `postcard`. The default.
    Postcard,
    /// JSON encoding, mostly useful for debugging with generic tooling.
    Json,
}

impl WireFormat {
    /// Look up a wire format by its selector string.
    pub fn from_selector(selector: &str) -> Option<WireFormat> {
        match selector {
            POSTCARD_SELECTOR => Some(WireFormat::Postcard),
            JSON_SELECTOR => Some(WireFormat::Json),
            _ => None,
        }
    }

    /// The selector string carried in the option handshake.
    pub fn selector(self) -> &'static str {
        match self {
            WireFormat::Postcard => POSTCARD_SELECTOR,
            WireFormat::Json => JSON_SELECTOR,
        }
    }

    /// Serialize a value in this format.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            WireFormat::Postcard => postcard::to_stdvec(value).map_err(|err| CodecError::Encode {
                message: err.to_string(),
            }),
            WireFormat::Json => serde_json::to_vec(value).map_err(|err| CodecError::Encode {
                message: err.to_string(),
            }),
        }
    }

    /// Deserialize a value in this format.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            WireFormat::Postcard => postcard::from_bytes(bytes).map_err(|err| CodecError::Decode {
                message: err.to_string(),
            }),
            WireFormat::Json => serde_json::from_slice(bytes).map_err(|err| CodecError::Decode {
                message: err.to_string(),
            }),
        }
    }
}

/// Read side of a connection codec.
///
/// `read_header` and `read_body` must be called in strict pairs per frame;
/// the body must be consumed (even if discarded) before the next header.
#[async_trait]
pub trait CodecReader: Send {
    /// Decode the next frame header. Fails with [`CodecError::Eof`] on a
    /// clean end of stream.
    async fn read_header(&mut self) -> Result<Header, CodecError>;

    /// Read the raw body bytes of the current frame. Dropping the returned
    /// bytes discards the body.
    async fn read_body(&mut self) -> Result<Bytes, CodecError>;
}

/// Write side of a connection codec.
///
/// `write` is not internally synchronized; callers serialize frames through
/// their own send lock.
#[async_trait]
pub trait CodecWriter: Send {
    /// Frame header and body atomically onto the stream.
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), CodecError>;

    /// Flush and release the transport.
    async fn close(&mut self) -> Result<(), CodecError>;
}

/// Length-prefixed frame reader over any byte stream.
pub struct FramedReader<R> {
    format: WireFormat,
    io: R,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    /// Wrap a read half in the given wire format.
    pub fn new(format: WireFormat, io: R) -> Self {
        Self { format, io }
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self
                .io
                .read(&mut len_buf[filled..])
                .await
                .map_err(|source| CodecError::Read { source })?;
            if n == 0 {
                // EOF exactly at a frame boundary is a clean shutdown.
                return Err(if filled == 0 {
                    CodecError::Eof
                } else {
                    CodecError::TruncatedFrame
                });
            }
            filled += n;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut frame = vec![0u8; len as usize];
        self.io.read_exact(&mut frame).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::UnexpectedEof {
                CodecError::TruncatedFrame
            } else {
                CodecError::Read { source }
            }
        })?;
        Ok(frame)
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> CodecReader for FramedReader<R> {
    async fn read_header(&mut self) -> Result<Header, CodecError> {
        let frame = self.read_frame().await?;
        match self.format.decode::<Header>(&frame) {
            Ok(header) => Ok(header),
            Err(CodecError::Decode { message }) => Err(CodecError::DecodeHeader { message }),
            Err(other) => Err(other),
        }
    }

    async fn read_body(&mut self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(self.read_frame().await?))
    }
}

/// Length-prefixed frame writer over any byte stream.
///
/// Header and body are staged into one buffer so a frame hits the stream in
/// a single write.
pub struct FramedWriter<W> {
    format: WireFormat,
    io: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    /// Wrap a write half in the given wire format.
    pub fn new(format: WireFormat, io: W) -> Self {
        Self {
            format,
            io,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> CodecWriter for FramedWriter<W> {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), CodecError> {
        let head = self.format.encode(header)?;
        if body.len() > MAX_FRAME_SIZE as usize {
            return Err(CodecError::FrameTooLarge {
                len: body.len() as u32,
                max: MAX_FRAME_SIZE,
            });
        }
        self.buf.clear();
        self.buf.extend_from_slice(&(head.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&head);
        self.buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(body);
        self.io
            .write_all(&self.buf)
            .await
            .map_err(|source| CodecError::Write { source })?;
        self.io
            .flush()
            .await
            .map_err(|source| CodecError::Write { source })
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.io
            .shutdown()
            .await
            .map_err(|source| CodecError::Write { source })
    }
}

/// Split a stream and wrap both halves in the given wire format.
pub fn new_codec<S>(format: WireFormat, stream: S) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        Box::new(FramedReader::new(format, read_half)),
        Box::new(FramedWriter::new(format, write_half)),
    )
}
