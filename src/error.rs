//! Error types for the RPC core.
//!
//! Each domain gets its own enum so callers can match on the failure kind.
//! Everything that crosses the wire travels as a plain string in
//! `Header.error`; the display strings below are therefore part of the
//! protocol surface and must stay stable.

use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;

/// Errors from frame encoding, decoding, and transport I/O.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// Clean end of stream at a frame boundary.
    ///
    /// Distinguishable from a protocol error so connection teardown can be
    /// logged quietly.
    #[snafu(display("end of stream"))]
    Eof,

    /// The stream closed in the middle of a frame.
    #[snafu(display("stream closed mid-frame"))]
    TruncatedFrame,

    /// A frame announced a length above the fixed limit.
    #[snafu(display("frame of {len} bytes exceeds limit of {max} bytes"))]
    FrameTooLarge {
        /// Announced frame length.
        len: u32,
        /// The fixed frame size limit.
        max: u32,
    },

    /// Reading from the underlying stream failed.
    #[snafu(display("failed to read frame: {source}"))]
    Read {
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Writing to the underlying stream failed.
    #[snafu(display("failed to write frame: {source}"))]
    Write {
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A header frame did not parse in the negotiated wire format.
    #[snafu(display("failed to decode header: {message}"))]
    DecodeHeader {
        /// Error message from the wire format.
        message: String,
    },

    /// A value failed to serialize in the negotiated wire format.
    #[snafu(display("failed to encode value: {message}"))]
    Encode {
        /// Error message from the wire format.
        message: String,
    },

    /// A body failed to deserialize in the negotiated wire format.
    #[snafu(display("failed to decode value: {message}"))]
    Decode {
        /// Error message from the wire format.
        message: String,
    },
}

/// Errors surfaced on the client side of a connection.
///
/// `Clone` so that one transport failure can be fanned out to every pending
/// call when the connection terminates.
#[derive(Debug, Clone, Snafu)]
pub enum ClientError {
    /// Operation attempted on a client that is closing or has shut down.
    #[snafu(display("connection has shut down"))]
    Shutdown,

    /// The connection's codec failed; all pending calls are terminated.
    #[snafu(display("rpc client: codec failed: {source}"))]
    Codec {
        /// The codec failure shared by every terminated call.
        source: Arc<CodecError>,
    },

    /// The server replied with an error. The message is the server's
    /// `Header.error` verbatim.
    #[snafu(display("{message}"))]
    Remote {
        /// Error string from the reply header.
        message: String,
    },

    /// A reply body arrived but did not decode into the caller's type.
    #[snafu(display("reading body: {message}"))]
    ReadBody {
        /// Error message from the wire format.
        message: String,
    },

    /// The argument value failed to serialize.
    #[snafu(display("rpc client: encode args failed: {message}"))]
    EncodeArgs {
        /// Error message from the wire format.
        message: String,
    },

    /// Dial or handshake did not finish within the connect budget.
    #[snafu(display("rpc client: connect timeout: expect within {timeout:?}"))]
    ConnectTimeout {
        /// The configured connect budget.
        timeout: Duration,
    },

    /// The call did not complete within the caller's deadline.
    #[snafu(display("rpc client: call failed: timeout after {timeout:?}"))]
    CallTimeout {
        /// The caller's deadline.
        timeout: Duration,
    },

    /// The call was cancelled through its cancellation token.
    #[snafu(display("rpc client: call failed: context canceled"))]
    Canceled,

    /// The codec selector in the options is not registered.
    #[snafu(display("rpc client: invalid codec type {selector}"))]
    InvalidCodec {
        /// The rejected selector string.
        selector: String,
    },

    /// Writing the option preamble failed.
    #[snafu(display("rpc client: option exchange failed: {message}"))]
    Handshake {
        /// The underlying failure, stringified.
        message: String,
    },

    /// Establishing the underlying stream failed.
    #[snafu(display("rpc client: dial failed: {message}"))]
    Dial {
        /// The underlying failure, stringified.
        message: String,
    },

    /// An address did not match `network@host:port` or named an
    /// unsupported network.
    #[snafu(display("rpc client: malformed server address {address}"))]
    BadAddress {
        /// The rejected address.
        address: String,
    },

    /// The HTTP `CONNECT` upgrade was refused or malformed.
    #[snafu(display("rpc client: HTTP CONNECT failed: {message}"))]
    HttpConnect {
        /// What went wrong during the upgrade exchange.
        message: String,
    },
}

/// Errors from service registration and request dispatch.
#[derive(Debug, Snafu)]
pub enum ServerError {
    /// A service with the same canonical name is already registered.
    #[snafu(display("rpc server: service already exists: {name}"))]
    DuplicateService {
        /// The duplicated service name.
        name: String,
    },

    /// The canonical service name is not a plain uppercase-initial
    /// identifier.
    #[snafu(display("rpc server: invalid service name: {name}"))]
    InvalidServiceName {
        /// The rejected name.
        name: String,
    },

    /// The request named something other than `Service.Method`.
    #[snafu(display("rpc server: invalid name, should be service.method: {name}"))]
    InvalidServiceMethod {
        /// The malformed service-method string.
        name: String,
    },

    /// No service registered under the requested name.
    #[snafu(display("rpc server: can not find service {service}"))]
    ServiceNotFound {
        /// The unknown service name.
        service: String,
    },

    /// The service exists but has no such method.
    #[snafu(display("rpc server: can not find method {method}"))]
    MethodNotFound {
        /// The unknown method name.
        method: String,
    },

    /// The request body did not decode into the method's argument type.
    #[snafu(display("rpc server: read argument failed: {message}"))]
    DecodeArgs {
        /// Error message from the wire format.
        message: String,
    },
}

/// Errors from endpoint discovery.
#[derive(Debug, Snafu)]
pub enum DiscoveryError {
    /// The server list is empty.
    #[snafu(display("rpc discovery: no available servers"))]
    NoServers,

    /// Pulling the server list from the registry failed.
    #[snafu(display("rpc registry: refresh failed: {message}"))]
    Refresh {
        /// The underlying HTTP failure, stringified.
        message: String,
    },
}

/// Errors from the pooled client, which composes discovery and per-address
/// clients.
#[derive(Debug, Snafu)]
pub enum XCallError {
    /// A unicast call or broadcast sub-call failed.
    #[snafu(display("{source}"), context(false))]
    Call {
        /// The client-side failure.
        source: ClientError,
    },

    /// Selecting or listing endpoints failed.
    #[snafu(display("{source}"), context(false))]
    Discovery {
        /// The discovery failure.
        source: DiscoveryError,
    },
}
