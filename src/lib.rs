//! zrpc: a lightweight RPC framework over stream transports.
//!
//! The core is a bidirectional call multiplexer: a single connection carries
//! many in-flight calls, replies are matched to callers by sequence number,
//! timeouts are enforced on both ends, and a dying transport terminates every
//! outstanding call deterministically. On top of that sit a handler registry
//! dispatching by symbolic `"Service.Method"` name, pluggable endpoint
//! discovery with optional registry-driven refresh, and a pooled client with
//! a broadcast primitive.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use zrpc::{Options, Server, ServiceBuilder};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { num1: i64, num2: i64 }
//!
//! struct Arith;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = ServiceBuilder::new(Arith)
//!     .method("Sum", |_arith: Arc<Arith>, args: Args| async move {
//!         Ok::<i64, anyhow::Error>(args.num1 + args.num2)
//!     })
//!     .build()?;
//!
//! let server = Arc::new(Server::new());
//! server.register(service)?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?;
//! tokio::spawn(server.accept(listener));
//!
//! let client = zrpc::dial(&addr.to_string(), Options::default()).await?;
//! let sum: i64 = client.call("Arith.Sum", &Args { num1: 2, num2: 3 }).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Client multiplexer, dialing, and per-call options.
pub mod client;
/// Frame codec and wire formats.
pub mod codec;
/// Endpoint discovery policies.
pub mod discovery;
/// Error types for every domain.
pub mod error;
/// HTTP `CONNECT` upgrade for reusing HTTP listeners.
pub mod http;
/// Option negotiation (the handshake preamble).
pub mod options;
/// Registry endpoint and heartbeat loop.
pub mod registry;
/// Server multiplexer and request dispatch.
pub mod server;
/// Handler registry built from typed closures.
pub mod service;
/// Pooled client: unicast with discovery, broadcast with cancellation.
pub mod xclient;

pub use client::{dial, dial_with, xdial, CallOptions, Client, ReplyHandle};
pub use codec::{Header, WireFormat, JSON_SELECTOR, MAX_FRAME_SIZE, POSTCARD_SELECTOR};
pub use discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
pub use error::{ClientError, CodecError, DiscoveryError, ServerError, XCallError};
pub use http::DEFAULT_RPC_PATH;
pub use options::{Options, DEFAULT_CONNECT_TIMEOUT, MAGIC_NUMBER};
pub use registry::{heartbeat, Registry, DEFAULT_REGISTRY_PATH, DEFAULT_REGISTRY_TIMEOUT};
pub use server::Server;
pub use service::{MethodDescriptor, Service, ServiceBuilder};
pub use xclient::XClient;
