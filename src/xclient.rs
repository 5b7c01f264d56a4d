//! Pooled client: discovery-driven unicast and broadcast over a connection
//! cache.
//!
//! One [`Client`] is kept per address, dialed lazily and evicted the moment
//! it stops being available. `broadcast` fans a call out to every known
//! address; the first failure cancels the remaining sub-calls through a
//! child cancellation token, and the first success supplies the reply.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::client::{xdial, CallOptions, Client};
use crate::codec::WireFormat;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{ClientError, XCallError};
use crate::options::Options;

/// A client over many servers: selects per call, caches connections,
/// broadcasts with first-error cancellation.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    options: Options,
    format: WireFormat,
    clients: tokio::sync::Mutex<HashMap<String, Client>>,
}

struct BroadcastOutcome<R> {
    first_error: Option<XCallError>,
    reply: Option<R>,
    reply_done: bool,
}

impl<D: Discovery> XClient<D> {
    /// Create a pooled client. Fails if the options name an unknown codec.
    pub fn new(discovery: D, mode: SelectMode, options: Options) -> Result<Self, ClientError> {
        let format = options
            .wire_format()
            .ok_or_else(|| ClientError::InvalidCodec {
                selector: options.codec_type.clone(),
            })?;
        Ok(Self {
            discovery,
            mode,
            options,
            format,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// The discovery source, e.g. to push an updated server list.
    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Close and drop every cached client.
    pub async fn close(&self) {
        let drained: Vec<Client> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in drained {
            let _ = client.close().await;
        }
    }

    /// Cache lookup with lazy eviction: an entry that is no longer
    /// available is closed and replaced by a fresh dial.
    ///
    /// The pool lock is held only for map access, never across the dial, so
    /// sub-calls to different addresses connect in parallel.
    async fn cached_dial(&self, rpc_addr: &str) -> Result<Client, ClientError> {
        // Fast path: reuse a live cached connection.
        let stale = {
            let mut clients = self.clients.lock().await;
            match clients.get(rpc_addr) {
                Some(client) if client.is_available() => return Ok(client.clone()),
                Some(_) => clients.remove(rpc_addr),
                None => None,
            }
        };
        if let Some(stale) = stale {
            let _ = stale.close().await;
        }

        // Slow path: dial with no lock held, then re-lock only to insert.
        let client = xdial(rpc_addr, self.options.clone()).await?;
        let raced = {
            let mut clients = self.clients.lock().await;
            match clients.get(rpc_addr) {
                // A concurrent dial to the same address won the insert while
                // we were connecting; keep its entry.
                Some(winner) if winner.is_available() => Some(winner.clone()),
                _ => {
                    clients.insert(rpc_addr.to_string(), client.clone());
                    None
                }
            }
        };
        match raced {
            Some(winner) => {
                let _ = client.close().await;
                Ok(winner)
            }
            None => Ok(client),
        }
    }

    /// Unicast call: one discovery pick, then one call through the cached
    /// client for that address.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, XCallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_opts(service_method, args, CallOptions::default())
            .await
    }

    /// Unicast call with explicit per-call options.
    pub async fn call_opts<A, R>(
        &self,
        service_method: &str,
        args: &A,
        opts: CallOptions,
    ) -> Result<R, XCallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        let client = self.cached_dial(&rpc_addr).await?;
        Ok(client.call_opts(service_method, args, opts).await?)
    }

    /// Fan the call out to every address from `get_all`, concurrently.
    ///
    /// A cancellation token is mandatory; all sub-calls run under a child
    /// of it. The first error wins and cancels the rest; the first
    /// successful reply is kept (later ones are discarded). `Ok(None)`
    /// means there was nothing to call or no sub-call succeeded before the
    /// set was exhausted without errors.
    pub async fn broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Result<Option<R>, XCallError>
    where
        A: Serialize,
        R: DeserializeOwned + Send,
    {
        let servers = self.discovery.get_all().await?;
        let body = Bytes::from(self.format.encode(args).map_err(|err| {
            ClientError::EncodeArgs {
                message: err.to_string(),
            }
        })?);
        let child = cancel.child_token();
        let outcome = Mutex::new(BroadcastOutcome::<R> {
            first_error: None,
            reply: None,
            reply_done: false,
        });

        let sub_calls = servers.iter().map(|rpc_addr| {
            let child = child.clone();
            let body = body.clone();
            let outcome = &outcome;
            async move {
                let result = async {
                    let client = self.cached_dial(rpc_addr).await?;
                    let opts = CallOptions {
                        cancel: Some(child.clone()),
                        ..CallOptions::default()
                    };
                    client.call_raw(service_method, body, opts).await
                }
                .await;
                let mut outcome = outcome.lock();
                match result {
                    Err(err) => {
                        if outcome.first_error.is_none() {
                            outcome.first_error = Some(err.into());
                            child.cancel();
                        }
                    }
                    Ok(raw) => {
                        if !outcome.reply_done {
                            match self.format.decode::<R>(&raw) {
                                Ok(reply) => {
                                    outcome.reply = Some(reply);
                                    outcome.reply_done = true;
                                }
                                Err(err) => {
                                    if outcome.first_error.is_none() {
                                        outcome.first_error =
                                            Some(XCallError::from(ClientError::ReadBody {
                                                message: err.to_string(),
                                            }));
                                        child.cancel();
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
        futures::future::join_all(sub_calls).await;
        child.cancel();

        let outcome = outcome.into_inner();
        match outcome.first_error {
            Some(err) => Err(err),
            None => Ok(outcome.reply),
        }
    }
}
