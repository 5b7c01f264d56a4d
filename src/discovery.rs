//! Endpoint discovery: a policy object producing server addresses.
//!
//! Addresses use the `network@host:port` form understood by
//! [`crate::client::xdial`]. [`MultiServerDiscovery`] works from a list
//! handed to it; [`RegistryDiscovery`] layers TTL-gated refresh from a
//! registry endpoint on top.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::DiscoveryError;
use crate::registry::SERVERS_HEADER;

/// How [`Discovery::get`] picks one address from the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random selection.
    Random,
    /// Cyclic selection from a randomized starting point.
    RoundRobin,
}

/// Source of server addresses for the pooled client.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-pull the list from its source, if there is one.
    async fn refresh(&self) -> Result<(), DiscoveryError>;

    /// Replace the list.
    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError>;

    /// Pick one address according to the select mode.
    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError>;

    /// Snapshot copy of the full list.
    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError>;
}

struct SelectState {
    servers: Vec<String>,
    cursor: usize,
    rng: StdRng,
}

/// Discovery over a caller-maintained address list.
///
/// Selection state lives behind one lock, so an `update` is atomic with
/// respect to any concurrent `get`/`get_all`. The round-robin cursor starts
/// at a random offset and the list length is re-read on every call, so a
/// mid-flight `update` can shrink or grow the list safely.
pub struct MultiServerDiscovery {
    state: RwLock<SelectState>,
}

impl MultiServerDiscovery {
    /// Create discovery over a fixed initial list.
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        let cursor = rng.gen_range(0..usize::MAX / 2);
        Self {
            state: RwLock::new(SelectState {
                servers,
                cursor,
                rng,
            }),
        }
    }

    pub(crate) fn pick(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        let mut state = self.state.write();
        let n = state.servers.len();
        if n == 0 {
            return Err(DiscoveryError::NoServers);
        }
        match mode {
            SelectMode::Random => {
                let i = state.rng.gen_range(0..n);
                Ok(state.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                let picked = state.servers[state.cursor % n].clone();
                state.cursor = (state.cursor + 1) % n;
                Ok(picked)
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.state.read().servers.clone()
    }

    pub(crate) fn replace(&self, servers: Vec<String>) {
        self.state.write().servers = servers;
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        self.replace(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        self.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.snapshot())
    }
}

/// Default refresh TTL for registry-backed discovery.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by a registry endpoint.
///
/// `get` and `get_all` refresh first; refresh is a no-op while the last
/// pull is younger than the TTL. The registry advertises addresses in a
/// comma-separated `X-Zrpc-Servers` response header.
pub struct RegistryDiscovery {
    servers: MultiServerDiscovery,
    registry: String,
    timeout: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// Create discovery against a registry URL. `timeout` defaults to
    /// [`DEFAULT_UPDATE_TIMEOUT`].
    pub fn new(registry_url: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            servers: MultiServerDiscovery::new(Vec::new()),
            registry: registry_url.into(),
            timeout: timeout.unwrap_or(DEFAULT_UPDATE_TIMEOUT),
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    fn fresh(&self) -> bool {
        matches!(*self.last_update.lock(), Some(at) if at.elapsed() < self.timeout)
    }

    fn stamp(&self) {
        *self.last_update.lock() = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        if self.fresh() {
            return Ok(());
        }
        debug!(registry = %self.registry, "refreshing servers from registry");
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|err| DiscoveryError::Refresh {
                message: err.to_string(),
            })?;
        let raw = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let servers = raw
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(String::from)
            .collect();
        self.servers.replace(servers);
        self.stamp();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        self.servers.replace(servers);
        self.stamp();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        self.refresh().await?;
        self.servers.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        self.refresh().await?;
        Ok(self.servers.snapshot())
    }
}
