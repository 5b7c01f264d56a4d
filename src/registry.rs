//! Registry: an HTTP endpoint advertising live servers, plus the heartbeat
//! loop servers use to stay listed.
//!
//! The protocol is two headers on one path. A `GET` answers with the
//! comma-separated alive list in `X-Zrpc-Servers`; a `POST` carrying
//! `X-Zrpc-Server` refreshes (or adds) that server's keepalive timestamp.
//! Entries older than the keepalive window are evicted lazily on the next
//! listing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Path the registry endpoint is served under.
pub const DEFAULT_REGISTRY_PATH: &str = "/_zrpc_/registry";

/// Default keepalive window for registered servers.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Response header listing alive servers, comma-separated
/// (`X-Zrpc-Servers` on the wire).
pub const SERVERS_HEADER: &str = "x-zrpc-servers";

/// Request header naming the server a heartbeat is for
/// (`X-Zrpc-Server` on the wire).
pub const SERVER_HEADER: &str = "x-zrpc-server";

/// Server map with keepalive-based eviction.
///
/// Construct explicitly and share via `Arc`; there is no process-wide
/// default instance.
#[derive(Debug)]
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// Create a registry with the given keepalive window. A zero window
    /// disables eviction.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn put_server(&self, addr: &str) {
        self.servers
            .lock()
            .insert(addr.to_string(), Instant::now());
    }

    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock();
        let now = Instant::now();
        if !self.timeout.is_zero() {
            servers.retain(|_, started| *started + self.timeout > now);
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// The axum router serving [`DEFAULT_REGISTRY_PATH`].
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                DEFAULT_REGISTRY_PATH,
                get(list_servers).post(receive_heartbeat),
            )
            .with_state(self)
    }

    /// Serve the registry on the given listener until it fails.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let joined = registry.alive_servers().join(",");
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&joined) {
        Ok(value) => {
            headers.insert(SERVERS_HEADER, value);
        }
        Err(err) => {
            warn!(error = %err, "server list not header-encodable");
        }
    }
    (headers, "")
}

async fn receive_heartbeat(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    let addr = headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|addr| !addr.is_empty());
    match addr {
        Some(addr) => {
            info!(%addr, "received heartbeat");
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Keep `addr` registered by POSTing to the registry on a fixed period.
///
/// The first beat is sent immediately. The loop stops on the first send
/// failure. `period` defaults to the registry keepalive window minus one
/// minute.
pub fn heartbeat(
    registry_url: impl Into<String>,
    addr: impl Into<String>,
    period: Option<Duration>,
) -> tokio::task::JoinHandle<()> {
    let registry_url = registry_url.into();
    let addr = addr.into();
    let period = period.unwrap_or(DEFAULT_REGISTRY_TIMEOUT - Duration::from_secs(60));
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&http, &registry_url, &addr).await {
                warn!(error = %err, %addr, "heartbeat failed");
                return;
            }
            debug!(%addr, registry = %registry_url, "sent heartbeat");
        }
    })
}

async fn send_heartbeat(
    http: &reqwest::Client,
    registry_url: &str,
    addr: &str,
) -> Result<(), reqwest::Error> {
    http.post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await?;
    Ok(())
}
