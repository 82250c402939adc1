//! # Registry
//!
//! A small HTTP address directory. Servers post heartbeats; clients list the
//! servers that heartbeat recently.
//!
//! ```text
//! GET  <path>                          -> 200, X-RPC-Servers: a,b,c
//! POST <path>  X-RPC-Server: <addr>    -> 200
//! POST <path>  (no X-RPC-Server)       -> 500
//! anything else                        -> 405
//! ```
//!
//! ## Invariants
//! - An entry is alive while `last_heartbeat + timeout > now`. A zero
//!   timeout, or one too large to add to the clock, keeps entries forever.
//! - Listing evicts the stale entries it finds and returns the rest sorted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::any;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_REGISTRY_PATH: &str = "/_rpc_/registry";
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Response header carrying the comma-joined alive list.
pub const SERVERS_HEADER: &str = "X-RPC-Servers";
/// Request header carrying the heartbeating server's address.
pub const SERVER_HEADER: &str = "X-RPC-Server";

/// Heartbeats go out this long before the registry would expire the sender.
const HEARTBEAT_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("rpc server: heart beat err: {0}")]
    Heartbeat(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub timeout: Duration,
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REGISTRY_TIMEOUT,
            path: DEFAULT_REGISTRY_PATH.to_string(),
        }
    }
}

pub struct Registry {
    config: RegistryConfig,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Adds `addr`, or refreshes its heartbeat.
    pub fn put_server(&self, addr: &str) {
        self.servers.lock().insert(addr.to_string(), Instant::now());
    }

    /// Sorted addresses still inside the timeout. Evicts the rest.
    pub fn alive_servers(&self) -> Vec<String> {
        let timeout = self.config.timeout;
        let now = Instant::now();
        let mut servers = self.servers.lock();
        if !timeout.is_zero() {
            servers.retain(|addr, last| {
                // a deadline past the clock's range never expires
                let alive = last.checked_add(timeout).is_none_or(|deadline| deadline > now);
                if !alive {
                    tracing::info!(%addr, "rpc registry: evicting stale server");
                }
                alive
            });
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// The directory as an axum router mounted at the configured path.
    pub fn router(self: Arc<Self>) -> Router {
        let path = self.config.path.clone();
        Router::new().route(&path, any(handle)).with_state(self)
    }

    /// Serves the directory on `listener` until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, path = %self.config.path, "rpc registry: serving");
        }
        axum::serve(listener, self.router()).await
    }
}

async fn handle(State(registry): State<Arc<Registry>>, method: Method, headers: HeaderMap) -> Response {
    match method {
        Method::GET => {
            let alive = registry.alive_servers().join(",");
            (StatusCode::OK, [(SERVERS_HEADER, alive)]).into_response()
        }
        Method::POST => {
            let addr = headers
                .get(SERVER_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .unwrap_or_default();
            if addr.is_empty() {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            tracing::debug!(%addr, "rpc registry: heartbeat");
            registry.put_server(addr);
            StatusCode::OK.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Posts one heartbeat for `addr` to the registry at `registry_url`.
pub async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    tracing::debug!(%addr, registry = %registry_url, "rpc server: send heart beat");
    http.post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| Error::Heartbeat(e.to_string()))?;
    Ok(())
}

/// Keeps `addr` alive in the registry: one heartbeat now, then one every
/// `period`. A zero `period` picks one comfortably inside
/// [`DEFAULT_REGISTRY_TIMEOUT`].
///
/// Failed heartbeats are logged and retried on the next tick. Abort the
/// returned handle to stop.
pub fn heartbeat(registry_url: impl Into<String>, addr: impl Into<String>, period: Duration) -> JoinHandle<()> {
    let registry_url = registry_url.into();
    let addr = addr.into();
    let period = if period.is_zero() {
        DEFAULT_REGISTRY_TIMEOUT - HEARTBEAT_MARGIN
    } else {
        period
    };

    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&http, &registry_url, &addr).await {
                tracing::warn!("{}", e);
            }
        }
    })
}
