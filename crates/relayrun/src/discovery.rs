//! # Discovery
//!
//! Where an [`XClient`](crate::xclient::XClient) gets its server addresses.
//! Addresses use the `protocol@host:port` form understood by
//! [`xdial`](crate::dial::xdial).

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

use crate::registry::SERVERS_HEADER;

/// Default pause between two registry lookups.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    #[default]
    Random,
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("rpc discovery: no available servers")]
    NoServers,
    #[error("rpc registry refresh err: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Reloads the address list from its source, if it has one.
    async fn refresh(&self) -> Result<()>;

    /// Replaces the address list.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Picks one address.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// Every known address.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct Servers {
    addrs: Vec<String>,
    /// Round-robin cursor.
    index: usize,
}

/// A fixed address list, changed only through [`Discovery::update`].
pub struct MultiServerDiscovery {
    servers: Mutex<Servers>,
}

impl MultiServerDiscovery {
    /// The round-robin cursor starts at a random position so independent
    /// clients spread their load.
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..i32::MAX as usize);
        Self::with_index(servers, index)
    }

    pub fn with_index(servers: Vec<String>, index: usize) -> Self {
        Self {
            servers: Mutex::new(Servers { addrs: servers, index }),
        }
    }

    fn set(&self, servers: Vec<String>) {
        self.servers.lock().addrs = servers;
    }

    fn pick(&self, mode: SelectMode) -> Result<String> {
        let mut servers = self.servers.lock();
        let n = servers.addrs.len();
        if n == 0 {
            return Err(Error::NoServers);
        }
        match mode {
            SelectMode::Random => {
                let i = rand::thread_rng().gen_range(0..n);
                Ok(servers.addrs[i].clone())
            }
            SelectMode::RoundRobin => {
                // the list may have shrunk since the last pick
                let addr = servers.addrs[servers.index % n].clone();
                servers.index = (servers.index + 1) % n;
                Ok(addr)
            }
        }
    }

    fn all(&self) -> Vec<String> {
        self.servers.lock().addrs.clone()
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.set(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.all())
    }
}

/// Discovery backed by a registry's HTTP directory.
///
/// Lookups are rate limited: a refresh inside `interval` of the previous one
/// is a no-op.
pub struct RegistryDiscovery {
    servers: MultiServerDiscovery,
    registry: String,
    interval: Duration,
    last_update: tokio::sync::Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// A zero `interval` falls back to [`DEFAULT_REFRESH_INTERVAL`].
    pub fn new(registry: impl Into<String>, interval: Duration) -> Self {
        Self {
            servers: MultiServerDiscovery::new(Vec::new()),
            registry: registry.into(),
            interval: if interval.is_zero() { DEFAULT_REFRESH_INTERVAL } else { interval },
            last_update: tokio::sync::Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.registry.as_str())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::Registry(e.to_string()))?;

        let servers = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        Ok(parse_servers(servers))
    }
}

pub(crate) fn parse_servers(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        if let Some(at) = *last_update {
            let fresh = at
                .checked_add(self.interval)
                .is_none_or(|stale_at| stale_at > Instant::now());
            if fresh {
                return Ok(());
            }
        }

        tracing::info!(registry = %self.registry, "rpc registry: refresh servers from registry");
        let servers = self.fetch().await?;
        self.servers.set(servers);
        *last_update = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        self.servers.set(servers);
        *last_update = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        Ok(self.servers.all())
    }
}
