//! # Multi-Server Client
//!
//! Spreads calls over the addresses a [`Discovery`] yields, keeping one
//! cached [`Client`] per address.
//!
//! ## Invariants
//! - A cached client is reused only while it is available; a dead one is
//!   closed and evicted before dialing again.
//! - `call` makes exactly one attempt. Retrying elsewhere is up to the caller.
//! - `broadcast` waits for every leg before returning, even after the first
//!   error has cancelled the rest.

use std::collections::HashMap;
use std::sync::Arc;

use relaywire::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client;
use crate::client::Client;
use crate::dial::xdial;
use crate::discovery;
use crate::discovery::Discovery;
use crate::discovery::SelectMode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Discovery(#[from] discovery::Error),
    #[error(transparent)]
    Client(#[from] client::Error),
    #[error("rpc xclient: broadcast leg failed: {0}")]
    Leg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

struct Inner {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    opt: Options,
    clients: tokio::sync::Mutex<HashMap<String, Client>>,
}

/// Cheap to clone; clones share the client cache.
#[derive(Clone)]
pub struct XClient {
    inner: Arc<Inner>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, opt: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                discovery,
                mode,
                opt,
                clients: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Closes and forgets every cached client.
    pub async fn close(&self) {
        let clients: Vec<_> = self.inner.clients.lock().await.drain().collect();
        for (addr, client) in clients {
            if let Err(e) = client.close().await {
                tracing::debug!(%addr, "rpc xclient: close: {}", e);
            }
        }
    }

    async fn dial(&self, rpc_addr: &str) -> client::Result<Client> {
        let mut clients = self.inner.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            tracing::debug!(addr = rpc_addr, "rpc xclient: evicting unavailable client");
            if let Some(stale) = clients.remove(rpc_addr) {
                let _ = stale.close().await;
            }
        }

        let client = xdial(rpc_addr, self.inner.opt).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_at<A, R>(&self, ctx: &CancellationToken, rpc_addr: &str, service_method: &str, args: &A) -> client::Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(client::Error::Canceled);
        }
        let client = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(client::Error::Canceled),
            client = self.dial(rpc_addr) => client?,
        };
        client.call(ctx, service_method, args).await
    }

    /// Calls one server picked by the selection mode.
    pub async fn call<A, R>(&self, ctx: &CancellationToken, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let rpc_addr = self.inner.discovery.get(self.inner.mode).await?;
        Ok(self.call_at(ctx, &rpc_addr, service_method, args).await?)
    }

    /// Calls every known server at once.
    ///
    /// The first error cancels legs that have not reached the wire yet and is
    /// returned once all legs are done. The first successful reply, if any,
    /// is written into `reply` regardless of errors elsewhere.
    pub async fn broadcast<A, R>(
        &self,
        ctx: &CancellationToken,
        service_method: &str,
        args: &A,
        mut reply: Option<&mut R>,
    ) -> Result<()>
    where
        A: Serialize + Clone + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.inner.discovery.get_all().await?;
        let cancel = ctx.child_token();
        let args = Arc::new(args.clone());

        let mut legs = JoinSet::new();
        for rpc_addr in servers {
            let xclient = self.clone();
            let cancel = cancel.clone();
            let args = args.clone();
            let service_method = service_method.to_string();
            legs.spawn(async move {
                xclient
                    .call_at::<A, R>(&cancel, &rpc_addr, &service_method, args.as_ref())
                    .await
            });
        }

        let mut first_error = None;
        while let Some(leg) = legs.join_next().await {
            let outcome = match leg {
                Ok(outcome) => outcome.map_err(Error::from),
                Err(e) => Err(Error::Leg(e.to_string())),
            };
            match outcome {
                Ok(value) => {
                    if let Some(slot) = reply.take() {
                        *slot = value;
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        cancel.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
