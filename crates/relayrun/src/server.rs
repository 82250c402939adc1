//! # RPC Server
//!
//! Accepts connections, validates their handshake, and serves requests
//! against the registered service table.
//!
//! ## Philosophy
//! One task per connection, one task per request. A connection never waits
//! for a handler before reading the next request; responses go out in
//! completion order and the codec's write lock keeps each one whole.
//!
//! ## Invariants
//! - A connection with a bad handshake is dropped without a reply.
//! - A request that fails to resolve still has its body consumed, so the
//!   connection stays aligned and keeps serving.
//! - A connection is torn down only after every handler it spawned is done.
//! - A handle timeout answers the caller and stops waiting. The method
//!   itself keeps running until it returns, and its late result is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relaywire::Codec;
use relaywire::FrameCodec;
use relaywire::Header;
use relaywire::Options;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;

use crate::service::MethodType;
use crate::service::Service;
use crate::tunnel;
use crate::tunnel::DEFAULT_RPC_PATH;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),
    #[error("rpc server: service/method request ill-formed: {0}")]
    MalformedServiceMethod(String),
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),
    #[error("rpc server: accept error: {0}")]
    Accept(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Applied when a client's handshake asks for no handle timeout.
    /// Zero means wait for methods as long as they take.
    pub handle_timeout: Duration,
    /// Path accepted by the HTTP CONNECT tunnel.
    pub rpc_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handle_timeout: Duration::ZERO,
            rpc_path: DEFAULT_RPC_PATH.to_string(),
        }
    }
}

struct Inner {
    config: ServerConfig,
    services: DashMap<String, Arc<Service>>,
}

/// An rpc server. Cheap to clone; clones share the service table.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

/// A request whose method has been resolved and whose body has been read.
struct Request {
    header: Header,
    method: Arc<MethodType>,
    body: Bytes,
}

enum RequestError {
    /// The request was read whole but cannot be served. The connection
    /// stays usable.
    Rejected { header: Header, error: String },
    /// The stream failed. `header` is set when the failure hit mid-request.
    Transport {
        header: Option<Header>,
        error: relaywire::Error,
    },
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                services: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Publishes a service. A second service with the same name is refused.
    pub fn register(&self, service: Service) -> Result<()> {
        match self.inner.services.entry(service.name().to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateService(service.name().to_string())),
            Entry::Vacant(slot) => {
                for method in service.methods() {
                    tracing::info!("rpc server: register {}.{}", service.name(), method.name());
                }
                slot.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Call counts per service and method, sorted by name.
    pub fn stats(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.inner
            .services
            .iter()
            .map(|service| {
                let methods = service
                    .methods()
                    .map(|method| (method.name().to_string(), method.num_calls()))
                    .collect();
                (service.key().clone(), methods)
            })
            .collect()
    }

    pub(crate) fn find_service(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodType>)> {
        let Some((service_name, method_name)) = service_method.split_once('.') else {
            return Err(Error::MalformedServiceMethod(service_method.to_string()));
        };
        let service = self
            .inner
            .services
            .get(service_name)
            .map(|service| service.value().clone())
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .cloned()
            .ok_or_else(|| Error::MethodNotFound(method_name.to_string()))?;
        Ok((service, method))
    }

    /// Serves every connection accepted on `listener`, each on its own task.
    ///
    /// Returns only when accepting fails.
    pub async fn accept(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| Error::Accept(e.to_string()))?;
            tracing::debug!(%peer, "rpc server: accepted connection");
            let _ = stream.set_nodelay(true);

            let server = self.clone();
            tokio::spawn(async move { server.serve_conn(stream).await });
        }
    }

    /// Like [`Server::accept`], but each connection must first switch over
    /// with `CONNECT <rpc_path>`. Other HTTP requests are refused.
    pub async fn serve_http(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (mut stream, peer) = listener
                .accept()
                .await
                .map_err(|e| Error::Accept(e.to_string()))?;
            tracing::debug!(%peer, "rpc server: accepted http connection");

            let server = self.clone();
            tokio::spawn(async move {
                match tunnel::accept(&mut stream, &server.inner.config.rpc_path).await {
                    Ok(true) => server.serve_conn(stream).await,
                    Ok(false) => {}
                    Err(e) => tracing::debug!(%peer, "rpc server: tunnel failed: {}", e),
                }
            });
        }
    }

    /// Serves one connection until the peer goes away.
    pub async fn serve_conn<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let opt = match Options::read_from(&mut stream).await {
            Ok(opt) => opt,
            Err(e) => {
                tracing::warn!("rpc server: options error: {}", e);
                return;
            }
        };

        let handle_timeout = if opt.handle_timeout.is_zero() {
            self.inner.config.handle_timeout
        } else {
            opt.handle_timeout
        };

        let codec: Arc<dyn Codec> = Arc::new(FrameCodec::new(stream, &opt));
        self.serve_codec(codec, handle_timeout).await;
    }

    /// The per-connection serve loop over an already negotiated codec.
    pub async fn serve_codec(&self, codec: Arc<dyn Codec>, handle_timeout: Duration) {
        let handlers = TaskTracker::new();

        loop {
            match self.read_request(codec.as_ref()).await {
                Ok(request) => {
                    let server = self.clone();
                    let codec = codec.clone();
                    handlers.spawn(async move {
                        server.handle_request(codec.as_ref(), request, handle_timeout).await;
                    });
                }
                Err(RequestError::Rejected { header, error }) => {
                    tracing::debug!(seq = header.seq, "{}", error);
                    send_response(codec.as_ref(), header.with_error(error), &[]).await;
                }
                Err(RequestError::Transport { header, error }) => {
                    if error.is_eof() {
                        tracing::debug!("rpc server: connection closed by peer");
                        break;
                    }
                    tracing::warn!("rpc server: read request error: {}", error);
                    if let Some(header) = header {
                        send_response(codec.as_ref(), header.with_error(error.to_string()), &[]).await;
                    }
                    break;
                }
            }
        }

        handlers.close();
        handlers.wait().await;
        let _ = codec.close().await;
    }

    async fn read_request(&self, codec: &dyn Codec) -> std::result::Result<Request, RequestError> {
        let header = codec
            .read_header()
            .await
            .map_err(|error| RequestError::Transport { header: None, error })?;

        let resolved = self.find_service(&header.service_method);

        // the body is consumed even when resolution failed
        let body = match codec.read_body().await {
            Ok(body) => body,
            Err(error) => {
                return Err(RequestError::Transport {
                    header: Some(header),
                    error,
                });
            }
        };

        match resolved {
            Ok((_, method)) => Ok(Request { header, method, body }),
            Err(e) => Err(RequestError::Rejected {
                header,
                error: e.to_string(),
            }),
        }
    }

    async fn handle_request(&self, codec: &dyn Codec, request: Request, handle_timeout: Duration) {
        let Request { header, method, body } = request;

        let running = match method.invoke(&body, codec.codec_type()) {
            Ok(running) => running,
            Err(error) => {
                send_response(codec, header.with_error(error), &[]).await;
                return;
            }
        };

        let finished = if handle_timeout.is_zero() {
            running.await
        } else {
            match tokio::time::timeout(handle_timeout, running).await {
                Ok(finished) => finished,
                Err(_) => {
                    tracing::warn!(
                        seq = header.seq,
                        service_method = %header.service_method,
                        "rpc server: handle timeout after {:?}",
                        handle_timeout
                    );
                    let error = format!("rpc server: request handle timeout: expect within {:?}", handle_timeout);
                    send_response(codec, header.with_error(error), &[]).await;
                    return;
                }
            }
        };

        match finished {
            Ok(Ok(reply)) => send_response(codec, header, &reply).await,
            Ok(Err(error)) => send_response(codec, header.with_error(error), &[]).await,
            Err(e) => {
                tracing::error!(service_method = %header.service_method, "rpc server: method failed: {}", e);
                let error = format!("rpc server: method {} failed: {}", header.service_method, e);
                send_response(codec, header.with_error(error), &[]).await;
            }
        }
    }
}

async fn send_response(codec: &dyn Codec, header: Header, body: &[u8]) {
    if let Err(e) = codec.write(&header, body).await {
        tracing::warn!(seq = header.seq, "rpc server: write response error: {}", e);
    }
}
