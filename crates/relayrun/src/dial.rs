//! # Dialing
//!
//! Turns an address into a running [`Client`]: connect, optionally tunnel
//! through HTTP CONNECT, write the handshake, start the receive pump.
//!
//! With a connect timeout set, the TCP connect is bounded directly and the
//! rest of the setup runs as a detached task raced against the timer. If the
//! timer wins, the task still finishes on its own and closes the client nobody
//! is waiting for.

use std::sync::Arc;

use relaywire::FrameCodec;
use relaywire::Options;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::client::Client;
use crate::client::Error;
use crate::client::Result;
use crate::tunnel;
use crate::tunnel::DEFAULT_RPC_PATH;

/// Builds a client over a connected stream by writing the handshake first.
pub async fn new_client<S>(mut stream: S, opt: Options) -> Result<Client>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    opt.write_to(&mut stream).await?;
    let codec = Arc::new(FrameCodec::new(stream, &opt));
    Ok(Client::new(codec, opt))
}

/// Like [`new_client`], but switches the stream over with an HTTP CONNECT
/// to `rpc_path` before the handshake.
pub async fn new_http_client<S>(mut stream: S, opt: Options, rpc_path: &str) -> Result<Client>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tunnel::connect(&mut stream, rpc_path)
        .await
        .map_err(relaywire::Error::from)?
        .map_err(Error::Tunnel)?;
    new_client(stream, opt).await
}

/// Dials a raw rpc server over TCP.
pub async fn dial(addr: &str, opt: Options) -> Result<Client> {
    dial_with(addr, opt, None).await
}

/// Dials an rpc server that listens behind the HTTP CONNECT tunnel at
/// [`DEFAULT_RPC_PATH`].
pub async fn dial_http(addr: &str, opt: Options) -> Result<Client> {
    dial_http_path(addr, opt, DEFAULT_RPC_PATH).await
}

/// Like [`dial_http`], for a server whose `rpc_path` is not the default.
pub async fn dial_http_path(addr: &str, opt: Options, rpc_path: &str) -> Result<Client> {
    dial_with(addr, opt, Some(rpc_path.to_string())).await
}

/// Dials an address of the form `protocol@host:port`.
///
/// `http` goes through the CONNECT tunnel; every other protocol dials the
/// raw transport.
pub async fn xdial(rpc_addr: &str, opt: Options) -> Result<Client> {
    let Some((protocol, addr)) = rpc_addr.split_once('@') else {
        return Err(Error::BadAddress(rpc_addr.to_string()));
    };
    match protocol {
        "http" => dial_http(addr, opt).await,
        _ => dial(addr, opt).await,
    }
}

async fn dial_with(addr: &str, opt: Options, rpc_path: Option<String>) -> Result<Client> {
    let timeout = opt.connect_timeout;

    let connect = TcpStream::connect(addr);
    let connected = if timeout.is_zero() {
        connect.await
    } else {
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))?
    };
    let stream = connected.map_err(|e| Error::Dial {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;
    let _ = stream.set_nodelay(true);

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let client = match rpc_path {
            Some(path) => new_http_client(stream, opt, &path).await,
            None => new_client(stream, opt).await,
        };
        if let Err(Ok(orphan)) = tx.send(client) {
            tracing::debug!("rpc client: closing connection finished after connect timeout");
            let _ = orphan.close().await;
        }
    });

    let setup = if timeout.is_zero() {
        rx.await
    } else {
        match tokio::time::timeout(timeout, rx).await {
            Ok(setup) => setup,
            Err(_) => {
                tracing::warn!(addr, "rpc client: connect timeout after {:?}", timeout);
                return Err(Error::ConnectTimeout(timeout));
            }
        }
    };

    setup.map_err(|_| Error::Dial {
        addr: addr.to_string(),
        reason: "connection setup task failed".to_string(),
    })?
}
