//! # HTTP CONNECT Tunnel
//!
//! Lets rpc traffic share a port with HTTP. The dialer sends
//! `CONNECT <rpc-path> HTTP/1.0`, the server answers with the exact
//! [`CONNECTED`] status line, and from then on the socket carries the normal
//! handshake and frames.

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_RPC_PATH: &str = "/_rpc_";

/// Status line of a successful tunnel response (without the HTTP version).
pub const CONNECTED: &str = "200 Connected to Relay RPC";

/// Upper bound on a request or response head. Anything longer is not ours.
const MAX_HEAD_LEN: usize = 8 * 1024;

/// Reads an HTTP head up to and including the blank line.
///
/// Reads byte by byte so nothing past the head is consumed; the peer's first
/// rpc bytes follow immediately on the same socket.
pub(crate) async fn read_head<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    loop {
        let byte = reader.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\n\n") || head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "http head too long",
            ));
        }
    }
    String::from_utf8(head)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Client side: asks the server to switch the socket over to rpc.
///
/// Returns the offending status line on rejection.
pub(crate) async fn connect<S>(stream: &mut S, rpc_path: &str) -> std::io::Result<Result<(), String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("CONNECT {} HTTP/1.0\n\n", rpc_path).as_bytes())
        .await?;
    stream.flush().await?;

    let head = read_head(stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_once(' ')
        .map(|(_, status)| status.trim())
        .unwrap_or_default();

    if status == CONNECTED {
        Ok(Ok(()))
    } else {
        Ok(Err(status_line.trim().to_string()))
    }
}

/// Server side: reads one request head and answers it.
///
/// Returns `true` when the socket has been handed over to rpc.
pub(crate) async fn accept<S>(stream: &mut S, rpc_path: &str) -> std::io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_head(stream).await?;
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let path = request_line.next().unwrap_or_default();

    let response = if method != "CONNECT" {
        tracing::debug!(method, "rpc tunnel: rejecting non-CONNECT request");
        "HTTP/1.0 405 Method Not Allowed\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n405 must CONNECT\n".to_string()
    } else if path != rpc_path {
        tracing::debug!(path, "rpc tunnel: unknown rpc path");
        "HTTP/1.0 404 Not Found\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n404 page not found\n".to_string()
    } else {
        format!("HTTP/1.0 {}\n\n", CONNECTED)
    };

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(method == "CONNECT" && path == rpc_path)
}
