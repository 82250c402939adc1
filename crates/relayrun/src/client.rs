//! # RPC Client with Receive Pump
//!
//! One `Client` owns one connection. Calls are multiplexed over it and
//! correlated with their responses by sequence number.
//!
//! ## Invariants
//! - Sequence numbers start at 1, strictly increase, and are never reused
//!   while a call is pending. Header write order matches sequence order
//!   because allocation and write happen under the same `sending` lock.
//! - Every registered call leaves the pending table exactly once: on
//!   response, on remote error, on local cancellation, or when the
//!   connection dies. Whoever removes it completes it.
//! - Cancellation is local. Nothing is sent to the peer; a late response is
//!   dropped by the pump as an unknown sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use relaywire::Codec;
use relaywire::CodecType;
use relaywire::Header;
use relaywire::Options;
use relaywire::Serializer;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::MutexGuard;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffer of completion channels made by [`Call::channel`].
pub const DEFAULT_DONE_BUFFER: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The client was closed locally, or its connection already died.
    #[error("connection is shut down")]
    Shutdown,
    /// The connection died while the call was pending.
    #[error("connection shut down: {0}")]
    ConnectionShutdown(String),
    /// The serving method, or the server itself, reported an error.
    #[error("{0}")]
    Remote(String),
    #[error("rpc client: call canceled")]
    Canceled,
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("rpc client: dial {addr}: {reason}")]
    Dial { addr: String, reason: String },
    #[error("rpc client: unexpected HTTP response: {0}")]
    Tunnel(String),
    #[error("rpc client err: wrong format '{0}', expect protocol@addr")]
    BadAddress(String),
    #[error("rpc client: error reading body: {0}")]
    Decode(String),
    #[error("rpc client: {0}")]
    Wire(relaywire::Error),
}

impl From<relaywire::Error> for Error {
    fn from(e: relaywire::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A finished call, delivered on its completion channel.
#[derive(Debug)]
pub struct Call<R> {
    /// Zero when the call never made it into the pending table.
    pub seq: u64,
    pub service_method: String,
    pub reply: Result<R>,
}

impl<R> Call<R> {
    /// A completion channel with the default buffer.
    ///
    /// Any `mpsc` sender works; its capacity is at least one by construction.
    pub fn channel() -> (mpsc::Sender<Call<R>>, mpsc::Receiver<Call<R>>) {
        mpsc::channel(DEFAULT_DONE_BUFFER)
    }
}

/// A call waiting in the pending table, with its reply type erased.
trait Pending: Send {
    /// Consumes the call. `body` is the raw reply on success.
    fn complete(self: Box<Self>, body: Result<Bytes>, codec_type: CodecType);
}

struct PendingCall<R> {
    seq: u64,
    service_method: String,
    done: mpsc::Sender<Call<R>>,
}

impl<R> PendingCall<R> {
    fn finish(self, reply: Result<R>) {
        let call = Call {
            seq: self.seq,
            service_method: self.service_method,
            reply,
        };
        if self.done.try_send(call).is_err() {
            tracing::debug!(seq = self.seq, "rpc client: completion channel full or dropped");
        }
    }
}

impl<R> Pending for PendingCall<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn complete(self: Box<Self>, body: Result<Bytes>, codec_type: CodecType) {
        let reply = body.and_then(|body| {
            codec_type
                .unmarshal::<R>(&body)
                .map_err(|e| Error::Decode(e.to_string()))
        });
        (*self).finish(reply);
    }
}

struct State {
    seq: u64,
    pending: HashMap<u64, Box<dyn Pending>>,
    /// Closed by the user.
    closing: bool,
    /// Closed by a transport failure.
    shutdown: bool,
}

struct Inner {
    codec: Arc<dyn Codec>,
    opt: Options,
    sending: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    /// Stops the pump once the last handle is gone.
    dropped: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dropped.cancel();
    }
}

/// A multiplexing rpc client bound to one connection.
///
/// Cheap to clone; clones share the connection. Dropping the last clone
/// stops the receive pump and closes the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Starts a client over a codec whose handshake is already done.
    pub fn new(codec: Arc<dyn Codec>, opt: Options) -> Self {
        let inner = Arc::new(Inner {
            codec: codec.clone(),
            opt,
            sending: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            dropped: CancellationToken::new(),
        });

        let dropped = inner.dropped.clone();
        let weak = Arc::downgrade(&inner);
        tokio::spawn(receive(codec, weak, dropped));

        Self { inner }
    }

    pub fn options(&self) -> &Options {
        &self.inner.opt
    }

    /// Closes the connection. A second close reports [`Error::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.inner.codec.close().await?;
        Ok(())
    }

    /// False once the client is closing or its connection has died.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    /// Issues a call without waiting for its reply.
    ///
    /// The finished [`Call`] is delivered on `done`; a full channel drops it
    /// with a debug log, so size the channel for the calls sharing it.
    /// Returns the assigned sequence number, or zero if the call was
    /// completed locally without touching the wire.
    pub async fn go<A, R>(&self, service_method: &str, args: &A, done: mpsc::Sender<Call<R>>) -> u64
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let call = PendingCall {
            seq: 0,
            service_method: service_method.to_string(),
            done,
        };

        let body = match self.inner.codec.codec_type().marshal(args) {
            Ok(body) => body,
            Err(e) => {
                call.finish(Err(e.into()));
                return 0;
            }
        };

        let sending = self.inner.sending.lock().await;
        self.send(sending, call, body).await
    }

    /// Calls a remote method and waits for its reply or for `ctx` to fire.
    ///
    /// On cancellation the call is forgotten locally and [`Error::Canceled`]
    /// returned right away; the server keeps running it. A call still queued
    /// behind other writers gives up its place. A frame already being
    /// written is finished first so the stream stays framed.
    pub async fn call<A, R>(&self, ctx: &CancellationToken, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let body = self.inner.codec.codec_type().marshal(args)?;
        let (tx, mut rx) = mpsc::channel(1);
        let call = PendingCall {
            seq: 0,
            service_method: service_method.to_string(),
            done: tx,
        };

        let sending = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Canceled),
            sending = self.inner.sending.lock() => sending,
        };
        let seq = self.send(sending, call, body).await;

        tokio::select! {
            biased;
            call = rx.recv() => match call {
                Some(call) => call.reply,
                None => Err(Error::Shutdown),
            },
            _ = ctx.cancelled() => {
                self.remove_call(seq);
                Err(Error::Canceled)
            }
        }
    }

    /// Registers `call` and writes its frame. Holding `_sending` keeps
    /// sequence order and write order the same.
    async fn send<R>(&self, _sending: MutexGuard<'_, ()>, mut call: PendingCall<R>, body: Vec<u8>) -> u64
    where
        R: DeserializeOwned + Send + 'static,
    {
        let header = {
            let mut state = self.inner.state.lock();
            if state.closing || state.shutdown {
                drop(state);
                call.finish(Err(Error::Shutdown));
                return 0;
            }
            let seq = state.seq;
            state.seq += 1;
            call.seq = seq;
            let header = Header::request(call.service_method.as_str(), seq);
            state.pending.insert(seq, Box::new(call));
            header
        };

        if let Err(e) = self.inner.codec.write(&header, &body).await {
            tracing::warn!(seq = header.seq, "rpc client: write failed: {}", e);
            if let Some(call) = self.remove_call(header.seq) {
                call.complete(Err(e.into()), self.inner.codec.codec_type());
            }
        }
        header.seq
    }

    fn remove_call(&self, seq: u64) -> Option<Box<dyn Pending>> {
        self.inner.state.lock().pending.remove(&seq)
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl Inner {
    /// Fails every pending call and marks the client dead for good.
    async fn terminate_calls(&self, reason: &relaywire::Error) {
        let _sending = self.sending.lock().await;
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };

        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "rpc client: failing pending calls: {}", reason);
        }
        let codec_type = self.codec.codec_type();
        for call in drained {
            call.complete(Err(Error::ConnectionShutdown(reason.to_string())), codec_type);
        }
    }
}

/// The receive pump: one per connection, running until the first read error.
async fn receive(codec: Arc<dyn Codec>, client: Weak<Inner>, dropped: CancellationToken) {
    let codec_type = codec.codec_type();

    let error = loop {
        let header = tokio::select! {
            biased;
            _ = dropped.cancelled() => break relaywire::Error::Closed,
            header = codec.read_header() => match header {
                Ok(header) => header,
                Err(e) => break e,
            },
        };

        let call = match client.upgrade() {
            Some(inner) => inner.state.lock().pending.remove(&header.seq),
            None => break relaywire::Error::Closed,
        };

        let body = match codec.read_body().await {
            Ok(body) => body,
            Err(e) => {
                if let Some(call) = call {
                    call.complete(Err(Error::Decode(e.to_string())), codec_type);
                }
                break e;
            }
        };

        match call {
            None => {
                tracing::debug!(seq = header.seq, "rpc client: dropping response for unknown call");
            }
            Some(call) if header.is_error() => {
                call.complete(Err(Error::Remote(header.error)), codec_type);
            }
            Some(call) => call.complete(Ok(body), codec_type),
        }
    };

    if error.is_eof() {
        tracing::debug!("rpc client: connection closed");
    } else {
        tracing::warn!("rpc client: receive loop failed: {}", error);
    }

    if let Some(inner) = client.upgrade() {
        inner.terminate_calls(&error).await;
    }
    let _ = codec.close().await;
}
