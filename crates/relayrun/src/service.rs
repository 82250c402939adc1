//! # Service Table
//!
//! A service is a receiver value plus a table of named methods. Each method is
//! stored type-erased: it knows how to decode its own argument type, run, and
//! encode its own reply type. The table is built once, at registration.
//!
//! ## Invariants
//! - Service names are non-empty and contain no `.`. Method names follow the
//!   same rule; a method that breaks it, or repeats a name, is skipped.
//! - Every reply starts as `R::default()`, so maps and vectors arrive empty
//!   rather than absent.
//! - An invocation is a detached task. Dropping its handle stops nobody from
//!   waiting on it; it runs to completion regardless.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use relaywire::CodecType;
use relaywire::Serializer;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("rpc server: invalid service name {0:?}")]
    InvalidName(String),
    #[error("rpc server: type {0} has no suitable methods")]
    NoMethods(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of one invocation: the encoded reply, or the error text sent back
/// to the caller.
pub type Outcome = std::result::Result<Vec<u8>, String>;

type Invoker = Box<dyn Fn(&[u8], CodecType) -> std::result::Result<JoinHandle<Outcome>, String> + Send + Sync>;

/// One callable method of a service.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    invoker: Invoker,
}

impl MethodType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decodes `body` into the argument type and starts the method.
    ///
    /// Fails without running anything if the argument does not decode.
    /// The returned task is detached: a caller that stops waiting on it
    /// leaves it running until the method returns.
    pub fn invoke(&self, body: &[u8], codec_type: CodecType) -> std::result::Result<JoinHandle<Outcome>, String> {
        let handle = (self.invoker)(body, codec_type)?;
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A named receiver and its method table.
#[derive(Debug)]
pub struct Service {
    name: String,
    receiver_type: &'static str,
    methods: BTreeMap<String, Arc<MethodType>>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receiver_type(&self) -> &'static str {
        self.receiver_type
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodType>> {
        self.methods.get(name)
    }

    /// Methods in name order.
    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodType>> {
        self.methods.values()
    }
}

/// Fluent builder for a [`Service`].
///
/// ```ignore
/// let service = ServiceBuilder::new("Arith", Arith)
///     .method("Sum", |_: &Arith, args: Args, reply: &mut i64| -> Result<(), String> {
///         *reply = args.num1 + args.num2;
///         Ok(())
///     })
///     .build()?;
/// ```
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: BTreeMap<String, Arc<MethodType>>,
}

impl<T> ServiceBuilder<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, receiver: T) -> Self {
        Self {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: BTreeMap::new(),
        }
    }

    /// Adds a blocking method. It runs on the blocking thread pool and fills
    /// in a reply that starts out as `R::default()`.
    pub fn method<A, R, E, F>(self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: Display,
        F: Fn(&T, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        let receiver = self.receiver.clone();
        let f = Arc::new(f);
        let invoker: Invoker = Box::new(move |body: &[u8], codec_type: CodecType| {
            let args: A = decode_args(body, codec_type)?;
            let receiver = receiver.clone();
            let f = f.clone();
            Ok(tokio::task::spawn_blocking(move || {
                let mut reply = R::default();
                (*f)(receiver.as_ref(), args, &mut reply).map_err(|e| e.to_string())?;
                encode_reply(&reply, codec_type)
            }))
        });
        self.insert(name, type_name::<A>(), type_name::<R>(), invoker)
    }

    /// Adds an async method. It runs as its own task on the runtime.
    pub fn async_method<A, R, E, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let receiver = self.receiver.clone();
        let invoker: Invoker = Box::new(move |body: &[u8], codec_type: CodecType| {
            let args: A = decode_args(body, codec_type)?;
            let running = f(receiver.clone(), args);
            Ok(tokio::spawn(async move {
                let reply = running.await.map_err(|e| e.to_string())?;
                encode_reply(&reply, codec_type)
            }))
        });
        self.insert(name, type_name::<A>(), type_name::<R>(), invoker)
    }

    fn insert(mut self, name: &str, arg_type: &'static str, reply_type: &'static str, invoker: Invoker) -> Self {
        if !is_valid_name(name) {
            tracing::debug!(service = %self.name, method = name, "rpc server: skipping method with invalid name");
            return self;
        }
        if self.methods.contains_key(name) {
            tracing::debug!(service = %self.name, method = name, "rpc server: skipping duplicate method");
            return self;
        }
        self.methods.insert(
            name.to_string(),
            Arc::new(MethodType {
                name: name.to_string(),
                arg_type,
                reply_type,
                num_calls: AtomicU64::new(0),
                invoker,
            }),
        );
        self
    }

    pub fn build(self) -> Result<Service> {
        if !is_valid_name(&self.name) {
            return Err(Error::InvalidName(self.name));
        }
        let receiver_type = type_name::<T>();
        if self.methods.is_empty() {
            return Err(Error::NoMethods(receiver_type.to_string()));
        }
        Ok(Service {
            name: self.name,
            receiver_type,
            methods: self.methods,
        })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.')
}

fn decode_args<A: DeserializeOwned>(body: &[u8], codec_type: CodecType) -> std::result::Result<A, String> {
    codec_type
        .unmarshal(body)
        .map_err(|e| format!("rpc server: read argv err: {}", e))
}

fn encode_reply<R: Serialize>(reply: &R, codec_type: CodecType) -> Outcome {
    codec_type
        .marshal(reply)
        .map_err(|e| format!("rpc server: write reply err: {}", e))
}
