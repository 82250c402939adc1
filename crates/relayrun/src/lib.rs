//! # RelayRun
//!
//! The relay rpc runtime: a multiplexing client, a concurrent server, a
//! load-balancing multi-server client, and a heartbeat registry.
//!
//! ## Architecture
//!
//! - [`client`]: one connection, many concurrent calls, matched by sequence.
//! - [`dial`]: connect, tunnel, handshake, with connect timeouts.
//! - [`service`] and [`server`]: method tables and the per-connection serve loop.
//! - [`discovery`] and [`xclient`]: address selection and fan-out.
//! - [`registry`]: the HTTP directory servers heartbeat into.
//!
//! Everything speaks through [`relaywire::Codec`], so the wire format is the
//! wire crate's concern alone.

pub mod client;
pub mod dial;
pub mod discovery;
pub mod registry;
pub mod server;
pub mod service;
pub mod tunnel;
pub mod xclient;

pub use client::Call;
pub use client::Client;
pub use dial::dial;
pub use dial::dial_http;
pub use dial::dial_http_path;
pub use dial::xdial;
pub use discovery::Discovery;
pub use discovery::MultiServerDiscovery;
pub use discovery::RegistryDiscovery;
pub use discovery::SelectMode;
pub use registry::Registry;
pub use registry::RegistryConfig;
pub use server::Server;
pub use server::ServerConfig;
pub use service::Service;
pub use service::ServiceBuilder;
pub use tunnel::DEFAULT_RPC_PATH;
pub use xclient::XClient;

#[cfg(test)]
mod tests;
