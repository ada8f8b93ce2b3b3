//! CoAP over UDP: connection table, reliability and exchanges.
//!
//! This crate turns a connectionless datagram socket into per-peer
//! connections with confirmable-message retransmission, duplicate
//! suppression, request/response correlation by token, and liveness
//! monitoring.
//!
//! ## Features
//!
//! - **Server**: one listener, one [`Conn`] per remote address
//! - **Client**: [`dial`] a single peer over an ephemeral socket
//! - **Reliability**: exponential backoff retransmission, bounded attempts
//! - **Deduplication**: a repeated confirmable message runs the handler once
//! - **Exchanges**: blocking requests with cancellation and deadlines
//! - **Monitors**: inactivity and keepalive, driven by a shared periodic runner
//! - **Discovery**: multicast GET with per-responder callbacks
//!
//! ## Example
//!
//! ```rust,no_run
//! use coap_session::{dial, Config, Context, ResponseWriter, Server, UdpTransport};
//! use coap_session::PooledMessage;
//! use coap_wire::{media_type, Code};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(Config::new().with_handler(
//!     |w: &mut ResponseWriter, req: &PooledMessage| {
//!         if req.path() == "/hello" {
//!             w.set_response(Code::CONTENT, media_type::TEXT_PLAIN, "world");
//!         }
//!     },
//! ));
//! let listener = UdpTransport::bind("127.0.0.1:5683".parse()?).await?;
//! let s = server.clone();
//! tokio::spawn(async move { s.serve(Arc::new(listener)).await });
//!
//! let conn = dial("127.0.0.1:5683", Config::new()).await?;
//! let req = conn.new_get_request("/hello");
//! let resp = conn
//!     .do_request(&Context::with_timeout(Duration::from_secs(5)), req)
//!     .await?;
//! println!("{} {:?}", resp.code, resp.payload);
//!
//! conn.close()?;
//! server.stop();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod conn;
pub mod context;
pub mod dedup;
pub mod error;
pub mod exchange;
pub mod monitor;
pub mod multicast;
pub mod periodic;
pub mod pool;
pub mod retransmit;
pub mod server;
pub mod transport;

// Re-export main types
pub use client::dial;
pub use config::{
    default_process_received_message, Config, OnNewConnFn, ProcessReceivedMessageFn,
    DEFAULT_RECEIVED_MESSAGE_QUEUE_SIZE,
};
pub use conn::{Conn, ConnState, ConnStats, Handler, ResponseWriter};
pub use context::{CancelHandle, Context};
pub use dedup::{DedupCache, DedupOutcome};
pub use error::{Result, SessionError};
pub use exchange::{Exchange, ExchangeResult, ExchangeTracker, Registration};
pub use monitor::{InactivityConfig, KeepaliveConfig, OnInactiveFn};
pub use multicast::{DiscoveryFn, DiscoveryGuard, DiscoveryRegistry};
pub use periodic::{JobId, PeriodicJob, PeriodicRunner, DEFAULT_PERIODIC_INTERVAL};
pub use pool::{MessagePool, PoolStats, PooledMessage, DEFAULT_POOL_CAPACITY};
pub use retransmit::{AckKind, RetransmitScheduler, TransmissionParams, MAX_LATENCY};
pub use server::Server;
pub use transport::{
    InterfaceSelection, MulticastInterface, MulticastOptions, PacketConn, UdpTransport,
    DEFAULT_HOP_LIMIT, MAX_DATAGRAM_SIZE,
};
