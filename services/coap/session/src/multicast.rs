//! Multicast discovery.
//!
//! A discovery request is a non-confirmable GET sent to a group. Every
//! response carrying its token is handed to the caller's callback, once per
//! responder, until the context ends.

use crate::conn::{new_token, Conn};
use crate::context::Context;
use crate::error::{Result, SessionError};
use crate::pool::PooledMessage;
use crate::server::Server;
use bytes::Bytes;
use coap_wire::{Code, Message, MessageType};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

pub use crate::transport::{InterfaceSelection, MulticastInterface, MulticastOptions};

/// Callback receiving each discovery response with the responder's connection
pub type DiscoveryFn = Arc<dyn Fn(&Conn, PooledMessage) + Send + Sync>;

/// Active discovery tokens of one server
#[derive(Default)]
pub struct DiscoveryRegistry {
    active: DashMap<Bytes, DiscoveryFn>,
}

impl DiscoveryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Route responses carrying `token` to `f` until the guard is dropped
    pub fn register(self: &Arc<Self>, token: Bytes, f: DiscoveryFn) -> DiscoveryGuard {
        self.active.insert(token.clone(), f);
        DiscoveryGuard {
            registry: Arc::clone(self),
            token,
        }
    }

    /// Deliver a response to its discovery; an unknown token is returned
    pub fn dispatch(&self, conn: &Conn, msg: PooledMessage) -> std::result::Result<(), PooledMessage> {
        let f = match self.active.get(&msg.token) {
            Some(entry) => entry.value().clone(),
            None => return Err(msg),
        };
        f(conn, msg);
        Ok(())
    }

    /// Number of discoveries in flight
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no discovery is in flight
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Unregisters a discovery token on drop
pub struct DiscoveryGuard {
    registry: Arc<DiscoveryRegistry>,
    token: Bytes,
}

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        self.registry.active.remove(&self.token);
    }
}

impl Server {
    /// Send a discovery GET for `path` to `group` and collect responses.
    ///
    /// Responses arrive through the serving listener, each on the
    /// connection of its responder. Returns `Ok` once `ctx` ends; the
    /// token is unregistered on every path.
    pub async fn discover<F>(
        &self,
        ctx: &Context,
        group: SocketAddr,
        path: &str,
        on_response: F,
        opts: &MulticastOptions,
    ) -> Result<()>
    where
        F: Fn(&Conn, PooledMessage) + Send + Sync + 'static,
    {
        if self.is_stopped() {
            return Err(SessionError::ServerStopped);
        }
        let listener = self.listener().ok_or(SessionError::NotServing)?;

        let mut req = Message::new(
            MessageType::NonConfirmable,
            Code::GET,
            self.next_message_id(),
        );
        req.token = new_token();
        req.set_path(path);
        let datagram = req.encode(self.config().max_message_size)?;

        let _guard = self
            .discovery()
            .register(req.token.clone(), Arc::new(on_response));

        listener.send_multicast(&datagram, group, opts).await?;
        info!(%group, path, "Discovery request sent");

        let reason = ctx.done().await;
        debug!(%group, reason = %reason, "Discovery finished");
        Ok(())
    }
}
