//! Client side: dial a single peer over its own UDP socket.

use crate::config::Config;
use crate::conn::Conn;
use crate::error::{Result, SessionError};
use crate::pool::MessagePool;
use crate::transport::{unspecified_for, PacketConn, UdpTransport};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::lookup_host;
use tracing::{debug, error, info};

/// Open a connection to `addr` (`host:port`).
///
/// Binds an ephemeral socket of the peer's address family and starts a
/// receive task that feeds datagrams from the peer into the connection.
/// Datagrams from other sources are ignored. The task ends when the
/// connection closes.
pub async fn dial(addr: &str, config: Config) -> Result<Conn> {
    let peer = lookup_host(addr)
        .await
        .map_err(|err| SessionError::InvalidAddress(format!("{addr}: {err}")))?
        .next()
        .ok_or_else(|| SessionError::InvalidAddress(addr.to_string()))?;

    let transport = Arc::new(UdpTransport::bind(unspecified_for(&peer)).await?);
    let pool = config.message_pool.clone();
    let max = config.max_message_size;
    let runner = config.runner();

    let conn = Conn::new(peer, transport.clone(), config, runner, None);
    tokio::spawn(receive_loop(conn.clone(), transport, pool, max));

    info!(%peer, local_addr = ?conn.local_addr().ok(), "Dialed CoAP peer");
    Ok(conn)
}

async fn receive_loop(conn: Conn, transport: Arc<UdpTransport>, pool: MessagePool, max: usize) {
    let peer = conn.remote_addr();
    let mut buf = vec![0u8; max + 1];

    loop {
        let (n, from) = tokio::select! {
            _ = conn.done() => break,
            res = transport.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(err) => {
                    error!(%peer, error = %err, "Client receive failed, closing connection");
                    let _ = conn.close();
                    break;
                }
            },
        };

        if from != peer {
            debug!(%peer, %from, "Ignoring datagram from unexpected source");
            continue;
        }
        if n > max {
            debug!(%peer, len = n, max, "Dropping oversized datagram");
            continue;
        }

        let mut msg = pool.acquire();
        if let Err(err) = msg.decode_into(Bytes::copy_from_slice(&buf[..n])) {
            debug!(%peer, error = %err, "Dropping malformed datagram");
            continue;
        }
        conn.enqueue(msg);
    }

    debug!(%peer, "Client receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_dial_rejects_bad_address() {
        let err = dial("not an address", Config::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_foreign_datagrams_ignored() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = dial(&peer.local_addr().unwrap().to_string(), Config::new())
            .await
            .unwrap();

        let ping = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.ping(&Context::with_timeout(Duration::from_millis(300)))
                    .await
            })
        };

        let mut buf = [0u8; 64];
        let (n, client_addr) = peer.recv_from(&mut buf).await.unwrap();
        let probe = coap_wire::Message::decode(Bytes::copy_from_slice(&buf[..n])).unwrap();
        let reset = coap_wire::Message::empty(coap_wire::MessageType::Reset, probe.message_id)
            .encode(64)
            .unwrap();

        // a reset from the wrong source must not complete the ping
        stranger.send_to(&reset, client_addr).await.unwrap();
        assert!(matches!(
            ping.await.unwrap(),
            Err(SessionError::DeadlineExceeded)
        ));
        assert_eq!(conn.stats().datagrams_in, 0);

        conn.close().unwrap();
    }
}
