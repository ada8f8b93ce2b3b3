//! CoAP server: one listener, one connection per remote address.
//!
//! [`Server::serve`] reads datagrams from the listener, decodes them into
//! pooled messages and hands them to the connection of their source
//! address, creating it on first contact. The connection table is keyed by
//! remote address; a connection removes itself from the table when closed.

use crate::config::Config;
use crate::conn::Conn;
use crate::error::{Result, SessionError};
use crate::multicast::DiscoveryRegistry;
use crate::periodic::PeriodicRunner;
use crate::transport::{PacketConn, MAX_DATAGRAM_SIZE};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info};

struct ServerInner {
    config: Config,
    conns: DashMap<SocketAddr, Conn>,
    listener: Mutex<Option<Arc<dyn PacketConn>>>,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    runner: PeriodicRunner,
    discovery: Arc<DiscoveryRegistry>,
    next_message_id: AtomicU16,
}

/// CoAP server handle; cheap to clone
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("conns", &self.inner.conns.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Server {
    /// Create a server; nothing happens until [`Server::serve`]
    pub fn new(config: Config) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let runner = config.runner();
        Self {
            inner: Arc::new(ServerInner {
                config,
                conns: DashMap::new(),
                listener: Mutex::new(None),
                stopped: AtomicBool::new(false),
                stop_tx,
                runner,
                discovery: Arc::new(DiscoveryRegistry::new()),
                next_message_id: AtomicU16::new(rand::random()),
            }),
        }
    }

    /// Serve datagrams from `listener` until [`Server::stop`] is called.
    ///
    /// Returns `Ok` on stop, or the transport error that ended the loop.
    /// Serving on a stopped server returns immediately.
    pub async fn serve(&self, listener: Arc<dyn PacketConn>) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        {
            let mut slot = self.lock_listener();
            if slot.is_some() {
                return Err(SessionError::AlreadyServing);
            }
            *slot = Some(listener.clone());
        }

        let local_addr = listener.local_addr().ok();
        info!(local_addr = ?local_addr, "CoAP server listening");

        let stopped = wait_stopped(self.inner.stop_tx.subscribe());
        tokio::pin!(stopped);

        let max = self.inner.config.max_message_size.min(MAX_DATAGRAM_SIZE);
        let mut buf = vec![0u8; max + 1];

        let result = loop {
            let received = tokio::select! {
                _ = &mut stopped => break Ok(()),
                res = listener.recv_from(&mut buf) => res,
            };

            let (n, peer) = match received {
                Ok(received) => received,
                Err(err) => {
                    if self.is_stopped() {
                        break Ok(());
                    }
                    error!(error = %err, "Listener receive failed");
                    break Err(SessionError::Transport(err));
                }
            };

            if n > max {
                debug!(%peer, len = n, max, "Dropping oversized datagram");
                continue;
            }

            let mut msg = self.inner.config.message_pool.acquire();
            if let Err(err) = msg.decode_into(Bytes::copy_from_slice(&buf[..n])) {
                debug!(%peer, error = %err, "Dropping malformed datagram");
                continue;
            }

            match self.get_or_create(peer, &listener) {
                Ok(conn) => {
                    conn.enqueue(msg);
                }
                Err(_) => break Ok(()),
            }
        };

        self.lock_listener().take();
        info!(local_addr = ?local_addr, "CoAP server no longer serving");
        result
    }

    /// Connection to `addr` over the serving listener, created if needed.
    ///
    /// Used to initiate requests from the server side.
    pub fn new_conn(&self, addr: SocketAddr) -> Result<Conn> {
        if self.is_stopped() {
            return Err(SessionError::ServerStopped);
        }
        let listener = self.listener().ok_or(SessionError::NotServing)?;
        self.get_or_create(addr, &listener)
    }

    /// Stop serving and close every connection.
    ///
    /// Close callbacks have run when this returns. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_tx.send_replace(true);

        let conns: Vec<Conn> = self
            .inner
            .conns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in &conns {
            if let Err(err) = conn.close() {
                debug!(peer = %conn.remote_addr(), error = %err, "Close failed during stop");
            }
        }
        self.inner.conns.clear();

        info!(closed = conns.len(), "CoAP server stopped");
    }

    /// Whether [`Server::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Number of live connections
    pub fn conn_count(&self) -> usize {
        self.inner.conns.len()
    }

    /// Local address of the serving listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener()?.local_addr().ok()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn PacketConn>> {
        self.lock_listener().clone()
    }

    pub(crate) fn discovery(&self) -> &Arc<DiscoveryRegistry> {
        &self.inner.discovery
    }

    pub(crate) fn next_message_id(&self) -> u16 {
        self.inner.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn PacketConn>>> {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_create(&self, peer: SocketAddr, listener: &Arc<dyn PacketConn>) -> Result<Conn> {
        let conn = match self.inner.conns.entry(peer) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_active() {
                    return Ok(entry.get().clone());
                }
                let conn = self.create_conn(peer, listener);
                entry.insert(conn.clone());
                conn
            }
            Entry::Vacant(entry) => {
                let conn = self.create_conn(peer, listener);
                entry.insert(conn.clone());
                conn
            }
        };

        let server = Arc::downgrade(&self.inner);
        let id = conn.id();
        conn.add_on_close(move || {
            if let Some(server) = server.upgrade() {
                server.conns.remove_if(&peer, |_, c| c.id() == id);
            }
        });

        // stop may have swept the table before this insert
        if self.is_stopped() {
            conn.close()?;
            return Err(SessionError::ServerStopped);
        }

        if let Some(on_new_conn) = &self.inner.config.on_new_conn {
            on_new_conn(&conn);
        }
        info!(%peer, conn_id = id, "New connection");
        Ok(conn)
    }

    fn create_conn(&self, peer: SocketAddr, listener: &Arc<dyn PacketConn>) -> Conn {
        Conn::new(
            peer,
            listener.clone(),
            self.inner.config.clone(),
            self.inner.runner.clone(),
            Some(self.inner.discovery.clone()),
        )
    }
}

async fn wait_stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::dial;
    use crate::conn::ResponseWriter;
    use crate::context::Context;
    use crate::pool::PooledMessage;
    use crate::retransmit::TransmissionParams;
    use crate::transport::UdpTransport;
    use coap_wire::{media_type, Code, Message, MessageType};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Instant};

    async fn start(config: Config) -> (Server, SocketAddr, JoinHandle<Result<()>>) {
        let server = Server::new(config);
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let s = server.clone();
        let handle = tokio::spawn(async move { s.serve(Arc::new(transport)).await });
        while server.local_addr().is_none() {
            tokio::task::yield_now().await;
        }
        (server, addr, handle)
    }

    async fn recv_message(socket: &UdpSocket, wait: Duration) -> Option<(Message, Instant)> {
        let mut buf = [0u8; 1500];
        let (n, _) = timeout(wait, socket.recv_from(&mut buf)).await.ok()?.ok()?;
        Some((Message::decode(Bytes::copy_from_slice(&buf[..n])).ok()?, Instant::now()))
    }

    #[tokio::test]
    async fn test_responses_arrive_in_request_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (server, addr, _) = start(Config::new().with_handler(
            move |w: &mut ResponseWriter, req: &PooledMessage| {
                let token: [u8; 8] = req.token[..].try_into().unwrap();
                sink.lock().unwrap().push(u64::from_le_bytes(token));
                w.set_response(Code::CONTENT, media_type::TEXT_PLAIN, "1234");
            },
        ))
        .await;

        let conn = dial(&addr.to_string(), Config::new()).await.unwrap();
        let ctx = Context::with_timeout(Duration::from_secs(30));
        for i in 0..1000u64 {
            let mut req = conn.new_get_request("/tmp");
            req.token = Bytes::copy_from_slice(&i.to_le_bytes());
            let resp = conn.do_request(&ctx, req).await.unwrap();
            assert_eq!(resp.code, Code::CONTENT);
            assert_eq!(&resp.payload[..], b"1234");
        }

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, (0..1000).collect::<Vec<u64>>());
        assert_eq!(conn.stats().pending_exchanges, 0);

        conn.close().unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_closed_conn_leaves_table() {
        let (server_conn_tx, mut server_conn_rx) = mpsc::unbounded_channel();
        let (server, addr, _) = start(Config::new().with_on_new_conn(move |conn| {
            let _ = server_conn_tx.send(conn.clone());
        }))
        .await;

        let client = dial(&addr.to_string(), Config::new()).await.unwrap();
        client
            .ping(&Context::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        let server_conn = server_conn_rx.recv().await.unwrap();
        assert_eq!(server.conn_count(), 1);
        assert_eq!(
            server_conn.remote_addr().port(),
            client.local_addr().unwrap().port()
        );

        server_conn.close().unwrap();
        assert_eq!(server.conn_count(), 0);

        // the peer comes back on a fresh connection
        client
            .ping(&Context::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        let again = server_conn_rx.recv().await.unwrap();
        assert_ne!(again.id(), server_conn.id());
        assert_eq!(server.conn_count(), 1);

        client.close().unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_inactivity_notifies_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (server, addr, _) = start(
            Config::new()
                .with_periodic_interval(Duration::from_millis(10))
                .with_inactivity_monitor(Duration::from_millis(100), move |conn| {
                    let _ = tx.send(conn.id());
                    let _ = conn.close();
                }),
        )
        .await;

        let client = dial(&addr.to_string(), Config::new()).await.unwrap();
        client
            .ping(&Context::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        let id = timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(server.conn_count(), 0);
        assert!(id > 0);

        client.close().unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_keepalive_exhaustion_notifies_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (server, addr, _) = start(
            Config::new()
                .with_periodic_interval(Duration::from_millis(10))
                .with_keepalive(3, Duration::from_millis(50), move |conn| {
                    let _ = tx.send(conn.id());
                    let _ = conn.close();
                }),
        )
        .await;

        // a peer that never answers probes
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut req = Message::new(MessageType::NonConfirmable, Code::GET, 1);
        req.token = Bytes::from_static(b"k");
        silent
            .send_to(&req.encode(1152).unwrap(), addr)
            .await
            .unwrap();

        timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        let mut probes = 0;
        while let Some((msg, _)) = recv_message(&silent, Duration::from_millis(50)).await {
            if msg.is_empty() && msg.is_confirmable() {
                probes += 1;
            }
        }
        assert!(probes >= 3, "expected at least 3 probes, saw {probes}");

        server.stop();
    }

    #[tokio::test]
    async fn test_answered_keepalive_keeps_conn() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let (server, addr, _) = start(
            Config::new()
                .with_periodic_interval(Duration::from_millis(10))
                .with_keepalive(2, Duration::from_millis(50), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .await;

        let client = dial(&addr.to_string(), Config::new()).await.unwrap();
        client
            .ping(&Context::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(server.conn_count(), 1);

        client.close().unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_new_conn_reuses_until_closed() {
        let (s1, _, _) = start(Config::new()).await;
        let (s2, s2_addr, _) = start(Config::new()).await;
        let ctx = Context::with_timeout(Duration::from_secs(5));

        let conn = s1.new_conn(s2_addr).unwrap();
        conn.ping(&ctx).await.unwrap();
        assert_eq!(s1.new_conn(s2_addr).unwrap().id(), conn.id());

        conn.close().unwrap();
        let fresh = s1.new_conn(s2_addr).unwrap();
        assert_ne!(fresh.id(), conn.id());
        fresh.ping(&ctx).await.unwrap();

        s1.stop();
        s2.stop();
    }

    #[tokio::test]
    async fn test_stop_closes_conns_before_returning() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let (server, addr, serving) = start(Config::new().with_on_new_conn(move |conn| {
            let counter = counter.clone();
            conn.add_on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }))
        .await;

        let client = dial(&addr.to_string(), Config::new()).await.unwrap();
        client
            .ping(&Context::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(server.conn_count(), 1);

        server.stop();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(server.conn_count(), 0);

        let served = timeout(Duration::from_secs(2), serving).await.unwrap().unwrap();
        assert!(served.is_ok());
        assert!(server.local_addr().is_none());

        // stop is idempotent and serve on a stopped server returns at once
        server.stop();
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(server.serve(Arc::new(transport)).await.is_ok());
        assert!(matches!(
            server.new_conn(addr),
            Err(SessionError::ServerStopped)
        ));

        client.close().unwrap();
    }

    #[tokio::test]
    async fn test_serve_twice_and_not_serving() {
        let idle = Server::new(Config::new());
        assert!(matches!(
            idle.new_conn("127.0.0.1:5683".parse().unwrap()),
            Err(SessionError::NotServing)
        ));

        let (server, _, _) = start(Config::new()).await;
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(matches!(
            server.serve(Arc::new(transport)).await,
            Err(SessionError::AlreadyServing)
        ));
        server.stop();
    }

    #[tokio::test]
    async fn test_duplicate_request_over_the_wire() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (server, addr, _) = start(Config::new().with_handler(
            move |w: &mut ResponseWriter, _req: &PooledMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
                w.set_response(Code::CHANGED, media_type::TEXT_PLAIN, "ok");
            },
        ))
        .await;

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut req = Message::new(MessageType::Confirmable, Code::POST, 0x4242);
        req.token = Bytes::from_static(b"dup");
        req.set_path("/increment");
        let datagram = req.encode(1152).unwrap();

        raw.send_to(&datagram, addr).await.unwrap();
        let (first, _) = recv_message(&raw, Duration::from_secs(2)).await.unwrap();
        raw.send_to(&datagram, addr).await.unwrap();
        let (second, _) = recv_message(&raw, Duration::from_secs(2)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first.typ, MessageType::Acknowledgement);
        assert_eq!(first.message_id, 0x4242);
        assert_eq!(&first.payload[..], b"ok");

        server.stop();
    }

    #[tokio::test]
    async fn test_retransmission_is_bounded() {
        let silent = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let reader = {
            let silent = silent.clone();
            tokio::spawn(async move {
                let mut arrivals = Vec::new();
                while let Some((msg, at)) = recv_message(&silent, Duration::from_millis(600)).await {
                    arrivals.push((msg.message_id, at));
                }
                arrivals
            })
        };
        let conn = dial(
            &silent.local_addr().unwrap().to_string(),
            Config::new()
                .with_periodic_interval(Duration::from_millis(10))
                .with_transmission(TransmissionParams {
                    ack_timeout: Duration::from_millis(50),
                    ..TransmissionParams::default()
                }),
        )
        .await
        .unwrap();

        let err = conn
            .ping(&Context::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DeliveryFailed { attempts: 4 }));

        let arrivals = reader.await.unwrap();
        assert_eq!(arrivals.len(), 4);
        assert!(arrivals.iter().all(|(mid, _)| *mid == arrivals[0].0));

        let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1].1 - w[0].1).collect();
        assert!(gaps.windows(2).all(|g| g[1] >= g[0]), "gaps {gaps:?}");
        assert_eq!(conn.stats().unacknowledged, 0);

        conn.close().unwrap();
    }

    #[tokio::test]
    async fn test_custom_dispatch_wraps_handler() {
        use futures::FutureExt;

        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = dispatched.clone();
        let (server, addr, _) = start(
            Config::new()
                .with_handler(|w: &mut ResponseWriter, _req: &PooledMessage| {
                    w.set_response(Code::CONTENT, media_type::TEXT_PLAIN, "wrapped");
                })
                .with_process_received_message(move |msg, conn, handler| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        conn.process_received_message_with_handler(msg, handler.as_ref())
                            .await;
                    }
                    .boxed()
                }),
        )
        .await;

        let conn = dial(&addr.to_string(), Config::new()).await.unwrap();
        let ctx = Context::with_timeout(Duration::from_secs(5));
        for _ in 0..3 {
            let resp = conn
                .do_request(&ctx, conn.new_get_request("/x"))
                .await
                .unwrap();
            assert_eq!(&resp.payload[..], b"wrapped");
        }
        assert_eq!(dispatched.load(Ordering::SeqCst), 3);

        conn.close().unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_inactivity_and_keepalive_together() {
        let inactive = Arc::new(AtomicUsize::new(0));
        let exhausted = Arc::new(AtomicUsize::new(0));
        let (server, addr, _) = {
            let inactive = inactive.clone();
            let exhausted = exhausted.clone();
            start(
                Config::new()
                    .with_periodic_interval(Duration::from_millis(10))
                    .with_inactivity_monitor(Duration::from_millis(150), move |_| {
                        inactive.fetch_add(1, Ordering::SeqCst);
                    })
                    .with_keepalive(2, Duration::from_millis(40), move |_| {
                        exhausted.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .await
        };

        // a peer that never answers probes; callbacks leave the conn open
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut req = Message::new(MessageType::NonConfirmable, Code::GET, 1);
        req.token = Bytes::from_static(b"b");
        silent
            .send_to(&req.encode(1152).unwrap(), addr)
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while inactive.load(Ordering::SeqCst) == 0 || exhausted.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "monitors did not fire");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(inactive.load(Ordering::SeqCst), 1);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(server.conn_count(), 1);

        server.stop();
    }

    #[tokio::test]
    async fn test_oversized_limit_is_bounded() {
        let mut config = Config::new();
        config.max_message_size = usize::MAX;
        let (server, addr, handle) = start(config).await;

        let client = dial(&addr.to_string(), Config::new()).await.unwrap();
        client
            .ping(&Context::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!handle.is_finished());

        client.close().unwrap();
        server.stop();
    }
}
