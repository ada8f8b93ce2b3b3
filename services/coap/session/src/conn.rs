//! Per-peer connection over a connectionless transport.
//!
//! A [`Conn`] owns everything the engine knows about one remote address:
//! pending exchanges, the deduplication cache, unacknowledged confirmable
//! messages, the inbound queue and its worker, and the monitor state.
//!
//! ## Lifecycle
//!
//! ```text
//! Active ──close()──▶ Closing ──▶ Closed
//! ```
//!
//! `close()` drains the retransmission scheduler, fails pending exchanges
//! with `ConnectionClosed`, stops the worker, runs the close callbacks in
//! registration order and finally signals `done()`.

use crate::config::Config;
use crate::context::Context;
use crate::dedup::{DedupCache, DedupOutcome};
use crate::error::{Result, SessionError};
use crate::exchange::{ExchangeTracker, Registration};
use crate::monitor::{InactivityState, KeepaliveAction, KeepaliveState};
use crate::multicast::DiscoveryRegistry;
use crate::periodic::{JobId, PeriodicJob, PeriodicRunner};
use crate::pool::PooledMessage;
use crate::retransmit::{AckKind, RetransmitScheduler};
use crate::transport::PacketConn;
use async_trait::async_trait;
use bytes::Bytes;
use coap_wire::{Code, Message, MessageType};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Normal operation
    Active = 0,
    /// Close in progress
    Closing = 1,
    /// Terminal
    Closed = 2,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Active,
            1 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Request handler, run on the connection worker
pub trait Handler: Send + Sync {
    /// Handle one request; the response is set through `w`
    fn handle(&self, w: &mut ResponseWriter, req: &PooledMessage);
}

impl<F> Handler for F
where
    F: Fn(&mut ResponseWriter, &PooledMessage) + Send + Sync,
{
    fn handle(&self, w: &mut ResponseWriter, req: &PooledMessage) {
        self(w, req)
    }
}

/// Collects the handler's response
pub struct ResponseWriter {
    conn: Conn,
    response: Option<Message>,
}

impl ResponseWriter {
    /// Empty writer for a request arriving on `conn`
    pub fn new(conn: Conn) -> Self {
        Self {
            conn,
            response: None,
        }
    }

    /// Connection the request arrived on
    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    /// Set code, content format and body of the response
    pub fn set_response(&mut self, code: Code, content_format: u16, body: impl Into<Bytes>) {
        let response = self.response_mut();
        response.code = code;
        response.set_content_format(content_format);
        response.payload = body.into();
    }

    /// Set only the response code
    pub fn set_code(&mut self, code: Code) {
        self.response_mut().code = code;
    }

    /// Response under construction, created on first access
    pub fn response_mut(&mut self) -> &mut Message {
        self.response
            .get_or_insert_with(|| Message::new(MessageType::NonConfirmable, Code::CONTENT, 0))
    }

    /// Response set so far
    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    fn into_response(self) -> Option<Message> {
        self.response
    }
}

/// Connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    /// Datagrams processed
    pub datagrams_in: u64,
    /// Datagrams written to the transport
    pub datagrams_out: u64,
    /// Retransmissions of confirmable messages
    pub retransmissions: u64,
    /// Duplicate confirmable messages absorbed
    pub duplicates: u64,
    /// Datagrams dropped because the inbound queue was full
    pub dropped: u64,
    /// Requests awaiting a response
    pub pending_exchanges: usize,
    /// Confirmable messages awaiting acknowledgment
    pub unacknowledged: usize,
}

#[derive(Debug, Default)]
struct Counters {
    datagrams_in: AtomicU64,
    datagrams_out: AtomicU64,
    retransmissions: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
}

type OnCloseFn = Box<dyn FnOnce() + Send>;

pub(crate) struct ConnInner {
    id: u64,
    remote: SocketAddr,
    transport: Arc<dyn PacketConn>,
    config: Config,
    state: AtomicU8,
    next_message_id: AtomicU16,
    exchanges: ExchangeTracker,
    dedup: DedupCache,
    retransmit: RetransmitScheduler,
    queue: Mutex<Option<mpsc::Sender<PooledMessage>>>,
    last_activity: Mutex<Instant>,
    inactivity: Mutex<InactivityState>,
    keepalive: Mutex<KeepaliveState>,
    on_close: Mutex<Vec<OnCloseFn>>,
    done: watch::Sender<bool>,
    runner: PeriodicRunner,
    job: Mutex<Option<JobId>>,
    discovery: Option<Arc<DiscoveryRegistry>>,
    stats: Counters,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a per-peer connection; cheap to clone
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// Removes a blocking call's registrations however the call ends
struct PendingGuard<'a> {
    inner: &'a ConnInner,
    registration: Option<Registration>,
    message_id: Option<u16>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(registration) = &self.registration {
            self.inner.exchanges.cancel(registration);
        }
        if let Some(message_id) = self.message_id {
            self.inner.retransmit.cancel(message_id);
        }
    }
}

impl Conn {
    /// Create a connection and start its worker. Requires a tokio runtime.
    pub(crate) fn new(
        remote: SocketAddr,
        transport: Arc<dyn PacketConn>,
        config: Config,
        runner: PeriodicRunner,
        discovery: Option<Arc<DiscoveryRegistry>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.received_message_queue_size.max(1));
        let (done, _) = watch::channel(false);

        let inner = Arc::new(ConnInner {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            transport,
            dedup: DedupCache::new(config.dedup_window()),
            retransmit: RetransmitScheduler::new(config.transmission),
            config,
            state: AtomicU8::new(ConnState::Active as u8),
            next_message_id: AtomicU16::new(rand::random()),
            exchanges: ExchangeTracker::new(),
            queue: Mutex::new(Some(tx)),
            last_activity: Mutex::new(Instant::now()),
            inactivity: Mutex::new(InactivityState::default()),
            keepalive: Mutex::new(KeepaliveState::default()),
            on_close: Mutex::new(Vec::new()),
            done,
            runner,
            job: Mutex::new(None),
            discovery,
            stats: Counters::default(),
        });

        let conn = Conn { inner };
        let job = conn
            .inner
            .runner
            .register(Arc::new(ConnJob(Arc::downgrade(&conn.inner))));
        *lock(&conn.inner.job) = Some(job);

        tokio::spawn(run_worker(Arc::downgrade(&conn.inner), rx));
        debug!(peer = %remote, conn_id = conn.inner.id, "Connection created");
        conn
    }

    /// Remote peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Local address of the underlying transport
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the connection accepts new work
    pub fn is_active(&self) -> bool {
        self.state() == ConnState::Active
    }

    /// Whether close has been initiated
    pub fn is_closed(&self) -> bool {
        !self.is_active()
    }

    /// Snapshot of the connection counters
    pub fn stats(&self) -> ConnStats {
        let c = &self.inner.stats;
        ConnStats {
            datagrams_in: c.datagrams_in.load(Ordering::Relaxed),
            datagrams_out: c.datagrams_out.load(Ordering::Relaxed),
            retransmissions: c.retransmissions.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            pending_exchanges: self.inner.exchanges.len(),
            unacknowledged: self.inner.retransmit.len(),
        }
    }

    /// Allocate the next message id
    pub fn next_message_id(&self) -> u16 {
        self.inner.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Confirmable GET for `path` with a fresh message id and token
    pub fn new_get_request(&self, path: &str) -> Message {
        self.new_request(Code::GET, path)
    }

    /// Confirmable request for `path` with a fresh message id and token
    pub fn new_request(&self, code: Code, path: &str) -> Message {
        let mut req = Message::new(MessageType::Confirmable, code, self.next_message_id());
        req.token = new_token();
        req.set_path(path);
        req
    }

    /// Send a message without waiting for a response.
    ///
    /// The message id is used as given. A confirmable message is
    /// retransmitted until acknowledged; its delivery failure is logged.
    /// A confirmable message whose id is still in flight is refused with
    /// `MessageIdInUse`.
    pub async fn write_message(&self, msg: Message) -> Result<()> {
        self.ensure_active()?;
        let datagram = self.encode(&msg)?;

        if msg.is_confirmable() {
            let peer = self.inner.remote;
            let message_id = msg.message_id;
            self.inner.retransmit.try_arm(
                message_id,
                datagram.clone(),
                Instant::now(),
                Box::new(move |res| {
                    if let Err(err @ SessionError::DeliveryFailed { .. }) = res {
                        warn!(peer = %peer, message_id, error = %err, "Confirmable message not delivered");
                    }
                }),
            )?;
            if let Err(err) = self.transmit(&datagram).await {
                self.inner.retransmit.cancel(message_id);
                return Err(err);
            }
        } else {
            self.transmit(&datagram).await?;
        }

        self.touch();
        Ok(())
    }

    /// Send a request and wait for its response.
    ///
    /// A fresh message id is assigned, and a token when the request has
    /// none. Returns when the response arrives, `ctx` ends, or the
    /// connection closes; on every path the exchange is unregistered.
    /// Fails with `TokenInUse` while another request with the same token
    /// is pending on this connection.
    pub async fn do_request(&self, ctx: &Context, mut req: Message) -> Result<PooledMessage> {
        self.ensure_active()?;
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        req.message_id = self.next_message_id();
        if req.token.is_empty() {
            req.token = new_token();
        }
        let datagram = self.encode(&req)?;

        let (registration, rx) = self.inner.exchanges.register(req.token.clone())?;
        let mut guard = PendingGuard {
            inner: &self.inner,
            registration: Some(registration.clone()),
            message_id: None,
        };

        if req.is_confirmable() {
            let weak = Arc::downgrade(&self.inner);
            self.inner.retransmit.arm(
                req.message_id,
                datagram.clone(),
                Instant::now(),
                Box::new(move |res| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match res {
                        Ok(AckKind::Ack) => {}
                        Ok(AckKind::Reset) => {
                            inner
                                .exchanges
                                .fail_registration(&registration, SessionError::PeerReset);
                        }
                        Err(err) => {
                            inner.exchanges.fail_registration(&registration, err);
                        }
                    }
                }),
            );
            guard.message_id = Some(req.message_id);
        }

        // close may have drained before the registrations above
        self.ensure_active()?;

        self.transmit(&datagram).await?;
        self.touch();

        tokio::select! {
            res = rx => match res {
                Ok(result) => result,
                Err(_) => Err(SessionError::ConnectionClosed),
            },
            err = ctx.done() => {
                debug!(peer = %self.inner.remote, error = %err, "Request abandoned");
                Err(err)
            }
        }
    }

    /// Send an empty confirmable message; succeeds on ACK or RST
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.ensure_active()?;
        let message_id = self.next_message_id();
        let datagram = self.encode(&Message::empty(MessageType::Confirmable, message_id))?;

        let (tx, rx) = oneshot::channel();
        self.inner.retransmit.arm(
            message_id,
            datagram.clone(),
            Instant::now(),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        let _guard = PendingGuard {
            inner: &self.inner,
            registration: None,
            message_id: Some(message_id),
        };
        self.ensure_active()?;

        self.transmit(&datagram).await?;
        self.touch();

        tokio::select! {
            res = rx => match res {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(SessionError::ConnectionClosed),
            },
            err = ctx.done() => Err(err),
        }
    }

    /// Full inbound pipeline for one decoded message
    pub async fn process_received_message(&self, msg: PooledMessage) {
        self.inner.stats.datagrams_in.fetch_add(1, Ordering::Relaxed);
        self.touch();

        match msg.typ {
            MessageType::Acknowledgement | MessageType::Reset => {
                let kind = if msg.typ == MessageType::Reset {
                    AckKind::Reset
                } else {
                    AckKind::Ack
                };
                self.inner.retransmit.acknowledge(msg.message_id, kind);
                if kind == AckKind::Ack && !msg.is_empty() {
                    self.handle_response(msg).await;
                }
                return;
            }
            MessageType::Confirmable => {
                match self.inner.dedup.check(msg.message_id, Instant::now()) {
                    DedupOutcome::Fresh => {}
                    DedupOutcome::Duplicate(reply) => {
                        self.inner.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            peer = %self.inner.remote,
                            message_id = msg.message_id,
                            resend = reply.is_some(),
                            "Duplicate confirmable message"
                        );
                        if let Some(reply) = reply {
                            if let Err(err) = self.transmit(&reply).await {
                                debug!(peer = %self.inner.remote, error = %err, "Failed to resend reply");
                            }
                        }
                        return;
                    }
                }
            }
            MessageType::NonConfirmable => {}
        }

        if msg.is_empty() {
            if msg.is_confirmable() {
                // ping
                let message_id = msg.message_id;
                self.send_reply(&Message::empty(MessageType::Reset, message_id), Some(message_id))
                    .await;
            }
            return;
        }

        if msg.code.is_response() {
            self.handle_response(msg).await;
        } else if msg.code.is_request() {
            let process = self.inner.config.process_received_message.clone();
            let handler = self.inner.config.handler.clone();
            process(msg, self.clone(), handler).await;
        } else if msg.is_confirmable() {
            let message_id = msg.message_id;
            debug!(peer = %self.inner.remote, code = %msg.code, "Rejecting message with unknown code class");
            self.send_reply(&Message::empty(MessageType::Reset, message_id), Some(message_id))
                .await;
        }
    }

    /// Run `handler` for a request and send its response.
    ///
    /// A confirmable request is answered with a piggybacked ACK (empty when
    /// the handler set nothing); a non-confirmable one with a NON response,
    /// or not at all.
    pub async fn process_received_message_with_handler(
        &self,
        req: PooledMessage,
        handler: &dyn Handler,
    ) {
        let mut w = ResponseWriter::new(self.clone());
        handler.handle(&mut w, &req);
        let response = w.into_response();

        if req.is_confirmable() {
            let mut reply = response
                .unwrap_or_else(|| Message::empty(MessageType::Acknowledgement, req.message_id));
            reply.typ = MessageType::Acknowledgement;
            reply.message_id = req.message_id;
            if !reply.is_empty() {
                reply.token = req.token.clone();
            }
            self.send_reply(&reply, Some(req.message_id)).await;
        } else if let Some(mut reply) = response {
            reply.typ = MessageType::NonConfirmable;
            reply.message_id = self.next_message_id();
            reply.token = req.token.clone();
            self.send_reply(&reply, None).await;
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(
                ConnState::Active as u8,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        if let Some(job) = lock(&self.inner.job).take() {
            self.inner.runner.unregister(job);
        }
        let drained = self.inner.retransmit.drain();
        let failed = self.inner.exchanges.fail_all();
        // dropping the sender ends the worker; queued messages return to the pool
        lock(&self.inner.queue).take();

        self.inner
            .state
            .store(ConnState::Closed as u8, Ordering::Release);
        let callbacks = std::mem::take(&mut *lock(&self.inner.on_close));
        for cb in callbacks {
            cb();
        }
        self.inner.done.send_replace(true);

        info!(
            peer = %self.inner.remote,
            conn_id = self.inner.id,
            drained,
            failed,
            "Connection closed"
        );
        Ok(())
    }

    /// Register a callback run once when the connection closes.
    ///
    /// On an already closed connection the callback runs immediately.
    pub fn add_on_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = lock(&self.inner.on_close);
        if self.state() == ConnState::Closed {
            drop(callbacks);
            f();
            return;
        }
        callbacks.push(Box::new(f));
    }

    /// Wait until the connection is closed
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Hand a received message to the worker; drops it when the queue is full
    pub(crate) fn enqueue(&self, msg: PooledMessage) -> bool {
        let tx = match lock(&self.inner.queue).as_ref() {
            Some(tx) => tx.clone(),
            None => return false,
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    peer = %self.inner.remote,
                    message_id = msg.message_id,
                    "Inbound queue full, dropping datagram"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn handle_response(&self, msg: PooledMessage) {
        let confirmable = msg.is_confirmable();
        let message_id = msg.message_id;

        let matched = match self.inner.exchanges.resolve(msg) {
            Ok(()) => true,
            Err(msg) => match &self.inner.discovery {
                Some(registry) => registry.dispatch(self, msg).is_ok(),
                None => false,
            },
        };
        if !matched {
            debug!(peer = %self.inner.remote, message_id, "Unmatched response");
        }

        if confirmable {
            let typ = if matched {
                MessageType::Acknowledgement
            } else {
                MessageType::Reset
            };
            self.send_reply(&Message::empty(typ, message_id), Some(message_id))
                .await;
        }
    }

    /// Periodic work: retransmissions, dedup purge, monitors
    async fn check_timeouts(&self, now: Instant) -> bool {
        if !self.is_active() {
            return false;
        }

        for datagram in self.inner.retransmit.tick(now) {
            self.inner
                .stats
                .retransmissions
                .fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.transmit(&datagram).await {
                debug!(peer = %self.inner.remote, error = %err, "Retransmission failed");
            }
        }
        self.inner.dedup.purge(now);

        let last_activity = *lock(&self.inner.last_activity);

        if let Some(cfg) = &self.inner.config.inactivity {
            let fire = lock(&self.inner.inactivity).check(last_activity, now, cfg.timeout);
            if fire {
                info!(peer = %self.inner.remote, timeout = ?cfg.timeout, "Connection inactive");
                (cfg.on_inactive)(self);
            }
        }

        if !self.is_active() {
            return false;
        }

        if let Some(cfg) = &self.inner.config.keepalive {
            let (action, stale, failures) = {
                let mut state = lock(&self.inner.keepalive);
                let before = state.outstanding();
                let action = state.poll(now, last_activity, cfg);
                let stale = if state.outstanding().is_none() { before } else { None };
                (action, stale, state.failures())
            };
            if let Some(message_id) = stale {
                self.inner.retransmit.cancel(message_id);
            }

            match action {
                KeepaliveAction::Idle => {}
                KeepaliveAction::Probe => self.send_probe(now).await,
                KeepaliveAction::Exhausted => {
                    warn!(peer = %self.inner.remote, failures, "Keepalive exhausted");
                    (cfg.on_inactive)(self);
                    if self.is_active() {
                        self.send_probe(now).await;
                    }
                }
            }
        }

        self.is_active()
    }

    async fn send_probe(&self, now: Instant) {
        let message_id = self.next_message_id();
        let datagram = match self.encode(&Message::empty(MessageType::Confirmable, message_id)) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!(error = %err, "Failed to encode keepalive probe");
                return;
            }
        };

        lock(&self.inner.keepalive).probe_sent(message_id, now);
        let weak = Arc::downgrade(&self.inner);
        self.inner.retransmit.arm(
            message_id,
            datagram.clone(),
            now,
            Box::new(move |res| {
                if res.is_ok() {
                    if let Some(inner) = weak.upgrade() {
                        lock(&inner.keepalive).probe_answered(message_id);
                    }
                }
            }),
        );

        if let Err(err) = self.transmit(&datagram).await {
            debug!(peer = %self.inner.remote, error = %err, "Keepalive probe not sent");
        }
    }

    async fn send_reply(&self, reply: &Message, dedup_id: Option<u16>) {
        let datagram = match self.encode(reply) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!(peer = %self.inner.remote, error = %err, "Failed to encode reply");
                return;
            }
        };
        if let Some(message_id) = dedup_id {
            self.inner.dedup.record_reply(message_id, datagram.clone());
        }
        if let Err(err) = self.transmit(&datagram).await {
            debug!(peer = %self.inner.remote, error = %err, "Failed to send reply");
        }
    }

    async fn transmit(&self, datagram: &[u8]) -> Result<()> {
        self.inner
            .transport
            .send_to(datagram, self.inner.remote)
            .await?;
        self.inner
            .stats
            .datagrams_out
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn encode(&self, msg: &Message) -> Result<Bytes> {
        Ok(msg.encode(self.inner.config.max_message_size)?)
    }

    fn touch(&self) {
        *lock(&self.inner.last_activity) = Instant::now();
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SessionError::ConnectionClosed)
        }
    }
}

async fn run_worker(conn: Weak<ConnInner>, mut rx: mpsc::Receiver<PooledMessage>) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = conn.upgrade() else {
            break;
        };
        let conn = Conn { inner };
        if !conn.is_active() {
            break;
        }
        conn.process_received_message(msg).await;
    }
    debug!("Connection worker stopped");
}

struct ConnJob(Weak<ConnInner>);

#[async_trait]
impl PeriodicJob for ConnJob {
    async fn tick(&self, now: Instant) -> bool {
        match self.0.upgrade() {
            Some(inner) => Conn { inner }.check_timeouts(now).await,
            None => false,
        }
    }
}

/// Random 8-byte token
pub fn new_token() -> Bytes {
    Bytes::copy_from_slice(&rand::random::<[u8; 8]>())
}
