//! Message pool with explicit takeover.
//!
//! Received messages are handed out as [`PooledMessage`]s. Dropping one
//! returns its shell (option storage included) to the pool; calling
//! [`PooledMessage::hijack`] transfers ownership to the caller and the pool
//! never sees that message again.

use coap_wire::{Message, MessageType};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Default number of idle shells kept for reuse
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle shells currently held
    pub idle: usize,
    /// Messages handed out
    pub acquired: u64,
    /// Messages returned to the pool
    pub recycled: u64,
    /// Messages taken over by their consumer
    pub hijacked: u64,
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Message>>,
    capacity: usize,
    acquired: AtomicU64,
    recycled: AtomicU64,
    hijacked: AtomicU64,
}

/// Shared recycling pool of message shells
#[derive(Debug, Clone)]
pub struct MessagePool {
    inner: Arc<PoolInner>,
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl MessagePool {
    /// Create a pool keeping at most `capacity` idle shells
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                capacity,
                acquired: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
                hijacked: AtomicU64::new(0),
            }),
        }
    }

    /// Take a cleared message from the pool
    pub fn acquire(&self) -> PooledMessage {
        let msg = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(blank);
        self.wrap(msg)
    }

    /// Put an existing message under pool ownership
    pub fn wrap(&self, msg: Message) -> PooledMessage {
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        PooledMessage {
            msg,
            pool: self.clone(),
            hijacked: false,
        }
    }

    fn release(&self, mut msg: Message) {
        msg.reset();
        self.inner.recycled.fetch_add(1, Ordering::Relaxed);
        let mut free = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.inner.capacity {
            free.push(msg);
        }
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self
                .inner
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            recycled: self.inner.recycled.load(Ordering::Relaxed),
            hijacked: self.inner.hijacked.load(Ordering::Relaxed),
        }
    }
}

fn blank() -> Message {
    Message::empty(MessageType::NonConfirmable, 0)
}

/// A message owned by the pool until dropped or hijacked
pub struct PooledMessage {
    msg: Message,
    pool: MessagePool,
    hijacked: bool,
}

impl PooledMessage {
    /// Take ownership of the message; it will not be recycled
    pub fn hijack(mut self) -> Message {
        self.hijacked = true;
        self.pool.inner.hijacked.fetch_add(1, Ordering::Relaxed);
        std::mem::replace(&mut self.msg, blank())
    }

    /// Pool this message returns to
    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }
}

impl Deref for PooledMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.msg
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.msg
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        if !self.hijacked {
            let msg = std::mem::replace(&mut self.msg, blank());
            self.pool.release(msg);
        }
    }
}

impl fmt::Debug for PooledMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.msg.fmt(f)
    }
}
