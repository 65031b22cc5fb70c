use super::event_loop::{Command, EventLoopHandle};
use super::ChannelFuture;
use crate::error::Error;
use mio::Token;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Token(0) is the event loop waker.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Connected TCP stream.
    Stream,
    /// Listening TCP socket.
    Listener,
    /// UDP socket, connected or not.
    Datagram,
}

struct ChannelInner {
    id: ChannelId,
    kind: ChannelKind,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    event_loop: EventLoopHandle,
    open: AtomicBool,
    active: AtomicBool,
    close_future: ChannelFuture,
}

/// Handle to a socket owned by one event loop.
///
/// All operations are asynchronous requests to the owning loop and may be
/// called from any thread. Equality and hashing use the [`ChannelId`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        kind: ChannelKind,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
        event_loop: EventLoopHandle,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                kind,
                local_addr,
                remote_addr,
                event_loop,
                open: AtomicBool::new(true),
                active: AtomicBool::new(false),
                close_future: ChannelFuture::new(),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Peer of a stream or connected datagram socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Open until closed by either side.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Open and ready for I/O (TLS handshake complete).
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Completes once the owning loop has released the socket.
    pub fn close_future(&self) -> ChannelFuture {
        self.inner.close_future.clone()
    }

    /// Queues `data` behind earlier writes on this channel.
    pub fn write(&self, data: Vec<u8>) -> ChannelFuture {
        self.submit_write(data, None)
    }

    /// Sends `data` as one datagram to `target`.
    pub fn write_to(&self, data: Vec<u8>, target: SocketAddr) -> ChannelFuture {
        self.submit_write(data, Some(target))
    }

    fn submit_write(&self, data: Vec<u8>, target: Option<SocketAddr>) -> ChannelFuture {
        if !self.is_open() {
            return ChannelFuture::failed(Arc::new(Error::ChannelClosed));
        }
        let promise = ChannelFuture::new();
        let command = Command::Write {
            id: self.id(),
            data,
            target,
            promise: promise.clone(),
        };
        if let Err(command) = self.inner.event_loop.submit(command) {
            command.fail(Arc::new(Error::EventLoopTerminated));
        }
        promise
    }

    /// Requests the close; the channel stops being active immediately.
    /// Idempotent.
    pub fn close(&self) -> ChannelFuture {
        self.inner.active.store(false, Ordering::Release);
        if self.inner.open.swap(false, Ordering::AcqRel) {
            let command = Command::Close { id: self.id() };
            if self.inner.event_loop.submit(command).is_err() {
                self.inner.close_future.set_success(None);
            }
        }
        self.close_future()
    }

    /// Fires a [`ReadTimeout`](Error::ReadTimeout) through the pipeline when
    /// nothing is read for `timeout`. `None` disarms. The timer is one-shot.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        let command = Command::SetReadTimeout {
            id: self.id(),
            timeout,
        };
        // A terminated loop has already closed the channel.
        let _ = self.inner.event_loop.submit(command);
    }

    pub(crate) fn mark_active(&self) {
        if self.is_open() {
            self.inner.active.store(true, Ordering::Release);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.open.store(false, Ordering::Release);
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.remote_addr {
            Some(remote) => write!(f, "[{} {} -> {}]", self.inner.id, self.inner.local_addr, remote),
            None => write!(f, "[{} {}]", self.inner.id, self.inner.local_addr),
        }
    }
}
