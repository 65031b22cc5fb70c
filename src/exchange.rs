//! The message carrier handed to [`ConnectionManager::send`](crate::ConnectionManager::send).

use crate::error::SharedError;
use crate::transport::Channel;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Per-message override of the reply read timeout, in milliseconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "sockbridge.request_timeout";

/// Per-message override of `disconnect`: `true` closes the channel once the
/// exchange completes.
pub const CLOSE_CHANNEL_HEADER: &str = "sockbridge.close_channel";

/// Per-message override of `reuse_channel`: `true` keeps the channel bound to
/// the exchange, so later sends of the same exchange use it, until
/// [`ConnectionManager::release_channel`](crate::ConnectionManager::release_channel).
pub const REUSE_CHANNEL_HEADER: &str = "sockbridge.reuse_channel";

/// Completion callback. The argument is `done_sync`: `true` when the callback
/// runs before `send` returns without any I/O having been started.
pub type AsyncCallback = Box<dyn FnOnce(bool) + Send>;

/// Whether the sender expects a reply. An `InOnly` exchange is sent
/// fire-and-forget even on a `sync` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    InOnly,
    #[default]
    InOut,
}

#[derive(Debug, Default)]
struct ExchangeData {
    pattern: ExchangePattern,
    body: Option<Vec<u8>>,
    headers: HashMap<String, String>,
    exception: Option<SharedError>,
    channel: Option<Channel>,
}

/// Shared, cloneable message exchange.
///
/// Clones refer to the same exchange: the producer writes the reply body or
/// the failure into the exchange the caller still holds.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    inner: Arc<Mutex<ExchangeData>>,
}

impl Exchange {
    pub fn new(pattern: ExchangePattern) -> Self {
        let exchange = Self::default();
        exchange.lock().pattern = pattern;
        exchange
    }

    /// Request/reply exchange carrying `body`.
    pub fn in_out(body: impl Into<Vec<u8>>) -> Self {
        let exchange = Self::new(ExchangePattern::InOut);
        exchange.set_body(body);
        exchange
    }

    /// One-way exchange carrying `body`.
    pub fn in_only(body: impl Into<Vec<u8>>) -> Self {
        let exchange = Self::new(ExchangePattern::InOnly);
        exchange.set_body(body);
        exchange
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeData> {
        self.inner.lock().unwrap()
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.lock().pattern
    }

    pub fn body(&self) -> Option<Vec<u8>> {
        self.lock().body.clone()
    }

    /// Body as UTF-8 text, lossily converted.
    pub fn body_text(&self) -> Option<String> {
        self.lock()
            .body
            .as_deref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
    }

    pub fn set_body(&self, body: impl Into<Vec<u8>>) {
        self.lock().body = Some(body.into());
    }

    pub fn clear_body(&self) {
        self.lock().body = None;
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.lock().headers.get(name).cloned()
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().headers.insert(name.into(), value.into());
    }

    /// Header parsed as a boolean; unparsable values count as absent.
    pub fn header_bool(&self, name: &str) -> Option<bool> {
        self.header(name).and_then(|value| value.trim().parse().ok())
    }

    /// Header parsed as a millisecond duration; unparsable values count as absent.
    pub fn header_millis(&self, name: &str) -> Option<Duration> {
        self.header(name)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    pub fn exception(&self) -> Option<SharedError> {
        self.lock().exception.clone()
    }

    pub fn set_exception(&self, cause: SharedError) {
        self.lock().exception = Some(cause);
    }

    /// Records `cause` unless a failure is already recorded. Returns whether
    /// it was recorded.
    pub fn set_exception_if_absent(&self, cause: SharedError) -> bool {
        let mut data = self.lock();
        if data.exception.is_some() {
            return false;
        }
        data.exception = Some(cause);
        true
    }

    pub fn is_failed(&self) -> bool {
        self.lock().exception.is_some()
    }

    /// Channel held for this exchange by channel reuse.
    pub fn bound_channel(&self) -> Option<Channel> {
        self.lock().channel.clone()
    }

    pub(crate) fn bind_channel(&self, channel: Channel) {
        self.lock().channel = Some(channel);
    }

    pub(crate) fn take_bound_channel(&self) -> Option<Channel> {
        self.lock().channel.take()
    }

    /// Whether the sender waits for a reply: the endpoint is `sync` and the
    /// exchange is `InOut`.
    pub fn expects_reply(&self, sync: bool) -> bool {
        sync && self.pattern() == ExchangePattern::InOut
    }

    /// Whether the channel stays bound after this exchange completes.
    pub fn reuses_channel(&self, default: bool) -> bool {
        self.header_bool(REUSE_CHANNEL_HEADER).unwrap_or(default)
    }

    /// Whether the channel is closed once this exchange completes. Never
    /// while the channel is bound for reuse; the release decides then.
    pub fn closes_channel(&self, disconnect: bool, reuse: bool) -> bool {
        !self.reuses_channel(reuse) && self.header_bool(CLOSE_CHANNEL_HEADER).unwrap_or(disconnect)
    }
}
