use crate::error::SharedError;
use crate::exchange::{AsyncCallback, Exchange};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::trace;

/// An in-flight request: the exchange, its completion callback and the
/// payload that was sent.
///
/// Whatever path completes it first (reply, I/O error, timeout, shutdown)
/// wins; every later attempt is a no-op. The callback runs at most once.
pub struct PendingExchange {
    exchange: Exchange,
    request: Vec<u8>,
    correlation_id: Mutex<Option<String>>,
    callback: Mutex<Option<AsyncCallback>>,
    done: AtomicBool,
    failed: AtomicBool,
}

impl PendingExchange {
    pub fn new(exchange: Exchange, request: Vec<u8>, callback: AsyncCallback) -> Self {
        Self {
            exchange,
            request,
            correlation_id: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
            done: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Payload as written to the channel.
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.correlation_id.lock().unwrap().clone()
    }

    pub fn set_correlation_id(&self, id: impl Into<String>) {
        *self.correlation_id.lock().unwrap() = Some(id.into());
    }

    /// Whether the callback has fired.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Fires the callback unless it already fired. Returns whether this call
    /// fired it.
    pub fn complete(&self, done_sync: bool) -> bool {
        self.resolve(done_sync, |_| {})
    }

    /// Sets the reply body and completes, unless already completed.
    pub fn complete_with_reply(&self, body: Vec<u8>) -> bool {
        self.resolve(false, |exchange| exchange.set_body(body))
    }

    /// Records `cause` on the exchange and completes. Returns whether this
    /// call completed the exchange; a losing call leaves the exchange as the
    /// winner set it.
    pub fn fail_once(&self, cause: SharedError, done_sync: bool) -> bool {
        self.resolve(done_sync, |exchange| {
            if !self.failed.swap(true, Ordering::AcqRel) {
                exchange.set_exception_if_absent(cause);
            }
        })
    }

    fn resolve(&self, done_sync: bool, outcome: impl FnOnce(&Exchange)) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        outcome(&self.exchange);
        // Taken out of the lock so the callback may touch this state again.
        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            trace!(done_sync, "Completing exchange");
            callback(done_sync);
        }
        true
    }
}

impl fmt::Debug for PendingExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingExchange")
            .field("correlation_id", &self.correlation_id())
            .field("request_len", &self.request.len())
            .field("done", &self.is_done())
            .field("failed", &self.failed.load(Ordering::Acquire))
            .finish()
    }
}
