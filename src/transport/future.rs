use super::Channel;
use crate::error::SharedError;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Listener = Box<dyn FnOnce(&ChannelFuture) + Send>;

#[derive(Default)]
struct FutureState {
    outcome: Option<Result<(), SharedError>>,
    channel: Option<Channel>,
    listeners: Vec<Listener>,
}

struct FutureInner {
    state: Mutex<FutureState>,
    done: Condvar,
}

/// Set-once outcome of a bind, connect, write or close.
///
/// Listeners run exactly once, on the thread that completes the future, or
/// immediately on the registering thread if it is already complete. Do not
/// block on a future from an event loop thread.
#[derive(Clone)]
pub struct ChannelFuture {
    inner: Arc<FutureInner>,
}

impl ChannelFuture {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState::default()),
                done: Condvar::new(),
            }),
        }
    }

    pub fn succeeded(channel: Option<Channel>) -> Self {
        let future = Self::new();
        future.set_success(channel);
        future
    }

    pub fn failed(cause: SharedError) -> Self {
        let future = Self::new();
        future.set_failure(cause);
        future
    }

    pub(crate) fn set_success(&self, channel: Option<Channel>) -> bool {
        self.complete(Ok(()), channel)
    }

    pub(crate) fn set_failure(&self, cause: SharedError) -> bool {
        self.complete(Err(cause), None)
    }

    fn complete(&self, outcome: Result<(), SharedError>, channel: Option<Channel>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.channel = channel;
            self.inner.done.notify_all();
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener(self);
        }
        true
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&ChannelFuture) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_none() {
                state.listeners.push(Box::new(listener));
                return;
            }
        }
        listener(self);
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.state.lock().unwrap().outcome, Some(Ok(())))
    }

    pub fn cause(&self) -> Option<SharedError> {
        match &self.inner.state.lock().unwrap().outcome {
            Some(Err(cause)) => Some(Arc::clone(cause)),
            _ => None,
        }
    }

    /// The bound or connected channel, once the future succeeded.
    pub fn channel(&self) -> Option<Channel> {
        self.inner.state.lock().unwrap().channel.clone()
    }

    /// Blocks until the future completes.
    pub fn await_done(&self) -> Result<(), SharedError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self.inner.done.wait(state).unwrap();
        }
    }

    /// Blocks until the future completes or `timeout` elapses; `None` on
    /// timeout.
    pub fn await_timeout(&self, timeout: Duration) -> Option<Result<(), SharedError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.inner.done.wait_timeout(state, deadline - now).unwrap().0;
        }
    }
}

impl fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ChannelFuture")
            .field("outcome", &state.outcome)
            .field("channel", &state.channel.as_ref().map(Channel::id))
            .finish()
    }
}

/// Completion of a [`ChannelGroup::close`](crate::ChannelGroup::close).
#[derive(Debug, Clone, Default)]
pub struct ChannelGroupFuture {
    futures: Vec<ChannelFuture>,
}

impl ChannelGroupFuture {
    pub(crate) fn new(futures: Vec<ChannelFuture>) -> Self {
        Self { futures }
    }

    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.futures.iter().all(ChannelFuture::is_done)
    }

    /// Blocks until every member completes; returns the first failure.
    pub fn await_done(&self) -> Result<(), SharedError> {
        let mut first_failure = None;
        for future in &self.futures {
            if let Err(cause) = future.await_done() {
                first_failure.get_or_insert(cause);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Returns `false` if some member is still pending after `timeout`.
    pub fn await_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.futures.iter().all(|future| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            future.await_timeout(remaining).is_some()
        })
    }
}
