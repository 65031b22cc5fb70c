use crate::config::{EndpointConfiguration, ListenerConfiguration, Protocol};
use crate::error::{Error, SharedError};
use crate::executor::{Scheduler, TaskHandle};
use crate::transport::{self, socket, Channel, ChannelFuture, ChildInit, EventLoopGroup};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const WAIT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Opens producer channels to one target.
pub(crate) struct Connector {
    pub(crate) boss: Arc<EventLoopGroup>,
    pub(crate) workers: Arc<EventLoopGroup>,
    pub(crate) configuration: ListenerConfiguration,
    pub(crate) target: SocketAddr,
    pub(crate) connectionless: bool,
    pub(crate) child: ChildInit,
}

impl Connector {
    /// TCP connects to the target. UDP binds an ephemeral socket, connected
    /// to the target unless sending connectionless.
    pub(crate) fn open(&self) -> ChannelFuture {
        match self.configuration.protocol {
            Protocol::Tcp => transport::connect(
                &self.boss,
                &self.workers,
                &self.configuration,
                self.target,
                self.child.clone(),
            ),
            Protocol::Udp => {
                let peer = (!self.connectionless).then_some(self.target);
                transport::bind_datagram(
                    &self.workers,
                    &self.configuration,
                    socket::unspecified_for(self.target),
                    peer,
                    self.child.clone(),
                )
                .unwrap_or_else(|err| ChannelFuture::failed(Arc::new(err)))
            }
        }
    }

    pub(crate) fn target(&self) -> SocketAddr {
        self.target
    }
}

// ============================================================================
// Pool Settings
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
    pub(crate) enabled: bool,
    /// 0 is unbounded.
    pub(crate) max_total: usize,
    pub(crate) max_idle: usize,
    pub(crate) min_idle: usize,
    pub(crate) min_evictable_idle: Option<Duration>,
    pub(crate) eviction_interval: Duration,
    pub(crate) block_when_exhausted: bool,
    pub(crate) max_wait: Option<Duration>,
}

impl PoolSettings {
    pub(crate) fn from_configuration(config: &EndpointConfiguration) -> Self {
        let millis = |value: u64| (value > 0).then(|| Duration::from_millis(value));
        Self {
            enabled: config.producer_pool_enabled,
            max_total: config.producer_pool_max_total,
            max_idle: config.producer_pool_max_idle,
            min_idle: config.producer_pool_min_idle,
            min_evictable_idle: millis(config.producer_pool_min_evictable_idle_millis),
            eviction_interval: Duration::from_millis(config.producer_pool_eviction_interval_millis),
            block_when_exhausted: config.producer_pool_block_when_exhausted,
            max_wait: millis(config.producer_pool_max_wait_millis),
        }
    }

    /// Whether the pool needs periodic work on a [`Scheduler`].
    pub(crate) fn needs_maintenance(&self) -> bool {
        self.enabled && (self.evicts() || self.expires_waiters())
    }

    fn evicts(&self) -> bool {
        self.min_evictable_idle.is_some() || self.min_idle > 0
    }

    fn expires_waiters(&self) -> bool {
        self.max_total > 0 && self.block_when_exhausted && self.max_wait.is_some()
    }

    fn has_capacity(&self, total: usize) -> bool {
        self.max_total == 0 || total < self.max_total
    }
}

// ============================================================================
// ChannelPool
// ============================================================================

struct IdleChannel {
    channel: Channel,
    since: Instant,
}

struct Waiter {
    promise: ChannelFuture,
    deadline: Option<Instant>,
}

enum Borrow {
    Ready(ChannelFuture),
    /// A slot is reserved; open a channel for it.
    Open,
}

#[derive(Default)]
struct PoolState {
    /// Most recently returned last.
    idle: Vec<IdleChannel>,
    /// Channels opening, borrowed or idle.
    total: usize,
    /// Opens started to restore `min_idle`.
    warming: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

/// Channels available for reuse by the producer.
///
/// With pooling enabled, every channel the pool opens counts against
/// `max_total` until it closes. Borrowers beyond the cap either fail with
/// [`Error::PoolExhausted`] or queue for the next released channel, up to
/// `max_wait`. Up to `max_idle` returned channels are kept, validated on
/// borrow and closed by the evictor once idle for `min_evictable_idle`, as
/// long as `min_idle` remain.
///
/// Without pooling one channel is shared for as long as it stays active and
/// none of the limits apply.
pub(crate) struct ChannelPool {
    connector: Connector,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    shared: Mutex<Option<ChannelFuture>>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl ChannelPool {
    pub(crate) fn new(connector: Connector, settings: PoolSettings) -> Self {
        Self {
            connector,
            settings,
            state: Mutex::new(PoolState::default()),
            shared: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn connector(&self) -> &Connector {
        &self.connector
    }

    fn address(&self) -> String {
        self.connector.configuration.address()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap()
    }

    /// Runs idle eviction and waiter expiry on `scheduler`, and opens the
    /// first `min_idle` channels.
    pub(crate) fn schedule_maintenance(self: &Arc<Self>, scheduler: &Scheduler) {
        if !self.settings.needs_maintenance() {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();
        if self.settings.evicts() {
            let pool = Arc::downgrade(self);
            tasks.push(scheduler.schedule_at_fixed_rate(self.settings.eviction_interval, move || {
                if let Some(pool) = pool.upgrade() {
                    pool.evict();
                }
            }));
        }
        if self.settings.expires_waiters() {
            let pool = Arc::downgrade(self);
            tasks.push(scheduler.schedule_at_fixed_rate(WAIT_CHECK_INTERVAL, move || {
                if let Some(pool) = pool.upgrade() {
                    pool.expire_waiters();
                }
            }));
        }
        drop(tasks);
        if self.settings.min_idle > 0 {
            self.evict();
        }
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> ChannelFuture {
        if !self.settings.enabled {
            return self.acquire_shared();
        }
        let mut stale = Vec::new();
        let borrowed = {
            let mut state = self.lock();
            self.borrow(&mut state, &mut stale)
        };
        // Closing may run close listeners inline, which take the pool lock.
        for channel in stale {
            channel.close();
        }
        match borrowed {
            Borrow::Ready(future) => future,
            Borrow::Open => self.open_counted(),
        }
    }

    fn borrow(&self, state: &mut PoolState, stale: &mut Vec<Channel>) -> Borrow {
        if state.closed {
            return Borrow::Ready(ChannelFuture::failed(Arc::new(Error::ChannelClosed)));
        }
        while let Some(idle) = state.idle.pop() {
            if idle.channel.is_active() {
                trace!(channel = %idle.channel.id(), "Reusing pooled channel");
                return Borrow::Ready(ChannelFuture::succeeded(Some(idle.channel)));
            }
            debug!(channel = %idle.channel.id(), "Discarding inactive pooled channel");
            stale.push(idle.channel);
        }
        if self.settings.has_capacity(state.total) {
            state.total += 1;
            return Borrow::Open;
        }
        if !self.settings.block_when_exhausted {
            debug!(total = state.total, "Producer pool exhausted");
            return Borrow::Ready(ChannelFuture::failed(Arc::new(Error::PoolExhausted {
                address: self.address(),
                max_total: self.settings.max_total,
            })));
        }
        let promise = ChannelFuture::new();
        state.waiters.push_back(Waiter {
            promise: promise.clone(),
            deadline: self.settings.max_wait.map(|wait| Instant::now() + wait),
        });
        debug!(waiting = state.waiters.len(), "Producer pool exhausted, waiting for a channel");
        Borrow::Ready(promise)
    }

    fn acquire_shared(&self) -> ChannelFuture {
        if self.lock().closed {
            return ChannelFuture::failed(Arc::new(Error::ChannelClosed));
        }
        let mut shared = self.shared.lock().unwrap();
        if let Some(future) = shared.as_ref() {
            let usable = !future.is_done() || future.channel().is_some_and(|channel| channel.is_active());
            if usable {
                return future.clone();
            }
        }
        let future = self.connector.open();
        *shared = Some(future.clone());
        future
    }

    /// Opens a channel whose slot in `total` is already reserved. The slot
    /// is freed when the open fails or the channel closes.
    fn open_counted(self: &Arc<Self>) -> ChannelFuture {
        let future = self.connector.open();
        let pool = Arc::downgrade(self);
        future.add_listener(move |opened| {
            match opened.channel().filter(|_| opened.is_success()) {
                Some(channel) => {
                    channel
                        .close_future()
                        .add_listener(move |_| ChannelPool::slot_freed(&pool));
                }
                None => ChannelPool::slot_freed(&pool),
            }
        });
        future
    }

    fn slot_freed(pool: &Weak<Self>) {
        let Some(pool) = pool.upgrade() else {
            return;
        };
        let mut state = pool.lock();
        state.total = state.total.saturating_sub(1);
        let mut granted = Vec::new();
        while !state.closed && pool.settings.has_capacity(state.total) {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.total += 1;
            granted.push(waiter.promise);
        }
        drop(state);

        for promise in granted {
            trace!("Opening channel for waiting exchange");
            pool.open_counted().add_listener(move |opened| forward(opened, &promise));
        }
    }

    /// Returns `channel` after an exchange completed: to the longest waiting
    /// borrower, else to the idle set, else it is closed.
    pub(crate) fn release(&self, channel: &Channel) {
        self.return_channel(channel, false);
    }

    /// `warmed` channels were opened by the evictor and leave `warming` in
    /// the same step, so no evictor run counts them twice or not at all.
    fn return_channel(&self, channel: &Channel, warmed: bool) {
        if !self.settings.enabled {
            return;
        }
        let mut state = self.lock();
        if warmed {
            state.warming = state.warming.saturating_sub(1);
        }
        if channel.is_active() && !state.closed {
            if let Some(waiter) = state.waiters.pop_front() {
                drop(state);
                trace!(channel = %channel.id(), "Handing channel to waiting exchange");
                waiter.promise.set_success(Some(channel.clone()));
                return;
            }
            if state.idle.len() < self.settings.max_idle && !state.idle.iter().any(|idle| &idle.channel == channel) {
                state.idle.push(IdleChannel {
                    channel: channel.clone(),
                    since: Instant::now(),
                });
                return;
            }
        }
        drop(state);
        channel.close();
    }

    /// Closes channels idle for too long, then opens channels until
    /// `min_idle` are idle or opening.
    fn evict(self: &Arc<Self>) {
        let (evicted, needed) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let mut evicted = Vec::new();
            let (active, stale): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.idle).into_iter().partition(|idle| idle.channel.is_active());
            state.idle = active;
            evicted.extend(stale.into_iter().map(|idle| idle.channel));

            if let Some(limit) = self.settings.min_evictable_idle {
                let now = Instant::now();
                // Oldest first.
                while state.idle.len() > self.settings.min_idle
                    && state.idle.first().is_some_and(|idle| now.duration_since(idle.since) >= limit)
                {
                    evicted.push(state.idle.remove(0).channel);
                }
            }

            let mut needed = self
                .settings
                .min_idle
                .saturating_sub(state.idle.len() + state.warming);
            if self.settings.max_total > 0 {
                needed = needed.min(self.settings.max_total.saturating_sub(state.total));
            }
            state.total += needed;
            state.warming += needed;
            (evicted, needed)
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicting idle pooled channels");
        }
        for channel in evicted {
            channel.close();
        }
        for _ in 0..needed {
            self.warm();
        }
    }

    fn warm(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        self.open_counted().add_listener(move |opened| {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            match (opened.cause(), opened.channel()) {
                (None, Some(channel)) => pool.return_channel(&channel, true),
                (cause, _) => {
                    let mut state = pool.lock();
                    state.warming = state.warming.saturating_sub(1);
                    drop(state);
                    if let Some(cause) = cause {
                        warn!(%cause, "Cannot open idle pooled channel");
                    }
                }
            }
        });
    }

    fn expire_waiters(&self) {
        let now = Instant::now();
        let expired = {
            let mut state = self.lock();
            let (expired, waiting): (VecDeque<Waiter>, VecDeque<Waiter>) = std::mem::take(&mut state.waiters)
                .into_iter()
                .partition(|waiter| waiter.deadline.is_some_and(|deadline| deadline <= now));
            state.waiters = waiting;
            expired
        };
        if expired.is_empty() {
            return;
        }
        let millis = self.settings.max_wait.map_or(0, |wait| wait.as_millis() as u64);
        info!(count = expired.len(), millis, "Exchanges timed out waiting for a pooled channel");
        let cause: SharedError = Arc::new(Error::PoolWaitTimeout {
            address: self.address(),
            millis,
        });
        for waiter in expired {
            waiter.promise.set_failure(Arc::clone(&cause));
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    /// Channels opening, borrowed or idle.
    pub(crate) fn total_count(&self) -> usize {
        self.lock().total
    }

    /// Exchanges queued for a channel.
    pub(crate) fn waiting_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Stops handing out channels, closes the idle ones and fails queued
    /// borrowers.
    pub(crate) fn close(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.cancel();
        }
        let (idle, waiters) = {
            let mut state = self.lock();
            state.closed = true;
            (std::mem::take(&mut state.idle), std::mem::take(&mut state.waiters))
        };
        for idle in idle {
            idle.channel.close();
        }
        let cause: SharedError = Arc::new(Error::ChannelClosed);
        for waiter in waiters {
            waiter.promise.set_failure(Arc::clone(&cause));
        }
        let shared = self.shared.lock().unwrap().take();
        if let Some(channel) = shared.and_then(|future| future.channel()) {
            channel.close();
        }
    }
}

fn forward(opened: &ChannelFuture, promise: &ChannelFuture) {
    match opened.cause() {
        Some(cause) => promise.set_failure(cause),
        None => promise.set_success(opened.channel()),
    };
}
