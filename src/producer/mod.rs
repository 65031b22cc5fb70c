//! Producer side: sending exchanges over outbound connections.

mod handler;
mod pool;

use crate::bootstrap::{ExecutionContext, ExecutionPools};
use crate::codec::textline_body;
use crate::config::{EndpointConfiguration, Protocol};
use crate::correlation::{ChannelCorrelationManager, CorrelationManager, PendingExchange};
use crate::error::Error;
use crate::exchange::{AsyncCallback, Exchange, CLOSE_CHANNEL_HEADER, REQUEST_TIMEOUT_HEADER};
use crate::executor::{Scheduler, ThreadFactory};
use crate::lifecycle::{Lifecycle, ServiceState, StateCell, Step, Transition};
use crate::pipeline::{CodecChain, DefaultPipelineFactory, TlsMode};
use crate::registry::ChannelGroup;
use crate::tls::{PemTlsContextProvider, TlsContextProvider};
use crate::transport::{Channel, ChannelFuture, ChildInit};
use futures::channel::oneshot;
use handler::ClientChannelHandler;
use pool::{ChannelPool, Connector, PoolSettings};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, trace, warn, Level};

// ============================================================================
// Builder
// ============================================================================

pub struct ConnectionManagerBuilder {
    name: String,
    configuration: EndpointConfiguration,
    correlation: Option<Arc<dyn CorrelationManager>>,
    context: ExecutionContext,
    codecs: CodecChain,
    tls_provider: Option<Arc<dyn TlsContextProvider>>,
    threads: Option<ThreadFactory>,
}

impl ConnectionManagerBuilder {
    /// Defaults to one request per channel
    /// ([`ChannelCorrelationManager`]).
    pub fn with_correlation_manager(mut self, correlation: Arc<dyn CorrelationManager>) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_execution_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Codec stages placed after the line decoder of textline mode.
    pub fn with_codecs(mut self, codecs: CodecChain) -> Self {
        self.codecs = codecs;
        self
    }

    /// Overrides the PEM files named in the configuration when `ssl` is set.
    pub fn with_tls_provider(mut self, provider: Arc<dyn TlsContextProvider>) -> Self {
        self.tls_provider = Some(provider);
        self
    }

    pub fn with_thread_factory(mut self, threads: ThreadFactory) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn build(self) -> ConnectionManager {
        let threads = self
            .threads
            .or_else(|| self.context.thread_factory.clone())
            .unwrap_or_default();
        let correlation = self
            .correlation
            .unwrap_or_else(|| Arc::new(ChannelCorrelationManager::new()));
        ConnectionManager {
            inner: Arc::new(ManagerInner {
                name: self.name,
                configuration: self.configuration,
                correlation,
                context: self.context,
                codecs: self.codecs,
                tls_provider: self.tls_provider,
                threads,
                state: StateCell::new(),
                running: Mutex::new(None),
            }),
        }
    }
}

// ============================================================================
// ConnectionManager
// ============================================================================

struct Running {
    pools: ExecutionPools,
    channels: Arc<ChannelPool>,
    group: ChannelGroup,
    maintenance: Option<Scheduler>,
}

struct ManagerInner {
    name: String,
    configuration: EndpointConfiguration,
    correlation: Arc<dyn CorrelationManager>,
    context: ExecutionContext,
    codecs: CodecChain,
    tls_provider: Option<Arc<dyn TlsContextProvider>>,
    threads: ThreadFactory,
    state: StateCell,
    running: Mutex<Option<Running>>,
}

/// Sends exchanges to one remote endpoint.
///
/// [`send`](Self::send) never blocks: it hands the payload to an event loop
/// and reports the outcome through the callback. In sync mode an `InOut`
/// exchange completes once the correlated reply (or a failure) arrives;
/// `InOnly` exchanges and every exchange of a non-sync endpoint complete
/// once the write does.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn builder(name: impl Into<String>, configuration: EndpointConfiguration) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            name: name.into(),
            configuration,
            correlation: None,
            context: ExecutionContext::default(),
            codecs: CodecChain::new(),
            tls_provider: None,
            threads: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn configuration(&self) -> &EndpointConfiguration {
        &self.inner.configuration
    }

    pub fn correlation_manager(&self) -> &Arc<dyn CorrelationManager> {
        &self.inner.correlation
    }

    /// Address of the remote endpoint while started.
    pub fn target(&self) -> Option<SocketAddr> {
        self.inner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|running| running.channels.connector().target())
    }

    /// Open channels owned by this producer.
    pub fn open_channels(&self) -> usize {
        self.inner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |running| running.group.len())
    }

    fn pool(&self) -> Option<Arc<ChannelPool>> {
        self.inner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|running| Arc::clone(&running.channels))
    }

    /// Idle channels waiting in the pool.
    pub fn idle_channels(&self) -> usize {
        self.pool().map_or(0, |pool| pool.idle_count())
    }

    /// Pooled channels counted against `producer_pool_max_total`: opening,
    /// borrowed or idle.
    pub fn pooled_channels(&self) -> usize {
        self.pool().map_or(0, |pool| pool.total_count())
    }

    /// Exchanges queued until a pooled channel is released.
    pub fn waiting_exchanges(&self) -> usize {
        self.pool().map_or(0, |pool| pool.waiting_count())
    }

    /// Ends channel reuse for `exchange`: its bound channel goes back to the
    /// pool, or is closed when the exchange or endpoint asks for a
    /// disconnect.
    pub fn release_channel(&self, exchange: &Exchange) {
        let Some(channel) = exchange.take_bound_channel() else {
            return;
        };
        let close = exchange
            .header_bool(CLOSE_CHANNEL_HEADER)
            .unwrap_or(self.inner.configuration.disconnect);
        match self.pool() {
            Some(pool) if !close => {
                trace!(channel = %channel.id(), "Releasing reused channel");
                pool.release(&channel);
            }
            _ => {
                debug!(channel = %channel.id(), "Closing reused channel on release");
                channel.close();
            }
        }
    }

    /// Sends the body of `exchange`. Returns `done_sync`: true when
    /// `callback` already ran before returning without any I/O.
    ///
    /// Failures are stored on the exchange, never returned.
    pub fn send(&self, exchange: &Exchange, callback: AsyncCallback) -> bool {
        self.inner.send(exchange, callback)
    }

    /// Sends `exchange` and resolves once it completes, with the reply body
    /// set on the returned exchange in sync mode.
    pub async fn request(&self, exchange: Exchange) -> Result<Exchange, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(
            &exchange,
            Box::new(move |done_sync| {
                let _ = tx.send(done_sync);
            }),
        );
        rx.await.map_err(|_| Error::ChannelClosed)?;
        match exchange.exception() {
            Some(cause) => Err(Error::Shared(cause)),
            None => Ok(exchange),
        }
    }
}

impl Lifecycle for ConnectionManager {
    #[instrument(skip(self), fields(name = %self.inner.name))]
    fn start(&self) -> Result<(), Error> {
        let previous = match self.inner.state.begin(Transition::Start)? {
            Step::Noop => return Ok(()),
            Step::Proceed(previous) => previous,
        };
        match self.inner.open() {
            Ok(running) => {
                *self.inner.running.lock().unwrap() = Some(running);
                self.inner.state.finish(Transition::Start);
                info!(address = %self.inner.configuration.address(), "Producer started");
                Ok(())
            }
            Err(err) => {
                self.inner.state.abort(previous);
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(name = %self.inner.name))]
    fn stop(&self) -> Result<(), Error> {
        if self.inner.state.begin(Transition::Stop)? == Step::Noop {
            return Ok(());
        }
        let running = self.inner.running.lock().unwrap().take();
        if let Some(running) = running {
            running.channels.close();
            if let Some(maintenance) = running.maintenance {
                maintenance.shutdown();
            }
            if let Err(err) = running.group.close().await_done() {
                warn!(%err, "Error closing producer channels");
            }
            self.inner.correlation.stop();
            running.pools.release();
        }
        self.inner.state.finish(Transition::Stop);
        info!("Producer stopped");
        Ok(())
    }

    fn suspend(&self) -> Result<(), Error> {
        if matches!(self.inner.state.begin(Transition::Suspend)?, Step::Proceed(_)) {
            self.inner.state.finish(Transition::Suspend);
        }
        Ok(())
    }

    fn resume(&self) -> Result<(), Error> {
        if matches!(self.inner.state.begin(Transition::Resume)?, Step::Proceed(_)) {
            self.inner.state.finish(Transition::Resume);
        }
        Ok(())
    }

    fn state(&self) -> ServiceState {
        self.inner.state.get()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Err(err) = Lifecycle::stop(self) {
            debug!(%err, "Producer stop on drop failed");
        }
    }
}

// ============================================================================
// Start and Send
// ============================================================================

impl ManagerInner {
    fn open(&self) -> Result<Running, Error> {
        let config = &self.configuration;
        let target = config.listener.resolve()?;
        let pools = ExecutionPools::acquire(&self.context, &self.threads, &config.listener)?;
        match self.open_with(&pools, target) {
            Ok((channels, group, maintenance)) => Ok(Running {
                pools,
                channels,
                group,
                maintenance,
            }),
            Err(err) => {
                pools.release();
                Err(err)
            }
        }
    }

    fn open_with(
        &self,
        pools: &ExecutionPools,
        target: SocketAddr,
    ) -> Result<(Arc<ChannelPool>, ChannelGroup, Option<Scheduler>), Error> {
        let config = &self.configuration;
        let factory = self.pipeline_factory()?;
        self.correlation.start()?;

        let group = ChannelGroup::new(self.name.clone());
        let mut groups = vec![group.clone()];
        groups.extend(self.context.channel_group.clone());
        let connector = Connector {
            boss: Arc::clone(pools.boss()),
            workers: Arc::clone(pools.workers()),
            configuration: config.listener.clone(),
            target,
            connectionless: config.listener.protocol == Protocol::Udp && config.udp_connectionless_sending,
            child: ChildInit {
                factory: Arc::new(factory),
                groups,
            },
        };

        if !config.lazy_channel_creation {
            let future = connector.open();
            if let Err(cause) = future.await_done() {
                self.correlation.stop();
                return Err(Error::ConnectFailed {
                    address: config.address(),
                    source: Some(cause),
                });
            }
            if let Some(channel) = future.channel() {
                debug!(channel = %channel.id(), "Eager connection check succeeded");
                let _ = channel.close().await_done();
            }
        }

        let settings = PoolSettings::from_configuration(config);
        let maintenance = if settings.needs_maintenance() {
            match Scheduler::new("pool-maintenance", &self.threads) {
                Ok(scheduler) => Some(scheduler),
                Err(err) => {
                    self.correlation.stop();
                    return Err(err);
                }
            }
        } else {
            None
        };
        let channels = Arc::new(ChannelPool::new(connector, settings));
        if let Some(scheduler) = &maintenance {
            channels.schedule_maintenance(scheduler);
        }
        Ok((channels, group, maintenance))
    }

    fn pipeline_factory(&self) -> Result<DefaultPipelineFactory, Error> {
        let config = &self.configuration;
        let mut codecs = CodecChain::from_configuration(config);
        codecs.decoders.extend(self.codecs.decoders.iter().cloned());
        codecs.encoders.extend(self.codecs.encoders.iter().cloned());

        let handler = Arc::new(ClientChannelHandler {
            correlation: Arc::clone(&self.correlation),
            address: config.address(),
            sync: config.sync,
            disconnect: config.disconnect,
            disconnect_on_no_reply: config.disconnect_on_no_reply,
            reuse_channel: config.reuse_channel,
        });
        let factory = DefaultPipelineFactory::new(codecs, handler);
        if !config.listener.ssl {
            return Ok(factory);
        }
        let provider: Arc<dyn TlsContextProvider> = match &self.tls_provider {
            Some(provider) => Arc::clone(provider),
            None => Arc::new(PemTlsContextProvider::from_configuration(&config.listener)?),
        };
        let server_name = config
            .listener
            .tls_server_name
            .clone()
            .unwrap_or_else(|| config.listener.host.clone());
        Ok(factory.with_tls(provider, TlsMode::Client { server_name }))
    }

    fn send(self: &Arc<Self>, exchange: &Exchange, callback: AsyncCallback) -> bool {
        let config = &self.configuration;
        let channels = match self.state.get() {
            ServiceState::Started => self
                .running
                .lock()
                .unwrap()
                .as_ref()
                .map(|running| Arc::clone(&running.channels)),
            _ => None,
        };
        let Some(channels) = channels else {
            debug!(name = %self.name, state = %self.state.get(), "Rejecting exchange");
            exchange.set_exception(Arc::new(Error::Rejected {
                target: self.name.clone(),
            }));
            callback(true);
            return true;
        };

        let Some(body) = exchange.body().filter(|body| !body.is_empty()) else {
            log_no_payload(config.no_reply_log_level, &config.address());
            callback(true);
            return true;
        };
        let body = if config.textline {
            match textline_body(&body, config.charset, config.delimiter, config.auto_append_delimiter) {
                Ok(body) => body,
                Err(err) => {
                    exchange.set_exception(Arc::new(err));
                    callback(true);
                    return true;
                }
            }
        } else {
            body
        };

        let bound = exchange
            .bound_channel()
            .filter(|channel| exchange.reuses_channel(config.reuse_channel) && channel.is_active());
        let acquired = match bound {
            Some(channel) => {
                trace!(channel = %channel.id(), "Sending on channel bound to exchange");
                ChannelFuture::succeeded(Some(channel))
            }
            None => channels.acquire(),
        };

        let this = Arc::clone(self);
        let exchange = exchange.clone();
        acquired.add_listener(move |future| this.channel_ready(future, exchange, body, callback, channels));
        false
    }

    fn channel_ready(
        self: Arc<Self>,
        future: &ChannelFuture,
        exchange: Exchange,
        body: Vec<u8>,
        callback: AsyncCallback,
        pool: Arc<ChannelPool>,
    ) {
        let config = &self.configuration;
        let channel = match (future.cause(), future.channel()) {
            (None, Some(channel)) => channel,
            (Some(cause), _) if matches!(*cause, Error::PoolExhausted { .. } | Error::PoolWaitTimeout { .. }) => {
                info!(address = %config.address(), %cause, "No pooled channel, failing exchange");
                exchange.set_exception(cause);
                callback(false);
                return;
            }
            (cause, _) => {
                info!(address = %config.address(), "Cannot connect, failing exchange");
                exchange.set_exception(Arc::new(Error::ConnectFailed {
                    address: config.address(),
                    source: cause,
                }));
                callback(false);
                return;
            }
        };

        let expects_reply = exchange.expects_reply(config.sync);
        if expects_reply {
            let timeout = exchange.header_millis(REQUEST_TIMEOUT_HEADER).or_else(|| {
                if self.correlation.manages_timeouts() {
                    None
                } else {
                    config.request_timeout()
                }
            });
            if timeout.is_some() {
                channel.set_read_timeout(timeout);
            }
        }

        let target = pool.connector().target();
        let callback: AsyncCallback = if exchange.reuses_channel(config.reuse_channel) {
            // Borrowed until release_channel.
            exchange.bind_channel(channel.clone());
            callback
        } else {
            let released = channel.clone();
            Box::new(move |done_sync| {
                pool.release(&released);
                callback(done_sync);
            })
        };
        let state = Arc::new(PendingExchange::new(exchange.clone(), body.clone(), callback));
        if expects_reply {
            if let Err(err) = self.correlation.put_state(&channel, Arc::clone(&state)) {
                warn!(channel = %channel.id(), %err, "Cannot register pending exchange");
                state.fail_once(Arc::new(err), false);
                return;
            }
        }

        trace!(channel = %channel.id(), len = body.len(), "Writing exchange");
        let write = match channel.remote_addr() {
            // Connectionless datagram socket
            None => channel.write_to(body, target),
            Some(_) => channel.write(body),
        };
        let this = Arc::clone(&self);
        write.add_listener(move |write| this.write_done(write, &channel, &exchange, &state, expects_reply));
    }

    fn write_done(
        &self,
        write: &ChannelFuture,
        channel: &Channel,
        exchange: &Exchange,
        state: &Arc<PendingExchange>,
        expects_reply: bool,
    ) {
        if let Some(cause) = write.cause() {
            warn!(channel = %channel.id(), %cause, "Write failed");
            self.correlation.discard_state(channel, state);
            channel.close();
            state.fail_once(cause, false);
            return;
        }
        if expects_reply {
            return;
        }
        let config = &self.configuration;
        if exchange.closes_channel(config.disconnect, config.reuse_channel) {
            debug!(channel = %channel.id(), "Closing channel after write");
            channel.close();
        }
        state.complete(false);
    }
}

fn log_no_payload(level: Level, address: &str) {
    let message = "No payload to send, completing exchange";
    if level == Level::ERROR {
        error!(address, "{message}");
    } else if level == Level::WARN {
        warn!(address, "{message}");
    } else if level == Level::INFO {
        info!(address, "{message}");
    } else if level == Level::DEBUG {
        debug!(address, "{message}");
    } else {
        trace!(address, "{message}");
    }
}
