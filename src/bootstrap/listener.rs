use super::execution::{ExecutionContext, ExecutionPools};
use super::Consumer;
use crate::config::{ListenerConfiguration, Protocol};
use crate::error::Error;
use crate::executor::ThreadFactory;
use crate::lifecycle::{ServiceState, StateCell, Step, Transition};
use crate::pipeline::PipelineFactory;
use crate::registry::ChannelGroup;
use crate::transport::{self, socket, Channel, ChildInit};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

struct Settings {
    context: ExecutionContext,
    threads: ThreadFactory,
    configuration: ListenerConfiguration,
    pipeline_factory: Arc<dyn PipelineFactory>,
}

struct Running {
    pools: ExecutionPools,
    group: ChannelGroup,
    channel: Option<Channel>,
}

/// Bind/unbind machinery shared by both factory flavours.
pub(crate) struct ListenerBootstrap {
    state: StateCell,
    settings: Mutex<Option<Settings>>,
    running: Mutex<Option<Running>>,
}

impl ListenerBootstrap {
    pub(crate) fn new() -> Self {
        Self {
            state: StateCell::new(),
            settings: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    pub(crate) fn init(
        &self,
        context: Option<ExecutionContext>,
        threads: Option<ThreadFactory>,
        configuration: ListenerConfiguration,
        pipeline_factory: Arc<dyn PipelineFactory>,
    ) -> Result<(), Error> {
        let (context, threads) = match (context, threads) {
            (None, None) => return Err(Error::MissingExecutionContext),
            (Some(context), Some(threads)) => (context, threads),
            (Some(context), None) => {
                let threads = context.thread_factory.clone().unwrap_or_default();
                (context, threads)
            }
            (None, Some(threads)) => (ExecutionContext::default(), threads),
        };
        debug!(address = %configuration.address(), "Initialised bootstrap factory");
        *self.settings.lock().unwrap() = Some(Settings {
            context,
            threads,
            configuration,
            pipeline_factory,
        });
        Ok(())
    }

    pub(crate) fn is_initialised(&self) -> bool {
        self.settings.lock().unwrap().is_some()
    }

    pub(crate) fn configuration(&self) -> Option<ListenerConfiguration> {
        self.settings
            .lock()
            .unwrap()
            .as_ref()
            .map(|settings| settings.configuration.clone())
    }

    /// Name of the first setting in which `consumer` differs from the
    /// initialised listener.
    pub(crate) fn first_difference(&self, consumer: &Consumer) -> Option<&'static str> {
        let settings = self.settings.lock().unwrap();
        let settings = settings.as_ref()?;
        if let Some(field) = settings.configuration.first_difference(&consumer.configuration) {
            return Some(field);
        }
        let same_factory = std::ptr::addr_eq(
            Arc::as_ptr(&settings.pipeline_factory),
            Arc::as_ptr(&consumer.pipeline_factory),
        );
        (!same_factory).then_some("pipeline_factory")
    }

    pub(crate) fn state(&self) -> ServiceState {
        self.state.get()
    }

    pub(crate) fn channel(&self) -> Option<Channel> {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|running| running.channel.clone())
    }

    pub(crate) fn local_address(&self) -> Option<SocketAddr> {
        self.channel().map(|channel| channel.local_addr())
    }

    #[instrument(skip(self))]
    pub(crate) fn start(&self) -> Result<(), Error> {
        let previous = match self.state.begin(Transition::Start)? {
            Step::Noop => return Ok(()),
            Step::Proceed(previous) => previous,
        };
        match self.bind_fresh() {
            Ok(running) => {
                *self.running.lock().unwrap() = Some(running);
                self.state.finish(Transition::Start);
                Ok(())
            }
            Err(err) => {
                self.state.abort(previous);
                Err(err)
            }
        }
    }

    fn bind_fresh(&self) -> Result<Running, Error> {
        let settings = self.settings.lock().unwrap();
        let settings = settings.as_ref().ok_or(Error::InvalidState {
            operation: "start",
            state: ServiceState::Created,
        })?;
        let pools = ExecutionPools::acquire(&settings.context, &settings.threads, &settings.configuration)?;
        let group = ChannelGroup::new(settings.configuration.address());
        match bind_channel(settings, &pools, &group) {
            Ok(channel) => {
                info!(
                    address = %settings.configuration.address(),
                    local_addr = %channel.local_addr(),
                    "Bootstrap started"
                );
                Ok(Running {
                    pools,
                    group,
                    channel: Some(channel),
                })
            }
            Err(err) => {
                pools.release();
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    pub(crate) fn suspend(&self) -> Result<(), Error> {
        if self.state.begin(Transition::Suspend)? == Step::Noop {
            return Ok(());
        }
        let channel = self
            .running
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|running| running.channel.take());
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await_done() {
                warn!(%err, "Error closing channel on suspend");
            }
            info!(local_addr = %channel.local_addr(), "Bootstrap suspended");
        }
        self.state.finish(Transition::Suspend);
        Ok(())
    }

    #[instrument(skip(self))]
    pub(crate) fn resume(&self) -> Result<(), Error> {
        let previous = match self.state.begin(Transition::Resume)? {
            Step::Noop => return Ok(()),
            Step::Proceed(previous) => previous,
        };
        match self.rebind() {
            Ok(()) => {
                self.state.finish(Transition::Resume);
                Ok(())
            }
            Err(err) => {
                self.state.abort(previous);
                Err(err)
            }
        }
    }

    fn rebind(&self) -> Result<(), Error> {
        let settings = self.settings.lock().unwrap();
        let settings = settings.as_ref().ok_or(Error::InvalidState {
            operation: "resume",
            state: ServiceState::Suspended,
        })?;
        let mut running = self.running.lock().unwrap();
        let Some(running) = running.as_mut() else {
            return Err(Error::InvalidState {
                operation: "resume",
                state: ServiceState::Suspended,
            });
        };
        let channel = match bind_channel(settings, &running.pools, &running.group) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(%err, "Rebind failed, retrying once");
                running.channel = None;
                bind_channel(settings, &running.pools, &running.group)?
            }
        };
        info!(local_addr = %channel.local_addr(), "Bootstrap resumed");
        running.channel = Some(channel);
        Ok(())
    }

    #[instrument(skip(self))]
    pub(crate) fn stop(&self) -> Result<(), Error> {
        if self.state.begin(Transition::Stop)? == Step::Noop {
            return Ok(());
        }
        let running = self.running.lock().unwrap().take();
        if let Some(running) = running {
            let count = running.group.len();
            if let Err(err) = running.group.close().await_done() {
                warn!(%err, "Error closing channels on stop");
            }
            running.pools.release();
            info!(group = running.group.name(), closed = count, "Bootstrap stopped");
        }
        self.state.finish(Transition::Stop);
        Ok(())
    }
}

/// Binds (or, in client mode, connects) the channel of a listener and adds
/// it to `group`.
fn bind_channel(settings: &Settings, pools: &ExecutionPools, group: &ChannelGroup) -> Result<Channel, Error> {
    let config = &settings.configuration;
    let mut groups = vec![group.clone()];
    groups.extend(settings.context.channel_group.clone());
    let child = ChildInit {
        factory: Arc::clone(&settings.pipeline_factory),
        groups,
    };
    let addr = config.resolve()?;

    let future = match (config.protocol, config.client_mode) {
        (Protocol::Udp, false) => transport::bind_datagram(pools.workers(), config, addr, None, child)?,
        (Protocol::Udp, true) => transport::bind_datagram(
            pools.workers(),
            config,
            socket::unspecified_for(addr),
            Some(addr),
            child,
        )?,
        (Protocol::Tcp, false) => transport::bind(pools.boss(), pools.workers(), config, addr, child)?,
        (Protocol::Tcp, true) => {
            let future = transport::connect(pools.boss(), pools.workers(), config, addr, child);
            future.await_done().map_err(|cause| Error::ConnectFailed {
                address: config.address(),
                source: Some(cause),
            })?;
            future
        }
    };
    future.await_done().map_err(Error::Shared)?;
    let channel = future.channel().ok_or(Error::ChannelClosed)?;
    group.add(&channel);
    if let Some(shared) = &settings.context.channel_group {
        shared.add(&channel);
    }
    Ok(channel)
}
