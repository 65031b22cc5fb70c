use super::listener::ListenerBootstrap;
use super::{BootstrapFactory, Consumer, ExecutionContext};
use crate::config::ListenerConfiguration;
use crate::error::Error;
use crate::executor::ThreadFactory;
use crate::lifecycle::{Lifecycle, ServiceState};
use crate::pipeline::PipelineFactory;
use crate::transport::Channel;
use std::net::SocketAddr;
use std::sync::Arc;

/// Bootstrap factory serving a single consumer. Start and stop are driven
/// directly through [`Lifecycle`]; attaching consumers has no effect.
pub struct ExclusiveBootstrapFactory {
    core: ListenerBootstrap,
}

impl ExclusiveBootstrapFactory {
    pub fn new() -> Self {
        Self {
            core: ListenerBootstrap::new(),
        }
    }
}

impl Default for ExclusiveBootstrapFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle for ExclusiveBootstrapFactory {
    fn start(&self) -> Result<(), Error> {
        self.core.start()
    }

    fn stop(&self) -> Result<(), Error> {
        self.core.stop()
    }

    fn suspend(&self) -> Result<(), Error> {
        self.core.suspend()
    }

    fn resume(&self) -> Result<(), Error> {
        self.core.resume()
    }

    fn state(&self) -> ServiceState {
        self.core.state()
    }
}

impl BootstrapFactory for ExclusiveBootstrapFactory {
    fn init(
        &self,
        context: Option<ExecutionContext>,
        threads: Option<ThreadFactory>,
        configuration: ListenerConfiguration,
        pipeline_factory: Arc<dyn PipelineFactory>,
    ) -> Result<(), Error> {
        self.core.init(context, threads, configuration, pipeline_factory)
    }

    fn add_consumer(&self, _consumer: &Consumer) -> Result<(), Error> {
        Ok(())
    }

    fn remove_consumer(&self, _consumer: &Consumer) -> Result<(), Error> {
        Ok(())
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.core.local_address()
    }

    fn channel(&self) -> Option<Channel> {
        self.core.channel()
    }

    fn configuration(&self) -> Option<ListenerConfiguration> {
        self.core.configuration()
    }
}

impl Drop for ExclusiveBootstrapFactory {
    fn drop(&mut self) {
        let _ = self.core.stop();
    }
}
