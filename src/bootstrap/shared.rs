use super::listener::ListenerBootstrap;
use super::{BootstrapFactory, Consumer, ExecutionContext};
use crate::config::ListenerConfiguration;
use crate::error::Error;
use crate::executor::ThreadFactory;
use crate::lifecycle::{Lifecycle, ServiceState};
use crate::pipeline::PipelineFactory;
use crate::transport::Channel;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

/// Bootstrap factory shared by every consumer listening on the same address.
///
/// Consumers must match the factory's configuration field for field and use
/// the very same pipeline factory. The first consumer to attach starts the
/// listener; detaching the last one stops it and releases its pools.
/// Attach and detach are serialized.
pub struct SharedBootstrapFactory {
    core: ListenerBootstrap,
    consumers: Mutex<Vec<Consumer>>,
}

impl SharedBootstrapFactory {
    pub fn new() -> Self {
        Self {
            core: ListenerBootstrap::new(),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }
}

impl Default for SharedBootstrapFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle for SharedBootstrapFactory {
    fn start(&self) -> Result<(), Error> {
        let _consumers = self.consumers.lock().unwrap();
        self.core.start()
    }

    fn stop(&self) -> Result<(), Error> {
        let mut consumers = self.consumers.lock().unwrap();
        if !consumers.is_empty() {
            warn!(count = consumers.len(), "Stopping shared listener with consumers attached");
            consumers.clear();
        }
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

impl BootstrapFactory for SharedBootstrapFactory {
    fn init(
        &self,
        context: Option<ExecutionContext>,
        threads: Option<ThreadFactory>,
        configuration: ListenerConfiguration,
        pipeline_factory: Arc<dyn PipelineFactory>,
    ) -> Result<(), Error> {
        let _consumers = self.consumers.lock().unwrap();
        self.core.init(context, threads, configuration, pipeline_factory)
    }

    #[instrument(skip_all, fields(consumer = %consumer.id))]
    fn add_consumer(&self, consumer: &Consumer) -> Result<(), Error> {
        let mut consumers = self.consumers.lock().unwrap();
        if !self.core.is_initialised() {
            return Err(Error::InvalidState {
                operation: "add consumer",
                state: self.core.state(),
            });
        }
        if let Some(field) = self.core.first_difference(consumer) {
            return Err(Error::IncompatibleConfiguration {
                address: consumer.configuration.address(),
                field,
            });
        }
        if consumers.iter().any(|attached| attached.id == consumer.id) {
            return Ok(());
        }

        if consumers.is_empty() {
            self.core.start()?;
        }
        consumers.push(consumer.clone());
        info!(
            address = %consumer.configuration.address(),
            consumers = consumers.len(),
            "Consumer attached to shared listener"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(consumer = %consumer.id))]
    fn remove_consumer(&self, consumer: &Consumer) -> Result<(), Error> {
        let mut consumers = self.consumers.lock().unwrap();
        let before = consumers.len();
        consumers.retain(|attached| attached.id != consumer.id);
        if consumers.len() == before {
            return Ok(());
        }
        info!(consumers = consumers.len(), "Consumer detached from shared listener");
        if consumers.is_empty() {
            self.core.stop()?;
        }
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

impl Drop for SharedBootstrapFactory {
    fn drop(&mut self) {
        let _ = self.core.stop();
    }
}
