//! Listener side: factories that own a bound socket and its event loops.
//!
//! An [`ExclusiveBootstrapFactory`] serves exactly one consumer with private
//! pools. A [`SharedBootstrapFactory`] lets several consumers with
//! compatible configurations share one socket; it binds when the first
//! consumer attaches and unbinds when the last one detaches.

mod execution;
mod exclusive;
mod listener;
mod shared;

pub use execution::ExecutionContext;
pub(crate) use execution::ExecutionPools;
pub use exclusive::ExclusiveBootstrapFactory;
pub use shared::SharedBootstrapFactory;

use crate::config::ListenerConfiguration;
use crate::error::Error;
use crate::executor::ThreadFactory;
use crate::lifecycle::Lifecycle;
use crate::pipeline::PipelineFactory;
use crate::transport::Channel;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// A logical listener attached to a bootstrap factory.
#[derive(Clone)]
pub struct Consumer {
    pub id: String,
    pub configuration: ListenerConfiguration,
    pub pipeline_factory: Arc<dyn PipelineFactory>,
}

impl Consumer {
    pub fn new(
        id: impl Into<String>,
        configuration: ListenerConfiguration,
        pipeline_factory: Arc<dyn PipelineFactory>,
    ) -> Self {
        Self {
            id: id.into(),
            configuration,
            pipeline_factory,
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("address", &self.configuration.address())
            .finish_non_exhaustive()
    }
}

pub trait BootstrapFactory: Lifecycle + Send + Sync {
    /// Stores the dependencies. Nothing is bound until `start`.
    ///
    /// Fails with [`Error::MissingExecutionContext`] when neither `context`
    /// nor `threads` is given.
    fn init(
        &self,
        context: Option<ExecutionContext>,
        threads: Option<ThreadFactory>,
        configuration: ListenerConfiguration,
        pipeline_factory: Arc<dyn PipelineFactory>,
    ) -> Result<(), Error>;

    fn add_consumer(&self, consumer: &Consumer) -> Result<(), Error>;

    fn remove_consumer(&self, consumer: &Consumer) -> Result<(), Error>;

    /// Address the socket is bound to while started.
    fn local_address(&self) -> Option<SocketAddr>;

    /// The listening, datagram or client-mode channel while started.
    fn channel(&self) -> Option<Channel>;

    fn configuration(&self) -> Option<ListenerConfiguration>;
}
