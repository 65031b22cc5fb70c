//! sockbridge - raw TCP/UDP socket transport with optional TLS
//!
//! sockbridge lets message-routing code send and receive payloads over plain
//! sockets. It covers three concerns:
//!
//! - listeners ([`BootstrapFactory`]) that bind a TCP or UDP socket, either
//!   exclusively or shared between several compatible consumers,
//! - producers ([`ConnectionManager`]) that open, pool and close outbound
//!   connections without blocking the caller,
//! - request/reply correlation ([`CorrelationManager`]) that completes each
//!   in-flight [`Exchange`] exactly once, whether by reply, error or timeout.
//!
//! All socket I/O runs on mio event loop threads ([`EventLoopGroup`]).
//! Configuration is read with the `config` crate; see
//! [`ListenerConfiguration::from_config`] and
//! [`EndpointConfiguration::from_config`].

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod correlation;
pub(crate) mod error;
pub(crate) mod exchange;
pub mod executor;
pub(crate) mod lifecycle;
pub mod pipeline;
pub(crate) mod producer;
pub(crate) mod registry;
pub mod tls;
pub mod transport;

pub use bootstrap::{
    BootstrapFactory, Consumer, ExclusiveBootstrapFactory, ExecutionContext, SharedBootstrapFactory,
};
pub use codec::{Charset, LineDecoder, TextlineDelimiter};
pub use crate::config::{EndpointConfiguration, EndpointOverrides, ListenerConfiguration, ListenerOverrides, Protocol};
pub use correlation::{
    ChannelCorrelationManager, CorrelationIdResolver, CorrelationManager, PendingExchange,
    TimeoutCorrelationManager,
};
pub use error::{Error, SharedError};
pub use exchange::{
    AsyncCallback, Exchange, ExchangePattern, CLOSE_CHANNEL_HEADER, REQUEST_TIMEOUT_HEADER, REUSE_CHANNEL_HEADER,
};
pub use executor::{Scheduler, TaskHandle, ThreadFactory, WorkerPool, MIN_INTERVAL};
pub use lifecycle::{Lifecycle, ServiceState};
pub use pipeline::{
    ChannelHandler, CodecChain, Decoded, Decoder, DecoderStage, DefaultPipelineFactory, Encoder, Pipeline,
    PipelineFactory, SharedDecoder, TlsMode,
};
pub use producer::{ConnectionManager, ConnectionManagerBuilder};
pub use registry::ChannelGroup;
pub use tls::{PemTlsContextProvider, TlsContextProvider, TlsSession};
pub use transport::{Channel, ChannelFuture, ChannelGroupFuture, ChannelId, ChannelKind, EventLoopGroup};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::bootstrap::{BootstrapFactory, Consumer, ExclusiveBootstrapFactory, SharedBootstrapFactory};
    pub use crate::config::{EndpointConfiguration, ListenerConfiguration, Protocol};
    pub use crate::correlation::{CorrelationIdResolver, CorrelationManager, TimeoutCorrelationManager};
    pub use crate::error::Error;
    pub use crate::exchange::Exchange;
    pub use crate::lifecycle::{Lifecycle, ServiceState};
    pub use crate::pipeline::{ChannelHandler, CodecChain, DefaultPipelineFactory, PipelineFactory};
    pub use crate::producer::ConnectionManager;
    pub use crate::transport::Channel;
}
