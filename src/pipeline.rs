//! Per-channel processing: decoder stages, encoder stages, optional TLS and
//! a terminal [`ChannelHandler`].

use crate::error::{Error, SharedError};
use crate::tls::{TlsContextProvider, TlsSession};
use crate::transport::Channel;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

// ============================================================================
// Handler and Codec Traits
// ============================================================================

/// Terminal stage of a pipeline. Invoked on the channel's event loop thread;
/// implementations must not block.
pub trait ChannelHandler: Send + Sync {
    fn channel_active(&self, _channel: &Channel) {}

    /// A decoded message. `sender` is the peer (the datagram source for UDP).
    fn message_received(&self, channel: &Channel, sender: SocketAddr, message: Vec<u8>);

    fn exception_caught(&self, channel: &Channel, cause: SharedError) {
        warn!(channel = %channel.id(), %cause, "Closing channel after error");
        channel.close();
    }

    fn channel_inactive(&self, _channel: &Channel) {}
}

/// Stateful decoder; one instance per channel.
pub trait Decoder: Send {
    /// Consumes `input` and pushes zero or more complete messages to `out`.
    fn decode(&mut self, input: Vec<u8>, out: &mut Vec<Vec<u8>>) -> Result<(), Error>;
}

/// Stateless decoder that can serve every channel at once.
pub trait SharedDecoder: Send + Sync {
    fn decode(&self, input: Vec<u8>, out: &mut Vec<Vec<u8>>) -> Result<(), Error>;
}

pub trait Encoder: Send + Sync {
    fn encode(&self, message: Vec<u8>) -> Result<Vec<u8>, Error>;
}

type DecoderFactory = Arc<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;

/// A decoder stage as configured: either one shared instance or a factory
/// producing a fresh instance for each channel.
#[derive(Clone)]
pub enum DecoderStage {
    Shared(Arc<dyn SharedDecoder>),
    PerChannel(DecoderFactory),
}

impl DecoderStage {
    pub fn shared(decoder: impl SharedDecoder + 'static) -> Self {
        DecoderStage::Shared(Arc::new(decoder))
    }

    pub fn per_channel<F, D>(factory: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: Decoder + 'static,
    {
        DecoderStage::PerChannel(Arc::new(move || Box::new(factory()) as Box<dyn Decoder>))
    }

    pub fn is_shareable(&self) -> bool {
        matches!(self, DecoderStage::Shared(_))
    }

    fn instantiate(&self) -> ChannelDecoder {
        match self {
            DecoderStage::Shared(decoder) => ChannelDecoder::Shared(Arc::clone(decoder)),
            DecoderStage::PerChannel(factory) => ChannelDecoder::Owned(factory()),
        }
    }
}

enum ChannelDecoder {
    Shared(Arc<dyn SharedDecoder>),
    Owned(Box<dyn Decoder>),
}

impl ChannelDecoder {
    fn decode(&mut self, input: Vec<u8>, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        match self {
            ChannelDecoder::Shared(decoder) => decoder.decode(input, out),
            ChannelDecoder::Owned(decoder) => decoder.decode(input, out),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Output of [`Pipeline::decode`]. `messages` are delivered before `error`
/// is raised.
#[derive(Debug, Default)]
pub struct Decoded {
    pub messages: Vec<Vec<u8>>,
    pub error: Option<Error>,
}

/// The stages bound to one channel.
pub struct Pipeline {
    decoders: Vec<ChannelDecoder>,
    encoders: Vec<Arc<dyn Encoder>>,
    pub(crate) tls: Option<TlsSession>,
    handler: Arc<dyn ChannelHandler>,
}

impl Pipeline {
    pub fn new(handler: Arc<dyn ChannelHandler>) -> Self {
        Self {
            decoders: Vec::new(),
            encoders: Vec::new(),
            tls: None,
            handler,
        }
    }

    pub fn with_decoder(mut self, stage: &DecoderStage) -> Self {
        self.decoders.push(stage.instantiate());
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoders.push(encoder);
        self
    }

    pub fn with_tls(mut self, session: TlsSession) -> Self {
        self.tls = Some(session);
        self
    }

    pub fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.handler
    }

    /// Runs `input` through every decoder stage in order.
    ///
    /// A failing stage does not discard what it already produced: frames
    /// decoded around the bad one still flow through the later stages, and
    /// the first failure is reported alongside them.
    pub fn decode(&mut self, input: Vec<u8>) -> Decoded {
        let mut messages = vec![input];
        let mut error = None;
        for decoder in &mut self.decoders {
            let mut decoded = Vec::new();
            for message in messages {
                if let Err(err) = decoder.decode(message, &mut decoded) {
                    error.get_or_insert(err);
                }
            }
            messages = decoded;
        }
        Decoded { messages, error }
    }

    pub(crate) fn encode(&self, message: Vec<u8>) -> Result<Vec<u8>, Error> {
        self.encoders
            .iter()
            .try_fold(message, |message, encoder| encoder.encode(message))
    }
}

/// Builds the pipeline of each new channel.
pub trait PipelineFactory: Send + Sync {
    fn init_channel(&self, channel: &Channel) -> Result<Pipeline, Error>;
}

// ============================================================================
// Default Factory
// ============================================================================

/// Ordered decoder and encoder stages shared by every channel of an endpoint.
#[derive(Clone, Default)]
pub struct CodecChain {
    pub decoders: Vec<DecoderStage>,
    pub encoders: Vec<Arc<dyn Encoder>>,
}

impl CodecChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decoder(mut self, stage: DecoderStage) -> Self {
        self.decoders.push(stage);
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoders.push(encoder);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty() && self.encoders.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    Server,
    Client { server_name: String },
}

/// Pipeline factory assembling a [`CodecChain`], an optional TLS session and
/// a fixed handler.
pub struct DefaultPipelineFactory {
    codecs: CodecChain,
    tls: Option<(Arc<dyn TlsContextProvider>, TlsMode)>,
    handler: Arc<dyn ChannelHandler>,
}

impl DefaultPipelineFactory {
    pub fn new(codecs: CodecChain, handler: Arc<dyn ChannelHandler>) -> Self {
        Self {
            codecs,
            tls: None,
            handler,
        }
    }

    pub fn with_tls(mut self, provider: Arc<dyn TlsContextProvider>, mode: TlsMode) -> Self {
        self.tls = Some((provider, mode));
        self
    }
}

impl PipelineFactory for DefaultPipelineFactory {
    fn init_channel(&self, _channel: &Channel) -> Result<Pipeline, Error> {
        let mut pipeline = Pipeline::new(Arc::clone(&self.handler));
        for stage in &self.codecs.decoders {
            pipeline = pipeline.with_decoder(stage);
        }
        for encoder in &self.codecs.encoders {
            pipeline = pipeline.with_encoder(Arc::clone(encoder));
        }
        if let Some((provider, mode)) = &self.tls {
            let session = match mode {
                TlsMode::Server => provider.server_session()?,
                TlsMode::Client { server_name } => provider.client_session(server_name)?,
            };
            pipeline = pipeline.with_tls(session);
        }
        Ok(pipeline)
    }
}
