//! Shared helpers for the integration tests.
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! TEST_LOG=2 cargo test --test producer -- --nocapture
//! ```

#![allow(dead_code)]

use sockbridge::prelude::*;
use sockbridge::{ExecutionContext, LineDecoder, TextlineDelimiter, ThreadFactory};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("sockbridge={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Configuration Helpers
// ============================================================================

pub fn listener_config(protocol: Protocol) -> ListenerConfiguration {
    ListenerConfiguration {
        protocol,
        host: "127.0.0.1".to_string(),
        port: 0,
        worker_count: 2,
        connect_timeout_millis: 2_000,
        ..ListenerConfiguration::default()
    }
}

/// Producer configuration pointed at `addr`.
pub fn endpoint_config(protocol: Protocol, addr: SocketAddr) -> EndpointConfiguration {
    let mut listener = listener_config(protocol);
    listener.port = addr.port();
    EndpointConfiguration {
        listener,
        ..EndpointConfiguration::default()
    }
}

pub fn threads(name: &str) -> ThreadFactory {
    ThreadFactory::new(name)
}

/// Polls `condition` every 10 ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ============================================================================
// Server Handlers
// ============================================================================

/// Writes every message back to its sender, followed by `suffix`.
pub struct EchoHandler {
    pub suffix: Vec<u8>,
    pub received: AtomicUsize,
    pub active: AtomicUsize,
    pub inactive: AtomicUsize,
}

impl EchoHandler {
    pub fn new(suffix: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            suffix: suffix.to_vec(),
            received: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            inactive: AtomicUsize::new(0),
        })
    }
}

impl ChannelHandler for EchoHandler {
    fn channel_active(&self, _channel: &Channel) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn message_received(&self, channel: &Channel, sender: SocketAddr, mut message: Vec<u8>) {
        self.received.fetch_add(1, Ordering::SeqCst);
        message.extend_from_slice(&self.suffix);
        match channel.remote_addr() {
            Some(_) => channel.write(message),
            None => channel.write_to(message, sender),
        };
    }

    fn channel_inactive(&self, _channel: &Channel) {
        self.inactive.fetch_add(1, Ordering::SeqCst);
    }
}

/// Answers "ID text" with "ID world".
pub struct WorldHandler;

impl ChannelHandler for WorldHandler {
    fn message_received(&self, channel: &Channel, _sender: SocketAddr, message: Vec<u8>) {
        let text = String::from_utf8_lossy(&message);
        let id = text.split_whitespace().next().unwrap_or_default();
        channel.write(format!("{id} world\n").into_bytes());
    }
}

/// Records messages and never answers.
#[derive(Default)]
pub struct SilentHandler {
    pub messages: Mutex<Vec<Vec<u8>>>,
}

impl ChannelHandler for SilentHandler {
    fn message_received(&self, _channel: &Channel, _sender: SocketAddr, message: Vec<u8>) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Pipeline factory with a `\n` line decoder in front of `handler`.
pub fn line_factory(handler: Arc<dyn ChannelHandler>) -> Arc<dyn PipelineFactory> {
    let codecs = CodecChain::new().with_decoder(sockbridge::DecoderStage::per_channel(|| {
        LineDecoder::new(TextlineDelimiter::Line, 1024)
    }));
    Arc::new(DefaultPipelineFactory::new(codecs, handler))
}

pub fn raw_factory(handler: Arc<dyn ChannelHandler>) -> Arc<dyn PipelineFactory> {
    Arc::new(DefaultPipelineFactory::new(CodecChain::new(), handler))
}

/// Starts an exclusive listener and returns it with its bound address.
pub fn start_server(
    config: ListenerConfiguration,
    factory: Arc<dyn PipelineFactory>,
) -> (ExclusiveBootstrapFactory, SocketAddr) {
    let server = ExclusiveBootstrapFactory::new();
    server
        .init(None, Some(threads("server")), config, factory)
        .expect("init server");
    server.start().expect("start server");
    let addr = server.local_address().expect("bound address");
    (server, addr)
}

pub fn empty_context() -> ExecutionContext {
    ExecutionContext::new()
}

// ============================================================================
// TLS Material
// ============================================================================

/// Guard that holds temporary certificate files and auto-cleans them on drop
pub struct TlsCertGuard {
    pub cert_file: NamedTempFile,
    pub key_file: NamedTempFile,
}

impl TlsCertGuard {
    pub fn cert_path(&self) -> String {
        self.cert_file.path().to_str().unwrap().to_string()
    }

    pub fn key_path(&self) -> String {
        self.key_file.path().to_str().unwrap().to_string()
    }
}

/// Self-signed certificate for "localhost". The certificate doubles as CA.
pub fn create_temp_cert_files() -> TlsCertGuard {
    let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_pem = certified_key.cert.pem();
    let key_pem = certified_key.key_pair.serialize_pem();

    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    cert_file.write_all(cert_pem.as_bytes()).unwrap();
    key_file.write_all(key_pem.as_bytes()).unwrap();
    cert_file.flush().unwrap();
    key_file.flush().unwrap();

    TlsCertGuard { cert_file, key_file }
}
