use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Error shared between a failed future, the exchange it belongs to and any
/// listener that observes it.
pub type SharedError = Arc<Error>;

/// The error type for sockbridge operations.
///
/// Configuration errors are raised synchronously at startup or attach time.
/// Per-request failures (connect, write, timeout) are never returned from
/// [`ConnectionManager::send`](crate::ConnectionManager::send); they are
/// stored on the request's [`Exchange`](crate::Exchange) and reported through
/// its completion callback.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured host/port could not be resolved to a socket address.
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),

    /// Binding the listening or datagram socket failed.
    #[error("Failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    /// An outbound connection could not be established.
    #[error("Cannot connect to {address}")]
    ConnectFailed {
        address: String,
        #[source]
        source: Option<SharedError>,
    },

    /// An outbound connection did not complete within `connect_timeout_millis`.
    #[error("Connection to {address} timed out after {millis} ms")]
    ConnectTimeout { address: SocketAddr, millis: u64 },

    /// The channel was closed before the operation could complete.
    #[error("Channel closed")]
    ChannelClosed,

    /// No data was read from the channel within the configured read timeout.
    #[error("No data read within {millis} ms")]
    ReadTimeout { millis: u64 },

    /// The remote peer closed the connection without sending a reply.
    #[error("No response received from remote server: {address}")]
    NoResponse { address: String },

    /// A decoded frame exceeded the configured maximum length.
    #[error("Frame length exceeds {max} bytes")]
    FrameTooLong { max: usize },

    /// Every pooled channel is in use and the pool does not wait.
    #[error("Producer pool for {address} exhausted ({max_total} channels in use)")]
    PoolExhausted { address: String, max_total: usize },

    /// No pooled channel was released within `producer_pool_max_wait_millis`.
    #[error("Timed out after {millis} ms waiting for a pooled channel to {address}")]
    PoolWaitTimeout { address: String, millis: u64 },

    /// The event loop owning a channel has terminated.
    #[error("Event loop terminated unexpectedly")]
    EventLoopTerminated,

    /// An asynchronous failure observed through a future.
    #[error(transparent)]
    Shared(SharedError),

    // ============================================================================
    // TLS Errors
    // ============================================================================
    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// `ssl` is enabled but the material for the requested side is missing.
    ///
    /// Listeners need `tls_server_cert` and `tls_server_key`; producers and
    /// client-mode listeners need `tls_ca_cert`.
    #[error("TLS {side} configuration not provided")]
    TlsConfigMissing { side: &'static str },

    /// Failed to build a TLS session.
    #[error("TLS error: {0}")]
    Tls(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for the `protocol` configuration key.
    #[error("Invalid protocol '{got}', expected one of: tcp, udp")]
    InvalidProtocol { got: String },

    /// Invalid value for the `delimiter` configuration key.
    #[error("Invalid textline delimiter '{got}', expected one of: line, nul")]
    InvalidDelimiter { got: String },

    /// Invalid value for the `charset` configuration key.
    #[error("Unsupported charset '{0}'")]
    UnsupportedCharset(String),

    /// Invalid value for the `no_reply_log_level` configuration key.
    #[error("Invalid log level '{0}'")]
    InvalidLogLevel(String),

    /// A payload could not be converted with the configured charset.
    #[error("Payload is not valid {charset}")]
    InvalidText { charset: &'static str },

    /// A bootstrap factory was initialised without an execution context and
    /// without a thread factory.
    #[error("Either an execution context or a thread factory must be supplied")]
    MissingExecutionContext,

    /// A consumer tried to attach to a shared listener with a configuration
    /// that differs from the one the listener is bound with.
    #[error("Incompatible configuration for shared listener {address}: {field} differs")]
    IncompatibleConfiguration {
        address: String,
        field: &'static str,
    },

    // ============================================================================
    // Correlation Errors
    // ============================================================================
    /// No correlation id could be extracted from an outbound request.
    #[error("No correlation id found in request payload")]
    MissingCorrelationId,

    /// A request with the same correlation id is already pending.
    #[error("A request with correlation id '{id}' is already pending")]
    DuplicateCorrelationId { id: String },

    /// A request is already pending on this channel.
    #[error("Channel {channel} already has a pending request")]
    ChannelBusy { channel: u64 },

    /// The deadline for a correlated reply elapsed.
    #[error("No reply received for correlation id '{correlation_id}' within {millis} ms")]
    RequestTimeout { correlation_id: String, millis: u64 },

    // ============================================================================
    // Lifecycle Errors
    // ============================================================================
    /// The component handling the request is not running (not started,
    /// suspended or stopping).
    #[error("{target} is not running, request rejected")]
    Rejected { target: String },

    /// A lifecycle operation was requested from a state that does not allow it.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::ServiceState,
    },
}

impl Error {
    /// Returns true for errors caused by a request/reply deadline or a
    /// channel read timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::RequestTimeout { .. } | Error::ReadTimeout { .. } | Error::ConnectTimeout { .. } => {
                true
            }
            Error::Shared(inner) => inner.is_timeout(),
            Error::ConnectFailed {
                source: Some(inner),
                ..
            } => inner.is_timeout(),
            _ => false,
        }
    }
}
