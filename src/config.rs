//! Typed configuration read from [`config::Config`].
//!
//! Every key can be namespaced: `{name}.{key}` takes precedence over the
//! global `{key}`, which takes precedence over the built-in default. The
//! layering is an explicit field-by-field merge of [`ListenerOverrides`] and
//! [`EndpointOverrides`] values.

use crate::codec::{Charset, TextlineDelimiter};
use crate::error::Error;
use ::config::{Config, ConfigError};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

// Looks up exactly one scope (`{scope}.{key}`, or `{key}` for the empty
// scope). Missing keys are `None`, malformed ones are errors.
fn get_scoped<T, F>(config: &Config, scope: &str, key: &str, getter: F) -> Result<Option<T>, Error>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    let full_key = if scope.is_empty() {
        key.to_string()
    } else {
        format!("{scope}.{key}")
    };
    match getter(config, &full_key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn get_bool(config: &Config, scope: &str, key: &str) -> Result<Option<bool>, Error> {
    get_scoped(config, scope, key, Config::get_bool)
}

fn get_string(config: &Config, scope: &str, key: &str) -> Result<Option<String>, Error> {
    get_scoped(config, scope, key, Config::get_string)
}

fn get_num<T: TryFrom<i64>>(config: &Config, scope: &str, key: &str) -> Result<Option<T>, Error> {
    get_scoped(config, scope, key, |cfg, key| {
        let raw = cfg.get_int(key)?;
        T::try_from(raw).map_err(|_| {
            ConfigError::Message(format!("{key}: {raw} is out of range"))
        })
    })
}

fn get_parsed<T: FromStr<Err = Error>>(
    config: &Config,
    scope: &str,
    key: &str,
) -> Result<Option<T>, Error> {
    get_string(config, scope, key)?
        .map(|value| value.parse())
        .transpose()
}

// ============================================================================
// Enumerated Options
// ============================================================================

/// Transport protocol of a listener or producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(Error::InvalidProtocol { got: s.to_string() }),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

fn parse_level(s: &str) -> Result<Level, Error> {
    Level::from_str(s).map_err(|_| Error::InvalidLogLevel(s.to_string()))
}

// ============================================================================
// ListenerConfiguration
// ============================================================================

/// Socket-level configuration of a listener, also used by producers for the
/// socket options of their outbound connections.
///
/// Two configurations are compatible (may share one bound socket) only when
/// they are equal field by field, including the option map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfiguration {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub keep_alive: bool,
    pub tcp_no_delay: bool,
    pub reuse_address: bool,
    pub broadcast: bool,
    pub connect_timeout_millis: u64,
    /// Listen backlog; 0 selects the platform default.
    pub backlog: u32,
    pub boss_count: usize,
    /// Worker loop count; 0 selects twice the available parallelism.
    pub worker_count: usize,
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub ssl: bool,
    pub tls_server_cert: Option<String>,
    pub tls_server_key: Option<String>,
    pub tls_ca_cert: Option<String>,
    pub tls_server_name: Option<String>,
    /// Listener connects out instead of binding (TCP only).
    pub client_mode: bool,
    pub options: BTreeMap<String, String>,
}

impl Default for ListenerConfiguration {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            host: "localhost".to_string(),
            port: 0,
            keep_alive: true,
            tcp_no_delay: true,
            reuse_address: true,
            broadcast: false,
            connect_timeout_millis: 10_000,
            backlog: 0,
            boss_count: 1,
            worker_count: 0,
            send_buffer_size: 65_536,
            receive_buffer_size: 65_536,
            ssl: false,
            tls_server_cert: None,
            tls_server_key: None,
            tls_ca_cert: None,
            tls_server_name: None,
            client_mode: false,
            options: BTreeMap::new(),
        }
    }
}

/// Partial [`ListenerConfiguration`]; `None` fields keep the merged-into value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerOverrides {
    pub protocol: Option<Protocol>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub keep_alive: Option<bool>,
    pub tcp_no_delay: Option<bool>,
    pub reuse_address: Option<bool>,
    pub broadcast: Option<bool>,
    pub connect_timeout_millis: Option<u64>,
    pub backlog: Option<u32>,
    pub boss_count: Option<usize>,
    pub worker_count: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    pub ssl: Option<bool>,
    pub tls_server_cert: Option<String>,
    pub tls_server_key: Option<String>,
    pub tls_ca_cert: Option<String>,
    pub tls_server_name: Option<String>,
    pub client_mode: Option<bool>,
    /// Merged key by key into the existing option map.
    pub options: BTreeMap<String, String>,
}

impl ListenerOverrides {
    /// Reads the keys of exactly one scope. An empty `scope` reads global keys.
    pub fn from_config(config: &Config, scope: &str) -> Result<Self, Error> {
        let options = match get_scoped(config, scope, "options", Config::get_table)? {
            Some(table) => table
                .into_iter()
                .map(|(key, value)| Ok((key, value.into_string()?)))
                .collect::<Result<BTreeMap<_, _>, ConfigError>>()?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            protocol: get_parsed(config, scope, "protocol")?,
            host: get_string(config, scope, "host")?,
            port: get_num(config, scope, "port")?,
            keep_alive: get_bool(config, scope, "keep_alive")?,
            tcp_no_delay: get_bool(config, scope, "tcp_no_delay")?,
            reuse_address: get_bool(config, scope, "reuse_address")?,
            broadcast: get_bool(config, scope, "broadcast")?,
            connect_timeout_millis: get_num(config, scope, "connect_timeout_millis")?,
            backlog: get_num(config, scope, "backlog")?,
            boss_count: get_num(config, scope, "boss_count")?,
            worker_count: get_num(config, scope, "worker_count")?,
            send_buffer_size: get_num(config, scope, "send_buffer_size")?,
            receive_buffer_size: get_num(config, scope, "receive_buffer_size")?,
            ssl: get_bool(config, scope, "ssl")?,
            tls_server_cert: get_string(config, scope, "tls_server_cert")?,
            tls_server_key: get_string(config, scope, "tls_server_key")?,
            tls_ca_cert: get_string(config, scope, "tls_ca_cert")?,
            tls_server_name: get_string(config, scope, "tls_server_name")?,
            client_mode: get_bool(config, scope, "client_mode")?,
            options,
        })
    }
}

impl ListenerConfiguration {
    /// Builds a configuration from global keys, then keys namespaced by
    /// `name`, over the defaults.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let mut merged = Self::default().merge(&ListenerOverrides::from_config(config, "")?);
        if !name.is_empty() {
            merged = merged.merge(&ListenerOverrides::from_config(config, name)?);
        }
        Ok(merged)
    }

    /// Returns a copy with every `Some` field of `overrides` applied.
    pub fn merge(&self, overrides: &ListenerOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(v) = overrides.protocol {
            merged.protocol = v;
        }
        if let Some(v) = &overrides.host {
            merged.host = v.clone();
        }
        if let Some(v) = overrides.port {
            merged.port = v;
        }
        if let Some(v) = overrides.keep_alive {
            merged.keep_alive = v;
        }
        if let Some(v) = overrides.tcp_no_delay {
            merged.tcp_no_delay = v;
        }
        if let Some(v) = overrides.reuse_address {
            merged.reuse_address = v;
        }
        if let Some(v) = overrides.broadcast {
            merged.broadcast = v;
        }
        if let Some(v) = overrides.connect_timeout_millis {
            merged.connect_timeout_millis = v;
        }
        if let Some(v) = overrides.backlog {
            merged.backlog = v;
        }
        if let Some(v) = overrides.boss_count {
            merged.boss_count = v;
        }
        if let Some(v) = overrides.worker_count {
            merged.worker_count = v;
        }
        if let Some(v) = overrides.send_buffer_size {
            merged.send_buffer_size = v;
        }
        if let Some(v) = overrides.receive_buffer_size {
            merged.receive_buffer_size = v;
        }
        if let Some(v) = overrides.ssl {
            merged.ssl = v;
        }
        if let Some(v) = &overrides.tls_server_cert {
            merged.tls_server_cert = Some(v.clone());
        }
        if let Some(v) = &overrides.tls_server_key {
            merged.tls_server_key = Some(v.clone());
        }
        if let Some(v) = &overrides.tls_ca_cert {
            merged.tls_ca_cert = Some(v.clone());
        }
        if let Some(v) = &overrides.tls_server_name {
            merged.tls_server_name = Some(v.clone());
        }
        if let Some(v) = overrides.client_mode {
            merged.client_mode = v;
        }
        for (key, value) in &overrides.options {
            merged.options.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Name of the first field that differs from `other`, if any.
    pub fn first_difference(&self, other: &Self) -> Option<&'static str> {
        let checks: [(&'static str, bool); 20] = [
            ("protocol", self.protocol == other.protocol),
            ("host", self.host == other.host),
            ("port", self.port == other.port),
            ("keep_alive", self.keep_alive == other.keep_alive),
            ("tcp_no_delay", self.tcp_no_delay == other.tcp_no_delay),
            ("reuse_address", self.reuse_address == other.reuse_address),
            ("broadcast", self.broadcast == other.broadcast),
            (
                "connect_timeout_millis",
                self.connect_timeout_millis == other.connect_timeout_millis,
            ),
            ("backlog", self.backlog == other.backlog),
            ("boss_count", self.boss_count == other.boss_count),
            ("worker_count", self.worker_count == other.worker_count),
            ("send_buffer_size", self.send_buffer_size == other.send_buffer_size),
            (
                "receive_buffer_size",
                self.receive_buffer_size == other.receive_buffer_size,
            ),
            ("ssl", self.ssl == other.ssl),
            ("tls_server_cert", self.tls_server_cert == other.tls_server_cert),
            ("tls_server_key", self.tls_server_key == other.tls_server_key),
            ("tls_ca_cert", self.tls_ca_cert == other.tls_ca_cert),
            ("tls_server_name", self.tls_server_name == other.tls_server_name),
            ("client_mode", self.client_mode == other.client_mode),
            ("options", self.options == other.options),
        ];
        checks
            .into_iter()
            .find(|(_, equal)| !equal)
            .map(|(field, _)| field)
    }

    /// Whether a listener bound with `self` may be shared with `other`.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.first_difference(other).is_none()
    }

    /// `protocol://host:port`, used in logs and error messages.
    pub fn address(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Resolves `host:port`. Blocks on DNS for non-literal hosts.
    pub fn resolve(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress(self.address()))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(self.address()))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_millis > 0).then(|| Duration::from_millis(self.connect_timeout_millis))
    }

    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(2)
        }
    }

    pub fn effective_boss_count(&self) -> usize {
        self.boss_count.max(1)
    }
}

// ============================================================================
// EndpointConfiguration
// ============================================================================

/// Producer-side configuration: the socket options of [`ListenerConfiguration`]
/// plus request/reply, codec and pooling behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfiguration {
    pub listener: ListenerConfiguration,
    /// Request/reply: wait for a correlated reply before completing.
    pub sync: bool,
    /// Close the channel once the exchange completes.
    pub disconnect: bool,
    /// Close the channel when a sync request got no reply.
    pub disconnect_on_no_reply: bool,
    pub lazy_channel_creation: bool,
    pub textline: bool,
    pub delimiter: TextlineDelimiter,
    pub auto_append_delimiter: bool,
    pub decoder_max_line_length: usize,
    pub charset: Charset,
    /// Read timeout for replies; 0 disables.
    pub request_timeout_millis: u64,
    /// Keep the channel bound to the exchange across sends until
    /// [`release_channel`](crate::ConnectionManager::release_channel).
    pub reuse_channel: bool,
    pub producer_pool_enabled: bool,
    /// Cap on open pooled channels, idle or borrowed; 0 is unbounded.
    pub producer_pool_max_total: usize,
    pub producer_pool_max_idle: usize,
    /// Idle channels kept open (and reopened) by the evictor.
    pub producer_pool_min_idle: usize,
    /// Idle time after which the evictor closes a channel; 0 disables.
    pub producer_pool_min_evictable_idle_millis: u64,
    pub producer_pool_eviction_interval_millis: u64,
    /// At `producer_pool_max_total`, queue the exchange for a released
    /// channel instead of failing it.
    pub producer_pool_block_when_exhausted: bool,
    /// Longest time a queued exchange waits for a channel; 0 waits until
    /// one is released.
    pub producer_pool_max_wait_millis: u64,
    pub udp_connectionless_sending: bool,
    pub no_reply_log_level: Level,
}

impl Default for EndpointConfiguration {
    fn default() -> Self {
        Self {
            listener: ListenerConfiguration::default(),
            sync: true,
            disconnect: false,
            disconnect_on_no_reply: true,
            lazy_channel_creation: true,
            textline: false,
            delimiter: TextlineDelimiter::Line,
            auto_append_delimiter: true,
            decoder_max_line_length: 1024,
            charset: Charset::Utf8,
            request_timeout_millis: 0,
            reuse_channel: false,
            producer_pool_enabled: true,
            producer_pool_max_total: 0,
            producer_pool_max_idle: 100,
            producer_pool_min_idle: 0,
            producer_pool_min_evictable_idle_millis: 300_000,
            producer_pool_eviction_interval_millis: 30_000,
            producer_pool_block_when_exhausted: true,
            producer_pool_max_wait_millis: 0,
            udp_connectionless_sending: false,
            no_reply_log_level: Level::WARN,
        }
    }
}

/// Partial [`EndpointConfiguration`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointOverrides {
    pub listener: ListenerOverrides,
    pub sync: Option<bool>,
    pub disconnect: Option<bool>,
    pub disconnect_on_no_reply: Option<bool>,
    pub lazy_channel_creation: Option<bool>,
    pub textline: Option<bool>,
    pub delimiter: Option<TextlineDelimiter>,
    pub auto_append_delimiter: Option<bool>,
    pub decoder_max_line_length: Option<usize>,
    pub charset: Option<Charset>,
    pub request_timeout_millis: Option<u64>,
    pub reuse_channel: Option<bool>,
    pub producer_pool_enabled: Option<bool>,
    pub producer_pool_max_total: Option<usize>,
    pub producer_pool_max_idle: Option<usize>,
    pub producer_pool_min_idle: Option<usize>,
    pub producer_pool_min_evictable_idle_millis: Option<u64>,
    pub producer_pool_eviction_interval_millis: Option<u64>,
    pub producer_pool_block_when_exhausted: Option<bool>,
    pub producer_pool_max_wait_millis: Option<u64>,
    pub udp_connectionless_sending: Option<bool>,
    pub no_reply_log_level: Option<Level>,
}

impl EndpointOverrides {
    /// Reads the keys of exactly one scope. An empty `scope` reads global keys.
    pub fn from_config(config: &Config, scope: &str) -> Result<Self, Error> {
        Ok(Self {
            listener: ListenerOverrides::from_config(config, scope)?,
            sync: get_bool(config, scope, "sync")?,
            disconnect: get_bool(config, scope, "disconnect")?,
            disconnect_on_no_reply: get_bool(config, scope, "disconnect_on_no_reply")?,
            lazy_channel_creation: get_bool(config, scope, "lazy_channel_creation")?,
            textline: get_bool(config, scope, "textline")?,
            delimiter: get_parsed(config, scope, "delimiter")?,
            auto_append_delimiter: get_bool(config, scope, "auto_append_delimiter")?,
            decoder_max_line_length: get_num(config, scope, "decoder_max_line_length")?,
            charset: get_parsed(config, scope, "charset")?,
            request_timeout_millis: get_num(config, scope, "request_timeout_millis")?,
            reuse_channel: get_bool(config, scope, "reuse_channel")?,
            producer_pool_enabled: get_bool(config, scope, "producer_pool_enabled")?,
            producer_pool_max_total: get_num(config, scope, "producer_pool_max_total")?,
            producer_pool_max_idle: get_num(config, scope, "producer_pool_max_idle")?,
            producer_pool_min_idle: get_num(config, scope, "producer_pool_min_idle")?,
            producer_pool_min_evictable_idle_millis: get_num(
                config,
                scope,
                "producer_pool_min_evictable_idle_millis",
            )?,
            producer_pool_eviction_interval_millis: get_num(
                config,
                scope,
                "producer_pool_eviction_interval_millis",
            )?,
            producer_pool_block_when_exhausted: get_bool(config, scope, "producer_pool_block_when_exhausted")?,
            producer_pool_max_wait_millis: get_num(config, scope, "producer_pool_max_wait_millis")?,
            udp_connectionless_sending: get_bool(config, scope, "udp_connectionless_sending")?,
            no_reply_log_level: get_string(config, scope, "no_reply_log_level")?
                .map(|level| parse_level(&level))
                .transpose()?,
        })
    }
}

impl EndpointConfiguration {
    /// Builds a configuration from global keys, then keys namespaced by
    /// `name`, over the defaults.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let mut merged = Self::default().merge(&EndpointOverrides::from_config(config, "")?);
        if !name.is_empty() {
            merged = merged.merge(&EndpointOverrides::from_config(config, name)?);
        }
        Ok(merged)
    }

    /// Returns a copy with every `Some` field of `overrides` applied.
    pub fn merge(&self, overrides: &EndpointOverrides) -> Self {
        let mut merged = self.clone();
        merged.listener = self.listener.merge(&overrides.listener);
        if let Some(v) = overrides.sync {
            merged.sync = v;
        }
        if let Some(v) = overrides.disconnect {
            merged.disconnect = v;
        }
        if let Some(v) = overrides.disconnect_on_no_reply {
            merged.disconnect_on_no_reply = v;
        }
        if let Some(v) = overrides.lazy_channel_creation {
            merged.lazy_channel_creation = v;
        }
        if let Some(v) = overrides.textline {
            merged.textline = v;
        }
        if let Some(v) = overrides.delimiter {
            merged.delimiter = v;
        }
        if let Some(v) = overrides.auto_append_delimiter {
            merged.auto_append_delimiter = v;
        }
        if let Some(v) = overrides.decoder_max_line_length {
            merged.decoder_max_line_length = v;
        }
        if let Some(v) = overrides.charset {
            merged.charset = v;
        }
        if let Some(v) = overrides.request_timeout_millis {
            merged.request_timeout_millis = v;
        }
        if let Some(v) = overrides.reuse_channel {
            merged.reuse_channel = v;
        }
        if let Some(v) = overrides.producer_pool_enabled {
            merged.producer_pool_enabled = v;
        }
        if let Some(v) = overrides.producer_pool_max_total {
            merged.producer_pool_max_total = v;
        }
        if let Some(v) = overrides.producer_pool_max_idle {
            merged.producer_pool_max_idle = v;
        }
        if let Some(v) = overrides.producer_pool_min_idle {
            merged.producer_pool_min_idle = v;
        }
        if let Some(v) = overrides.producer_pool_min_evictable_idle_millis {
            merged.producer_pool_min_evictable_idle_millis = v;
        }
        if let Some(v) = overrides.producer_pool_eviction_interval_millis {
            merged.producer_pool_eviction_interval_millis = v;
        }
        if let Some(v) = overrides.producer_pool_block_when_exhausted {
            merged.producer_pool_block_when_exhausted = v;
        }
        if let Some(v) = overrides.producer_pool_max_wait_millis {
            merged.producer_pool_max_wait_millis = v;
        }
        if let Some(v) = overrides.udp_connectionless_sending {
            merged.udp_connectionless_sending = v;
        }
        if let Some(v) = overrides.no_reply_log_level {
            merged.no_reply_log_level = v;
        }
        merged
    }

    pub fn address(&self) -> String {
        self.listener.address()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_millis > 0).then(|| Duration::from_millis(self.request_timeout_millis))
    }
}
