//! TLS sessions for stream channels.
//!
//! A [`TlsContextProvider`] creates one [`TlsSession`] per channel; the event
//! loop drives it between the socket and the pipeline.

use crate::config::ListenerConfiguration;
use crate::error::Error;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::sync::Arc;

// ============================================================================
// PEM Loading
// ============================================================================

fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {path}"
        )));
    }
    Ok(chain)
}

pub(crate) fn load_tls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<ServerConfig, Error> {
    let cert_chain = load_certificates(cert_path)?;

    let key_file = File::open(key_path).map_err(|e| Error::TlsKeyLoad {
        path: key_path.to_string(),
        source: e,
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("No private key found in {key_path}")))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::Tls(e.to_string()))
}

pub(crate) fn load_tls_client_config(ca_cert_path: &str) -> Result<ClientConfig, Error> {
    let mut root_cert_store = RootCertStore::empty();
    for cert in load_certificates(ca_cert_path)? {
        root_cert_store
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth())
}

// ============================================================================
// Context Provider
// ============================================================================

/// Creates TLS sessions for new channels.
pub trait TlsContextProvider: Send + Sync {
    /// Session for an accepted channel.
    fn server_session(&self) -> Result<TlsSession, Error>;

    /// Session for an outbound channel verifying `server_name`.
    fn client_session(&self, server_name: &str) -> Result<TlsSession, Error>;
}

/// Provider backed by PEM files named in a [`ListenerConfiguration`].
///
/// Listeners need `tls_server_cert` and `tls_server_key`; producers and
/// client-mode listeners need `tls_ca_cert`. Whatever is configured is
/// loaded; asking for a side whose material is missing fails with
/// [`Error::TlsConfigMissing`].
#[derive(Debug, Clone, Default)]
pub struct PemTlsContextProvider {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
}

impl PemTlsContextProvider {
    pub fn new(server: Option<Arc<ServerConfig>>, client: Option<Arc<ClientConfig>>) -> Self {
        Self { server, client }
    }

    pub fn from_configuration(config: &ListenerConfiguration) -> Result<Self, Error> {
        let server = match (&config.tls_server_cert, &config.tls_server_key) {
            (Some(cert), Some(key)) => Some(Arc::new(load_tls_server_config(cert, key)?)),
            _ => None,
        };
        let client = match &config.tls_ca_cert {
            Some(ca) => Some(Arc::new(load_tls_client_config(ca)?)),
            None => None,
        };
        Ok(Self { server, client })
    }

    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }
}

impl TlsContextProvider for PemTlsContextProvider {
    fn server_session(&self) -> Result<TlsSession, Error> {
        let config = self
            .server
            .as_ref()
            .ok_or(Error::TlsConfigMissing { side: "server" })?;
        let connection =
            rustls::ServerConnection::new(Arc::clone(config)).map_err(|e| Error::Tls(e.to_string()))?;
        Ok(TlsSession::Server(connection))
    }

    fn client_session(&self, server_name: &str) -> Result<TlsSession, Error> {
        let config = self
            .client
            .as_ref()
            .ok_or(Error::TlsConfigMissing { side: "client" })?;
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsInvalidServerName(server_name.to_string()))?;
        let connection = rustls::ClientConnection::new(Arc::clone(config), name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(TlsSession::Client(connection))
    }
}

// ============================================================================
// Session
// ============================================================================

/// One side of a TLS connection.
pub enum TlsSession {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsSession {
    pub(crate) fn read_tls(&mut self, rd: &mut dyn Read) -> Result<usize, std::io::Error> {
        match self {
            TlsSession::Server(conn) => conn.read_tls(rd),
            TlsSession::Client(conn) => conn.read_tls(rd),
        }
    }

    pub(crate) fn write_tls(&mut self, wr: &mut dyn Write) -> Result<usize, std::io::Error> {
        match self {
            TlsSession::Server(conn) => conn.write_tls(wr),
            TlsSession::Client(conn) => conn.write_tls(wr),
        }
    }

    pub(crate) fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Server(conn) => conn.process_new_packets(),
            TlsSession::Client(conn) => conn.process_new_packets(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.wants_write(),
            TlsSession::Client(conn) => conn.wants_write(),
        }
    }

    pub(crate) fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(conn) => conn.writer(),
            TlsSession::Client(conn) => conn.writer(),
        }
    }

    pub(crate) fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(conn) => conn.reader(),
            TlsSession::Client(conn) => conn.reader(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.is_handshaking(),
            TlsSession::Client(conn) => conn.is_handshaking(),
        }
    }

    pub(crate) fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(conn) => conn.send_close_notify(),
            TlsSession::Client(conn) => conn.send_close_notify(),
        }
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match self {
            TlsSession::Server(_) => "server",
            TlsSession::Client(_) => "client",
        };
        f.debug_struct("TlsSession")
            .field("side", &side)
            .field("handshaking", &self.is_handshaking())
            .finish()
    }
}
