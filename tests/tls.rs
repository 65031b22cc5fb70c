//! TLS between a listener and a producer using a self-signed certificate.

mod common;

use common::*;
use futures::executor::block_on;
use sockbridge::prelude::*;
use sockbridge::{LineDecoder, PemTlsContextProvider, TextlineDelimiter, TlsContextProvider, TlsMode};
use std::net::SocketAddr;
use std::sync::Arc;

fn tls_server(certs: &TlsCertGuard) -> (ExclusiveBootstrapFactory, SocketAddr) {
    let config = ListenerConfiguration {
        ssl: true,
        tls_server_cert: Some(certs.cert_path()),
        tls_server_key: Some(certs.key_path()),
        ..listener_config(Protocol::Tcp)
    };
    let provider = Arc::new(PemTlsContextProvider::from_configuration(&config).unwrap());
    assert!(provider.has_server());

    let codecs = CodecChain::new().with_decoder(sockbridge::DecoderStage::per_channel(|| {
        LineDecoder::new(TextlineDelimiter::Line, 1024)
    }));
    let factory = DefaultPipelineFactory::new(codecs, EchoHandler::new(b"\n")).with_tls(provider, TlsMode::Server);
    start_server(config, Arc::new(factory))
}

fn tls_producer(addr: SocketAddr, certs: &TlsCertGuard, server_name: &str) -> ConnectionManager {
    let mut config = endpoint_config(Protocol::Tcp, addr);
    config.textline = true;
    config.listener.ssl = true;
    config.listener.tls_ca_cert = Some(certs.cert_path());
    config.listener.tls_server_name = Some(server_name.to_string());

    let manager = ConnectionManager::builder("tls-producer", config)
        .with_thread_factory(threads("tls"))
        .build();
    manager.start().unwrap();
    manager
}

#[test]
fn tls_request_receives_reply() {
    init_tracing();
    let certs = create_temp_cert_files();
    let (server, addr) = tls_server(&certs);
    let manager = tls_producer(addr, &certs, "localhost");

    let reply = block_on(manager.request(Exchange::in_out("secret"))).unwrap();
    assert_eq!(reply.body_text().unwrap(), "secret");

    // Pooled channel stays encrypted across requests.
    let reply = block_on(manager.request(Exchange::in_out("again"))).unwrap();
    assert_eq!(reply.body_text().unwrap(), "again");
    assert_eq!(manager.open_channels(), 1);

    manager.stop().unwrap();
    server.stop().unwrap();
}

#[test]
fn certificate_name_mismatch_fails_the_exchange() {
    init_tracing();
    let certs = create_temp_cert_files();
    let (_server, addr) = tls_server(&certs);
    let manager = tls_producer(addr, &certs, "example.org");

    let err = block_on(manager.request(Exchange::in_out("hello"))).unwrap_err();
    match err {
        Error::Shared(cause) => assert!(matches!(*cause, Error::ConnectFailed { .. })),
        other => panic!("unexpected error: {other}"),
    }
    assert!(wait_until(std::time::Duration::from_secs(3), || manager.open_channels() == 0));
}

#[test]
fn provider_reports_missing_material() {
    let provider = PemTlsContextProvider::default();
    assert!(matches!(
        provider.server_session(),
        Err(Error::TlsConfigMissing { side: "server" })
    ));
    assert!(matches!(
        provider.client_session("localhost"),
        Err(Error::TlsConfigMissing { side: "client" })
    ));

    let certs = create_temp_cert_files();
    let config = ListenerConfiguration {
        tls_ca_cert: Some(certs.cert_path()),
        ..ListenerConfiguration::default()
    };
    let provider = PemTlsContextProvider::from_configuration(&config).unwrap();
    assert!(provider.has_client());
    assert!(!provider.has_server());
    assert!(provider.client_session("localhost").is_ok());
}

#[test]
fn unreadable_pem_files_are_reported() {
    let config = ListenerConfiguration {
        tls_server_cert: Some("/nonexistent/cert.pem".into()),
        tls_server_key: Some("/nonexistent/key.pem".into()),
        ..ListenerConfiguration::default()
    };
    assert!(matches!(
        PemTlsContextProvider::from_configuration(&config),
        Err(Error::TlsCertificateLoad { .. })
    ));

    let certs = create_temp_cert_files();
    let config = ListenerConfiguration {
        tls_server_cert: Some(certs.key_path()),
        tls_server_key: Some(certs.key_path()),
        ..ListenerConfiguration::default()
    };
    assert!(matches!(
        PemTlsContextProvider::from_configuration(&config),
        Err(Error::TlsInvalidCertificate(_))
    ));
}
