//! Producer behaviour against live listeners.

mod common;

use common::*;
use futures::executor::block_on;
use sockbridge::prelude::*;
use sockbridge::{CLOSE_CHANNEL_HEADER, REQUEST_TIMEOUT_HEADER, REUSE_CHANNEL_HEADER};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn producer(config: EndpointConfiguration) -> ConnectionManager {
    let manager = ConnectionManager::builder("test-producer", config)
        .with_thread_factory(threads("producer"))
        .build();
    manager.start().unwrap();
    manager
}

fn textline(addr: SocketAddr) -> EndpointConfiguration {
    EndpointConfiguration {
        textline: true,
        ..endpoint_config(Protocol::Tcp, addr)
    }
}

/// Sends and blocks until the callback fires. Returns `(returned, done_sync)`.
fn send_and_wait(manager: &ConnectionManager, exchange: &Exchange) -> (bool, bool) {
    let (tx, rx) = mpsc::channel();
    let returned = manager.send(
        exchange,
        Box::new(move |done_sync| {
            let _ = tx.send(done_sync);
        }),
    );
    let done_sync = rx.recv_timeout(WAIT).expect("callback fired");
    (returned, done_sync)
}

fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Correlation id is the first token; the reply body is what follows it.
struct LeadingToken;

impl CorrelationIdResolver for LeadingToken {
    fn request_correlation_id(&self, request: &[u8]) -> Option<String> {
        String::from_utf8_lossy(request)
            .split_whitespace()
            .next()
            .map(str::to_string)
    }

    fn response_correlation_id(&self, response: &[u8]) -> Option<String> {
        self.request_correlation_id(response)
    }

    fn reply_body(&self, response: Vec<u8>) -> Vec<u8> {
        let text = String::from_utf8_lossy(&response);
        match text.split_once(' ') {
            Some((_, rest)) => rest.as_bytes().to_vec(),
            None => response,
        }
    }
}

/// Closes the connection instead of answering.
struct HangUp;

impl ChannelHandler for HangUp {
    fn message_received(&self, channel: &Channel, _sender: SocketAddr, _message: Vec<u8>) {
        channel.close();
    }
}

// ============================================================================
// Request/Reply
// ============================================================================

#[test]
fn textline_request_receives_reply() {
    init_tracing();
    let (server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(EchoHandler::new(b"\n")));
    let manager = producer(textline(addr));
    assert_eq!(manager.target(), Some(addr));

    let reply = block_on(manager.request(Exchange::in_out("hello"))).unwrap();
    assert_eq!(reply.body_text().unwrap(), "hello");

    manager.stop().unwrap();
    server.stop().unwrap();
}

#[test]
fn pooled_channel_is_reused() {
    init_tracing();
    let handler = EchoHandler::new(b"\n");
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(handler.clone()));
    let manager = producer(textline(addr));

    for text in ["one", "two", "three"] {
        let reply = block_on(manager.request(Exchange::in_out(text))).unwrap();
        assert_eq!(reply.body_text().unwrap(), text);
    }
    assert_eq!(handler.active.load(Ordering::SeqCst), 1);
    assert_eq!(manager.idle_channels(), 1);
    assert_eq!(manager.open_channels(), 1);
}

#[test]
fn close_header_closes_channel_after_reply() {
    init_tracing();
    let handler = EchoHandler::new(b"\n");
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(handler.clone()));
    let manager = producer(textline(addr));

    let exchange = Exchange::in_out("bye");
    exchange.set_header(CLOSE_CHANNEL_HEADER, "true");
    let reply = block_on(manager.request(exchange)).unwrap();
    assert_eq!(reply.body_text().unwrap(), "bye");
    assert_eq!(manager.idle_channels(), 0);
    assert!(wait_until(WAIT, || manager.open_channels() == 0));
    assert!(wait_until(WAIT, || handler.inactive.load(Ordering::SeqCst) == 1));

    block_on(manager.request(Exchange::in_out("hello"))).unwrap();
    assert_eq!(handler.active.load(Ordering::SeqCst), 2);
}

#[test]
fn correlated_requests_share_one_channel() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(Arc::new(WorldHandler)));
    let config = EndpointConfiguration {
        producer_pool_enabled: false,
        ..textline(addr)
    };
    let manager = Arc::new(
        ConnectionManager::builder("correlated", config)
            .with_correlation_manager(Arc::new(TimeoutCorrelationManager::new(Arc::new(LeadingToken))))
            .with_thread_factory(threads("correlated"))
            .build(),
    );
    manager.start().unwrap();

    let handles: Vec<_> = (1..=4)
        .map(|i| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || block_on(manager.request(Exchange::in_out(format!("REQ-{i} hello")))))
        })
        .collect();
    for handle in handles {
        let reply = handle.join().unwrap().unwrap();
        assert_eq!(reply.body_text().unwrap(), "world");
    }
    assert_eq!(manager.open_channels(), 1);
}

#[test]
fn fire_and_forget_completes_after_write() {
    init_tracing();
    let recorder = Arc::new(SilentHandler::default());
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(recorder.clone()));
    let manager = producer(EndpointConfiguration {
        sync: false,
        ..textline(addr)
    });

    let exchange = Exchange::in_only("note");
    let (returned, done_sync) = send_and_wait(&manager, &exchange);
    assert!(!returned);
    assert!(!done_sync);
    assert!(exchange.exception().is_none());
    assert_eq!(exchange.body_text().unwrap(), "note");
    assert!(wait_until(WAIT, || recorder.messages.lock().unwrap().len() == 1));
    assert_eq!(recorder.messages.lock().unwrap()[0], b"note");
}

#[test]
fn in_only_exchange_on_sync_endpoint_does_not_wait_for_reply() {
    init_tracing();
    let recorder = Arc::new(SilentHandler::default());
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(recorder.clone()));
    let manager = producer(textline(addr));
    assert!(manager.configuration().sync);

    let exchange = Exchange::in_only("note");
    let (returned, done_sync) = send_and_wait(&manager, &exchange);
    assert!(!returned && !done_sync);
    assert!(exchange.exception().is_none());
    assert_eq!(exchange.body_text().unwrap(), "note");
    assert!(wait_until(WAIT, || recorder.messages.lock().unwrap().len() == 1));
    assert_eq!(manager.idle_channels(), 1);
}

// ============================================================================
// Pool Limits
// ============================================================================

#[test]
fn exhausted_pool_fails_fast_when_not_blocking() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(Arc::new(SilentHandler::default())));
    let manager = producer(EndpointConfiguration {
        producer_pool_max_total: 1,
        producer_pool_block_when_exhausted: false,
        ..textline(addr)
    });

    // Never answered, so its channel stays borrowed.
    manager.send(&Exchange::in_out("first"), Box::new(|_| {}));
    assert_eq!(manager.pooled_channels(), 1);

    let exchange = Exchange::in_out("second");
    let (returned, done_sync) = send_and_wait(&manager, &exchange);
    assert!(!returned && !done_sync);
    assert!(matches!(*exchange.exception().unwrap(), Error::PoolExhausted { max_total: 1, .. }));
    assert_eq!(manager.pooled_channels(), 1);
}

#[test]
fn exhausted_pool_queues_until_a_channel_is_released() {
    init_tracing();
    let handler = EchoHandler::new(b"\n");
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(handler.clone()));
    let manager = Arc::new(producer(EndpointConfiguration {
        producer_pool_max_total: 1,
        ..textline(addr)
    }));

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || block_on(manager.request(Exchange::in_out(format!("msg-{i}")))))
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let reply = handle.join().unwrap().unwrap();
        assert_eq!(reply.body_text().unwrap(), format!("msg-{i}"));
    }
    assert_eq!(handler.active.load(Ordering::SeqCst), 1);
    assert_eq!(manager.pooled_channels(), 1);
    assert_eq!(manager.waiting_exchanges(), 0);
}

#[test]
fn queued_exchange_gives_up_after_max_wait() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(Arc::new(SilentHandler::default())));
    let manager = producer(EndpointConfiguration {
        producer_pool_max_total: 1,
        producer_pool_max_wait_millis: 50,
        ..textline(addr)
    });

    manager.send(&Exchange::in_out("first"), Box::new(|_| {}));
    let exchange = Exchange::in_out("second");
    let (returned, done_sync) = send_and_wait(&manager, &exchange);
    assert!(!returned && !done_sync);
    assert!(matches!(*exchange.exception().unwrap(), Error::PoolWaitTimeout { millis: 50, .. }));
    assert_eq!(manager.waiting_exchanges(), 0);
}

#[test]
fn idle_channels_are_evicted_after_min_evictable_idle() {
    init_tracing();
    let handler = EchoHandler::new(b"\n");
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(handler.clone()));
    let manager = producer(EndpointConfiguration {
        producer_pool_min_evictable_idle_millis: 50,
        producer_pool_eviction_interval_millis: 20,
        ..textline(addr)
    });

    block_on(manager.request(Exchange::in_out("hello"))).unwrap();
    assert_eq!(manager.idle_channels(), 1);

    assert!(wait_until(WAIT, || manager.idle_channels() == 0 && manager.open_channels() == 0));
    assert!(wait_until(WAIT, || handler.inactive.load(Ordering::SeqCst) == 1));
    assert!(wait_until(WAIT, || manager.pooled_channels() == 0));
}

#[test]
fn evictor_keeps_min_idle_channels_open() {
    init_tracing();
    let handler = EchoHandler::new(b"\n");
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(handler.clone()));
    let manager = producer(EndpointConfiguration {
        producer_pool_min_idle: 2,
        producer_pool_eviction_interval_millis: 20,
        ..textline(addr)
    });

    assert!(wait_until(WAIT, || manager.idle_channels() == 2));
    assert!(wait_until(WAIT, || handler.active.load(Ordering::SeqCst) == 2));

    // Served from an idle channel; the evictor may refill while it is out.
    let reply = block_on(manager.request(Exchange::in_out("warm"))).unwrap();
    assert_eq!(reply.body_text().unwrap(), "warm");
    assert!(manager.idle_channels() >= 2);
}

// ============================================================================
// Channel Reuse
// ============================================================================

#[test]
fn reused_channel_stays_bound_until_released() {
    init_tracing();
    let handler = EchoHandler::new(b"\n");
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(handler.clone()));
    let manager = producer(textline(addr));

    let exchange = Exchange::in_out("first");
    exchange.set_header(REUSE_CHANNEL_HEADER, "true");
    let exchange = block_on(manager.request(exchange)).unwrap();
    let bound = exchange.bound_channel().expect("bound channel");
    assert_eq!(manager.idle_channels(), 0);

    exchange.set_body("second");
    let exchange = block_on(manager.request(exchange)).unwrap();
    assert_eq!(exchange.body_text().unwrap(), "second");
    assert_eq!(exchange.bound_channel(), Some(bound.clone()));
    assert_eq!(handler.active.load(Ordering::SeqCst), 1);

    // Other exchanges cannot borrow the bound channel.
    block_on(manager.request(Exchange::in_out("other"))).unwrap();
    assert_eq!(handler.active.load(Ordering::SeqCst), 2);

    manager.release_channel(&exchange);
    assert!(exchange.bound_channel().is_none());
    assert_eq!(manager.idle_channels(), 2);
    assert!(bound.is_active());
}

#[test]
fn reuse_defers_close_until_release() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(EchoHandler::new(b"\n")));
    let manager = producer(EndpointConfiguration {
        reuse_channel: true,
        disconnect: true,
        ..textline(addr)
    });

    let exchange = block_on(manager.request(Exchange::in_out("hello"))).unwrap();
    let bound = exchange.bound_channel().expect("bound channel");
    assert!(bound.is_active());

    manager.release_channel(&exchange);
    assert!(!bound.is_active());
    assert!(wait_until(WAIT, || manager.open_channels() == 0));
    assert_eq!(manager.idle_channels(), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn send_is_rejected_unless_started() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(EchoHandler::new(b"\n")));
    let manager = ConnectionManager::builder("lifecycle", textline(addr))
        .with_thread_factory(threads("lifecycle"))
        .build();

    let exchange = Exchange::in_out("early");
    let (returned, done_sync) = send_and_wait(&manager, &exchange);
    assert!(returned && done_sync);
    assert!(matches!(*exchange.exception().unwrap(), Error::Rejected { .. }));

    manager.start().unwrap();
    manager.suspend().unwrap();
    let exchange = Exchange::in_out("suspended");
    send_and_wait(&manager, &exchange);
    assert!(matches!(*exchange.exception().unwrap(), Error::Rejected { .. }));

    manager.resume().unwrap();
    assert!(block_on(manager.request(Exchange::in_out("ok"))).is_ok());

    manager.stop().unwrap();
    let exchange = Exchange::in_out("late");
    send_and_wait(&manager, &exchange);
    assert!(matches!(*exchange.exception().unwrap(), Error::Rejected { .. }));
}

#[test]
fn unreachable_target_fails_the_exchange() {
    init_tracing();
    let manager = producer(textline(unused_addr()));

    let exchange = Exchange::in_out("anyone?");
    let (returned, done_sync) = send_and_wait(&manager, &exchange);
    assert!(!returned);
    assert!(!done_sync);
    assert!(matches!(*exchange.exception().unwrap(), Error::ConnectFailed { .. }));
}

#[test]
fn eager_start_checks_connectivity() {
    init_tracing();
    let manager = ConnectionManager::builder(
        "eager",
        EndpointConfiguration {
            lazy_channel_creation: false,
            ..textline(unused_addr())
        },
    )
    .with_thread_factory(threads("eager"))
    .build();

    assert!(matches!(manager.start(), Err(Error::ConnectFailed { .. })));
    assert_eq!(manager.state(), ServiceState::Created);
}

#[test]
fn silent_server_triggers_read_timeout() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(Arc::new(SilentHandler::default())));
    let manager = producer(EndpointConfiguration {
        request_timeout_millis: 100,
        ..textline(addr)
    });

    let err = block_on(manager.request(Exchange::in_out("hello?"))).unwrap_err();
    match err {
        Error::Shared(cause) => assert!(matches!(*cause, Error::ReadTimeout { millis: 100 })),
        other => panic!("unexpected error: {other}"),
    }
    assert!(wait_until(WAIT, || manager.open_channels() == 0));
}

#[test]
fn timeout_header_keeps_channel_when_configured() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(Arc::new(SilentHandler::default())));
    let manager = producer(EndpointConfiguration {
        disconnect_on_no_reply: false,
        ..textline(addr)
    });

    let exchange = Exchange::in_out("hello?");
    exchange.set_header(REQUEST_TIMEOUT_HEADER, "50");
    let err = block_on(manager.request(exchange)).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(manager.open_channels(), 1);
}

#[test]
fn peer_hang_up_reports_no_response() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(Arc::new(HangUp)));
    let manager = producer(textline(addr));

    let err = block_on(manager.request(Exchange::in_out("hello"))).unwrap_err();
    match err {
        Error::Shared(cause) => assert!(matches!(*cause, Error::NoResponse { .. })),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn empty_payload_completes_synchronously() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(EchoHandler::new(b"\n")));
    let manager = producer(textline(addr));

    let exchange = Exchange::in_out(Vec::new());
    let (returned, done_sync) = send_and_wait(&manager, &exchange);
    assert!(returned && done_sync);
    assert!(exchange.exception().is_none());
    assert_eq!(manager.open_channels(), 0);
}

#[test]
fn unencodable_text_fails_synchronously() {
    let (_server, addr) = start_server(listener_config(Protocol::Tcp), line_factory(EchoHandler::new(b"\n")));
    let manager = producer(EndpointConfiguration {
        charset: sockbridge::Charset::Ascii,
        ..textline(addr)
    });

    let exchange = Exchange::in_out("né");
    let (returned, done_sync) = send_and_wait(&manager, &exchange);
    assert!(returned && done_sync);
    assert!(matches!(*exchange.exception().unwrap(), Error::InvalidText { .. }));
}

// ============================================================================
// Datagrams
// ============================================================================

#[test]
fn udp_request_receives_reply() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Udp), raw_factory(EchoHandler::new(b" pong")));
    let manager = producer(endpoint_config(Protocol::Udp, addr));

    let reply = block_on(manager.request(Exchange::in_out("ping"))).unwrap();
    assert_eq!(reply.body_text().unwrap(), "ping pong");
}

#[test]
fn connectionless_udp_sends_to_target() {
    init_tracing();
    let (_server, addr) = start_server(listener_config(Protocol::Udp), raw_factory(EchoHandler::new(b"")));
    let manager = producer(EndpointConfiguration {
        udp_connectionless_sending: true,
        ..endpoint_config(Protocol::Udp, addr)
    });

    let reply = block_on(manager.request(Exchange::in_out("datagram"))).unwrap();
    assert_eq!(reply.body_text().unwrap(), "datagram");
}
