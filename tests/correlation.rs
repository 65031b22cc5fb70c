//! Exactly-once completion and the correlation managers.

mod common;

use common::*;
use config::Config;
use sockbridge::prelude::*;
use sockbridge::{
    ChannelCorrelationManager, Exchange, PendingExchange, Scheduler, MIN_INTERVAL, REQUEST_TIMEOUT_HEADER,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

fn counted(exchange: Exchange, request: &[u8]) -> (Arc<PendingExchange>, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let state = PendingExchange::new(
        exchange,
        request.to_vec(),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    (Arc::new(state), fired)
}

/// Like [`counted`], but keeps the `done_sync` flag of every callback.
fn recorded(exchange: Exchange, request: &[u8]) -> (Arc<PendingExchange>, Arc<Mutex<Vec<bool>>>) {
    let flags = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&flags);
    let state = PendingExchange::new(
        exchange,
        request.to_vec(),
        Box::new(move |done_sync| sink.lock().unwrap().push(done_sync)),
    );
    (Arc::new(state), flags)
}

/// Correlation id is the first whitespace-separated token.
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
}

struct WithFallback;

impl CorrelationIdResolver for WithFallback {
    fn request_correlation_id(&self, request: &[u8]) -> Option<String> {
        LeadingToken.request_correlation_id(request)
    }

    fn response_correlation_id(&self, response: &[u8]) -> Option<String> {
        LeadingToken.response_correlation_id(response)
    }

    fn timeout_response(&self, id: &str, _request: &[u8]) -> Option<Vec<u8>> {
        Some(format!("{id} timed out").into_bytes())
    }
}

// Any live channel serves as the correlation key.
fn some_channel() -> (ExclusiveBootstrapFactory, Channel) {
    let (server, _) = start_server(
        listener_config(Protocol::Tcp),
        raw_factory(Arc::new(SilentHandler::default())),
    );
    let channel = server.channel().expect("listener channel");
    (server, channel)
}

// ============================================================================
// PendingExchange
// ============================================================================

#[test]
fn racing_completions_fire_callback_once() {
    init_tracing();
    for _ in 0..20 {
        let exchange = Exchange::in_out("ping");
        let (state, fired) = counted(exchange.clone(), b"ping");
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    match i % 3 {
                        0 => state.complete_with_reply(b"pong".to_vec()),
                        1 => state.fail_once(Arc::new(Error::ChannelClosed), false),
                        _ => state.complete(false),
                    }
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(state.is_done());
    }
}

#[test]
fn losing_completion_leaves_exchange_untouched() {
    let exchange = Exchange::in_out("ping");
    let (state, fired) = counted(exchange.clone(), b"ping");

    assert!(state.fail_once(Arc::new(Error::ChannelClosed), false));
    assert!(!state.complete_with_reply(b"late".to_vec()));
    assert!(!state.fail_once(Arc::new(Error::NoResponse { address: "x".into() }), false));

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(exchange.body().unwrap(), b"ping");
    assert!(matches!(*exchange.exception().unwrap(), Error::ChannelClosed));
}

#[test]
fn callback_receives_done_sync_flag() {
    let seen = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&seen);
    let state = PendingExchange::new(
        Exchange::in_only("x"),
        b"x".to_vec(),
        Box::new(move |done_sync| {
            flag.store(if done_sync { 2 } else { 1 }, Ordering::SeqCst);
        }),
    );
    state.complete(true);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

// ============================================================================
// ChannelCorrelationManager
// ============================================================================

#[test]
fn channel_manager_allows_one_pending_state_per_channel() {
    init_tracing();
    let (_server, channel) = some_channel();
    let manager = ChannelCorrelationManager::new();

    let (first, _) = counted(Exchange::in_out("a"), b"a");
    let (second, _) = counted(Exchange::in_out("b"), b"b");
    manager.put_state(&channel, Arc::clone(&first)).unwrap();
    assert!(matches!(
        manager.put_state(&channel, Arc::clone(&second)),
        Err(Error::ChannelBusy { .. })
    ));

    let found = manager.get_state_for_message(&channel, b"reply").unwrap();
    assert!(Arc::ptr_eq(&found, &first));

    // A completed state may be replaced.
    first.complete(false);
    manager.put_state(&channel, Arc::clone(&second)).unwrap();

    // Discarding a stale state leaves the current one.
    manager.discard_state(&channel, &first);
    assert_eq!(manager.len(), 1);
    manager.discard_state(&channel, &second);
    assert!(manager.is_empty());
}

#[test]
fn channel_manager_routes_errors_and_removal() {
    let (_server, channel) = some_channel();
    let manager = ChannelCorrelationManager::new();
    let (state, fired) = counted(Exchange::in_out("a"), b"a");
    manager.put_state(&channel, Arc::clone(&state)).unwrap();

    let found = manager
        .get_state_for_error(&channel, &Error::ReadTimeout { millis: 5 })
        .unwrap();
    assert!(Arc::ptr_eq(&found, &state));

    manager.remove_state(&channel);
    assert!(manager.get_state_for_message(&channel, b"x").is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

// ============================================================================
// TimeoutCorrelationManager
// ============================================================================

#[test]
fn timeout_manager_matches_replies_by_id() {
    init_tracing();
    let (_server, channel) = some_channel();
    let manager = TimeoutCorrelationManager::new(Arc::new(LeadingToken));
    manager.start().unwrap();

    let (one, _) = counted(Exchange::in_out("REQ-1 hello"), b"REQ-1 hello");
    let (two, _) = counted(Exchange::in_out("REQ-2 hello"), b"REQ-2 hello");
    manager.put_state(&channel, Arc::clone(&one)).unwrap();
    manager.put_state(&channel, Arc::clone(&two)).unwrap();
    assert_eq!(manager.pending(), 2);
    assert_eq!(one.correlation_id().as_deref(), Some("REQ-1"));

    let found = manager.get_state_for_message(&channel, b"REQ-2 world").unwrap();
    assert!(Arc::ptr_eq(&found, &two));
    assert!(manager.get_state_for_message(&channel, b"REQ-9 world").is_none());
    assert!(manager.get_state_for_message(&channel, b"").is_none());
    assert!(manager
        .get_state_for_error(&channel, &Error::ChannelClosed)
        .is_none());

    manager.discard_state(&channel, &one);
    assert_eq!(manager.pending(), 0);
    manager.stop();
}

#[test]
fn timeout_manager_refuses_duplicates_and_missing_ids() {
    let (_server, channel) = some_channel();
    let manager = TimeoutCorrelationManager::new(Arc::new(LeadingToken));

    let (first, _) = counted(Exchange::in_out("A x"), b"A x");
    let (dup, _) = counted(Exchange::in_out("A y"), b"A y");
    manager.put_state(&channel, first).unwrap();
    assert!(matches!(
        manager.put_state(&channel, dup),
        Err(Error::DuplicateCorrelationId { id }) if id == "A"
    ));

    let (blank, _) = counted(Exchange::in_out("   "), b"   ");
    assert!(matches!(
        manager.put_state(&channel, blank),
        Err(Error::MissingCorrelationId)
    ));
}

#[test]
fn expired_requests_fail_with_request_timeout() {
    init_tracing();
    let manager = TimeoutCorrelationManager::new(Arc::new(LeadingToken))
        .with_timeout(Duration::from_millis(50))
        .with_check_interval(Duration::from_millis(10))
        .with_thread_factory(threads("timeouts"));
    manager.start().unwrap();

    let exchange = Exchange::in_out("T-1 hi");
    let (state, fired) = counted(exchange.clone(), b"T-1 hi");
    manager.put("T-1", state, Duration::from_millis(50)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
    let cause = exchange.exception().expect("timeout recorded");
    assert!(matches!(&*cause, Error::RequestTimeout { correlation_id, .. } if correlation_id == "T-1"));
    assert!(cause.is_timeout());
    assert_eq!(manager.pending(), 0);
    manager.stop();
}

#[test]
fn eviction_completes_asynchronously() {
    init_tracing();
    let manager = TimeoutCorrelationManager::new(Arc::new(LeadingToken))
        .with_check_interval(Duration::from_millis(10))
        .with_thread_factory(threads("evict-flag"));
    manager.start().unwrap();

    let (state, flags) = recorded(Exchange::in_out("F-1 hi"), b"F-1 hi");
    manager.put("F-1", state, Duration::from_millis(20)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || !flags.lock().unwrap().is_empty()));
    assert_eq!(*flags.lock().unwrap(), vec![false]);
    manager.stop();
}

#[test]
fn reply_racing_eviction_completes_once() {
    init_tracing();
    let (_server, channel) = some_channel();
    let manager = Arc::new(
        TimeoutCorrelationManager::new(Arc::new(LeadingToken))
            .with_check_interval(Duration::from_millis(1))
            .with_thread_factory(threads("evict-race")),
    );
    manager.start().unwrap();

    for round in 0..40u64 {
        let id = format!("R-{round}");
        let exchange = Exchange::in_out(format!("{id} hi"));
        let (state, flags) = recorded(exchange.clone(), format!("{id} hi").as_bytes());
        manager
            .put(&id, state, Duration::from_millis(round % 4))
            .unwrap();

        // Reply path as the producer handler takes it.
        let replier = {
            let manager = Arc::clone(&manager);
            let channel = channel.clone();
            let reply = format!("{id} ok");
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(round % 3));
                if let Some(state) = manager.get_state_for_message(&channel, reply.as_bytes()) {
                    state.complete_with_reply(reply.into_bytes());
                }
            })
        };
        replier.join().unwrap();

        assert!(wait_until(Duration::from_secs(2), || !flags.lock().unwrap().is_empty()));
        thread::sleep(Duration::from_millis(5));
        assert_eq!(*flags.lock().unwrap(), vec![false], "round {round}");
        match exchange.exception() {
            Some(cause) => assert!(cause.is_timeout()),
            None => assert_eq!(exchange.body_text().unwrap(), format!("{id} ok")),
        }
    }
    assert_eq!(manager.pending(), 0);
    manager.stop();
}

#[test]
fn zero_check_interval_is_raised_to_minimum() {
    let manager = TimeoutCorrelationManager::new(Arc::new(LeadingToken)).with_check_interval(Duration::ZERO);
    assert_eq!(manager.check_interval(), MIN_INTERVAL);

    let config = Config::builder()
        .set_override("correlation_check_interval_millis", 0)
        .unwrap()
        .build()
        .unwrap();
    let manager = TimeoutCorrelationManager::from_config(&config, "", Arc::new(LeadingToken)).unwrap();
    assert_eq!(manager.check_interval(), MIN_INTERVAL);
}

#[test]
fn scheduler_does_not_spin_on_zero_interval() {
    let scheduler = Scheduler::new("tick", &threads("tick")).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let task = scheduler.schedule_at_fixed_rate(Duration::ZERO, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(100));
    task.cancel();
    let runs = runs.load(Ordering::SeqCst);
    assert!(runs > 0);
    assert!(runs <= 150, "ran {runs} times in 100ms");
    scheduler.shutdown();
}

#[test]
fn timeout_response_becomes_reply_body() {
    let (_server, channel) = some_channel();
    let manager = TimeoutCorrelationManager::new(Arc::new(WithFallback))
        .with_check_interval(Duration::from_millis(10));
    manager.start().unwrap();

    let exchange = Exchange::in_out("T-2 hi");
    exchange.set_header(REQUEST_TIMEOUT_HEADER, "30");
    let (state, fired) = counted(exchange.clone(), b"T-2 hi");
    manager.put_state(&channel, state).unwrap();

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
    assert!(exchange.exception().is_none());
    assert_eq!(exchange.body_text().unwrap(), "T-2 timed out");
    manager.stop();
}

#[test]
fn stop_fails_pending_requests() {
    let manager = TimeoutCorrelationManager::new(Arc::new(LeadingToken));
    manager.start().unwrap();

    let exchange = Exchange::in_out("S-1 hi");
    let (state, fired) = counted(exchange.clone(), b"S-1 hi");
    manager.put("S-1", state, Duration::from_secs(60)).unwrap();
    manager.stop();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(matches!(*exchange.exception().unwrap(), Error::Rejected { .. }));
    assert_eq!(manager.pending(), 0);
}

#[test]
fn timeout_settings_come_from_config() {
    let config = Config::builder()
        .set_override("correlation_timeout_millis", 1500)
        .unwrap()
        .set_override("orders.correlation_check_interval_millis", 20)
        .unwrap()
        .build()
        .unwrap();

    let manager = TimeoutCorrelationManager::from_config(&config, "orders", Arc::new(LeadingToken)).unwrap();
    assert_eq!(manager.timeout(), Duration::from_millis(1500));
    assert_eq!(manager.check_interval(), Duration::from_millis(20));
    assert!(manager.manages_timeouts());
}
