use super::{CorrelationManager, PendingExchange};
use crate::config::get_namespaced_u64;
use crate::error::{Error, SharedError};
use crate::exchange::REQUEST_TIMEOUT_HEADER;
use crate::executor::{Scheduler, TaskHandle, ThreadFactory, WorkerPool, MIN_INTERVAL};
use crate::transport::Channel;
use ::config::{Config, ConfigError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const EVICTION_WORKERS: usize = 1;

/// Extracts correlation ids from payloads.
pub trait CorrelationIdResolver: Send + Sync {
    /// Id of an outbound request. `None` rejects the send.
    fn request_correlation_id(&self, request: &[u8]) -> Option<String>;

    /// Id of an inbound reply. `None` makes the reply unroutable.
    fn response_correlation_id(&self, response: &[u8]) -> Option<String>;

    /// Reply to deliver when the request with `id` times out. `None` fails
    /// the exchange with [`Error::RequestTimeout`].
    fn timeout_response(&self, _id: &str, _request: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Body to store on the exchange for a correlated `response`.
    fn reply_body(&self, response: Vec<u8>) -> Vec<u8> {
        response
    }
}

struct Entry {
    state: Arc<PendingExchange>,
    deadline: Instant,
    timeout: Duration,
}

struct Shared {
    resolver: Arc<dyn CorrelationIdResolver>,
    entries: Mutex<HashMap<String, Entry>>,
}

#[derive(Default)]
struct Resources {
    scheduler: Option<Arc<Scheduler>>,
    owns_scheduler: bool,
    workers: Option<Arc<WorkerPool>>,
    owns_workers: bool,
    task: Option<TaskHandle>,
}

/// Correlates replies by an id carried in the payload and evicts requests
/// that outlive their timeout.
///
/// Several requests may be outstanding on one channel. A checker on a
/// [`Scheduler`] runs every `check_interval` and hands expired requests to a
/// [`WorkerPool`], so callbacks never run on the scheduler thread. Both are
/// created on [`start`](CorrelationManager::start) unless supplied, and only
/// what was created here is torn down on stop.
///
/// The per-request timeout is the `sockbridge.request_timeout` header of the
/// exchange, falling back to the configured default.
pub struct TimeoutCorrelationManager {
    shared: Arc<Shared>,
    timeout: Duration,
    check_interval: Duration,
    threads: ThreadFactory,
    resources: Mutex<Resources>,
}

impl TimeoutCorrelationManager {
    pub fn new(resolver: Arc<dyn CorrelationIdResolver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                resolver,
                entries: Mutex::new(HashMap::new()),
            }),
            timeout: DEFAULT_TIMEOUT,
            check_interval: DEFAULT_CHECK_INTERVAL,
            threads: ThreadFactory::default(),
            resources: Mutex::new(Resources::default()),
        }
    }

    /// Reads `correlation_timeout_millis` and
    /// `correlation_check_interval_millis`, namespaced by `name`.
    pub fn from_config(
        config: &Config,
        name: &str,
        resolver: Arc<dyn CorrelationIdResolver>,
    ) -> Result<Self, Error> {
        let millis = |key: &str| match get_namespaced_u64(config, name, key) {
            Ok(value) => Ok(Some(Duration::from_millis(value))),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(err) => Err(Error::from(err)),
        };
        let mut manager = Self::new(resolver);
        if let Some(timeout) = millis("correlation_timeout_millis")? {
            manager.timeout = timeout;
        }
        if let Some(interval) = millis("correlation_check_interval_millis")? {
            manager = manager.with_check_interval(interval);
        }
        Ok(manager)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// At least [`MIN_INTERVAL`]; a zero interval would keep the checker
    /// busy.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_scheduler(self, scheduler: Arc<Scheduler>) -> Self {
        {
            let mut resources = self.resources.lock().unwrap();
            resources.scheduler = Some(scheduler);
            resources.owns_scheduler = false;
        }
        self
    }

    pub fn with_worker_pool(self, workers: Arc<WorkerPool>) -> Self {
        {
            let mut resources = self.resources.lock().unwrap();
            resources.workers = Some(workers);
            resources.owns_workers = false;
        }
        self
    }

    pub fn with_thread_factory(mut self, threads: ThreadFactory) -> Self {
        self.threads = threads;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Number of requests waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    /// Registers `state` under `id` until a reply arrives or `timeout` passes.
    pub fn put(&self, id: &str, state: Arc<PendingExchange>, timeout: Duration) -> Result<(), Error> {
        let mut entries = self.shared.entries.lock().unwrap();
        if entries.contains_key(id) {
            return Err(Error::DuplicateCorrelationId { id: id.to_string() });
        }
        state.set_correlation_id(id);
        debug!(correlation_id = id, timeout_millis = timeout.as_millis() as u64, "Registered pending exchange");
        entries.insert(
            id.to_string(),
            Entry {
                state,
                deadline: Instant::now() + timeout,
                timeout,
            },
        );
        Ok(())
    }

    /// Removes and returns the state registered under `id`.
    pub fn remove(&self, id: &str) -> Option<Arc<PendingExchange>> {
        self.shared
            .entries
            .lock()
            .unwrap()
            .remove(id)
            .map(|entry| entry.state)
    }
}

impl Shared {
    #[instrument(skip_all)]
    fn evict_expired(&self, workers: &WorkerPool) {
        let now = Instant::now();
        let expired: Vec<(String, Entry)> = {
            let mut entries = self.entries.lock().unwrap();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in expired {
            let millis = entry.timeout.as_millis() as u64;
            info!(correlation_id = %id, millis, "Evicting timed out exchange");
            let resolver = Arc::clone(&self.resolver);
            let job = Box::new(move || {
                let state = entry.state;
                match resolver.timeout_response(&id, state.request()) {
                    Some(body) => {
                        state.complete_with_reply(body);
                    }
                    None => {
                        state.fail_once(
                            Arc::new(Error::RequestTimeout {
                                correlation_id: id,
                                millis,
                            }),
                            false,
                        );
                    }
                }
            });
            if let Err(job) = workers.execute(job) {
                warn!("Eviction pool shut down, completing on checker thread");
                job();
            }
        }
    }
}

impl CorrelationManager for TimeoutCorrelationManager {
    fn put_state(&self, _channel: &Channel, state: Arc<PendingExchange>) -> Result<(), Error> {
        let id = self
            .shared
            .resolver
            .request_correlation_id(state.request())
            .ok_or(Error::MissingCorrelationId)?;
        let timeout = state
            .exchange()
            .header_millis(REQUEST_TIMEOUT_HEADER)
            .unwrap_or(self.timeout);
        self.put(&id, state, timeout)
    }

    fn get_state_for_message(&self, channel: &Channel, message: &[u8]) -> Option<Arc<PendingExchange>> {
        let Some(id) = self.shared.resolver.response_correlation_id(message) else {
            warn!(channel = %channel.id(), "Reply carries no correlation id, dropping");
            return None;
        };
        let state = self.remove(&id);
        if state.is_none() {
            warn!(channel = %channel.id(), correlation_id = %id, "No pending exchange for reply");
        }
        state
    }

    // Errors carry no correlation id; affected requests time out instead.
    fn get_state_for_error(&self, _channel: &Channel, _cause: &Error) -> Option<Arc<PendingExchange>> {
        None
    }

    fn remove_state(&self, _channel: &Channel) {}

    fn discard_state(&self, _channel: &Channel, state: &Arc<PendingExchange>) {
        let Some(id) = state.correlation_id() else {
            return;
        };
        let mut entries = self.shared.entries.lock().unwrap();
        if entries
            .get(&id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.state, state))
        {
            entries.remove(&id);
        }
    }

    fn reply_body(&self, message: Vec<u8>) -> Vec<u8> {
        self.shared.resolver.reply_body(message)
    }

    fn manages_timeouts(&self) -> bool {
        true
    }

    #[instrument(skip(self))]
    fn start(&self) -> Result<(), Error> {
        let mut resources = self.resources.lock().unwrap();
        if resources.task.is_some() {
            return Ok(());
        }
        if resources.scheduler.is_none() {
            resources.scheduler = Some(Arc::new(Scheduler::new("correlation-timeout", &self.threads)?));
            resources.owns_scheduler = true;
        }
        if resources.workers.is_none() {
            resources.workers = Some(Arc::new(WorkerPool::new(
                "correlation-eviction",
                EVICTION_WORKERS,
                &self.threads,
            )?));
            resources.owns_workers = true;
        }
        let (Some(scheduler), Some(workers)) = (&resources.scheduler, &resources.workers) else {
            return Ok(());
        };

        let shared = Arc::clone(&self.shared);
        let workers = Arc::clone(workers);
        let task = scheduler.schedule_at_fixed_rate(self.check_interval, move || {
            shared.evict_expired(&workers);
        });
        resources.task = Some(task);
        debug!(
            timeout_millis = self.timeout.as_millis() as u64,
            check_interval_millis = self.check_interval.as_millis() as u64,
            "Started correlation timeout checker"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    fn stop(&self) {
        let mut resources = self.resources.lock().unwrap();
        if let Some(task) = resources.task.take() {
            task.cancel();
        }

        let drained: Vec<Entry> = {
            let mut entries = self.shared.entries.lock().unwrap();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "Failing pending exchanges on stop");
        }
        let rejected: SharedError = Arc::new(Error::Rejected {
            target: "correlation manager".to_string(),
        });
        for entry in drained {
            entry.state.fail_once(Arc::clone(&rejected), false);
        }

        if resources.owns_scheduler {
            if let Some(scheduler) = resources.scheduler.take() {
                scheduler.shutdown();
            }
            resources.owns_scheduler = false;
        }
        if resources.owns_workers {
            if let Some(workers) = resources.workers.take() {
                workers.shutdown();
            }
            resources.owns_workers = false;
        }
    }
}
