//! Threads outside the event loops: a naming thread factory, a fixed worker
//! pool and a fixed-rate scheduler.

use crate::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A unit of work for a [`WorkerPool`].
pub type Job = Box<dyn FnOnce() + Send>;

fn join_all(handles: Vec<JoinHandle<()>>) {
    let current = thread::current().id();
    for handle in handles {
        // A pool shut down from one of its own threads cannot join itself.
        if handle.thread().id() == current {
            continue;
        }
        if handle.join().is_err() {
            warn!("Pool thread panicked");
        }
    }
}

// ============================================================================
// ThreadFactory
// ============================================================================

/// Spawns named threads: `{prefix}-{role}-{n}`.
#[derive(Debug, Clone)]
pub struct ThreadFactory {
    prefix: Arc<str>,
    counter: Arc<AtomicUsize>,
}

impl ThreadFactory {
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: Arc::from(prefix.as_ref()),
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn spawn<F>(&self, role: &str, f: F) -> Result<JoinHandle<()>, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{role}-{n}", self.prefix);
        Ok(thread::Builder::new().name(name).spawn(f)?)
    }
}

impl Default for ThreadFactory {
    fn default() -> Self {
        Self::new("sockbridge")
    }
}

// ============================================================================
// WorkerPool
// ============================================================================

/// Fixed set of threads draining a shared job queue.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, threads: &ThreadFactory) -> Result<Self, Error> {
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let receiver = Arc::clone(&receiver);
            handles.push(threads.spawn(name, move || Self::work(receiver))?);
        }
        debug!(name, size = handles.len(), "Started worker pool");
        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        })
    }

    fn work(receiver: Arc<Mutex<Receiver<Job>>>) {
        loop {
            let job = receiver.lock().unwrap().recv();
            match job {
                Ok(job) => {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Worker job panicked");
                    }
                }
                // Sender dropped and queue drained.
                Err(_) => break,
            }
        }
    }

    /// Queues `job`. Hands the job back when the pool is shut down.
    pub fn execute(&self, job: Job) -> Result<(), Job> {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(job).map_err(|err| err.0),
            None => Err(job),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }

    /// Stops accepting jobs, runs the queued ones and joins the threads.
    pub fn shutdown(&self) {
        if self.sender.lock().unwrap().take().is_none() {
            return;
        }
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        join_all(handles);
        debug!(name = %self.name, "Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct ScheduledTask {
    id: u64,
    next_run: Instant,
    interval: Duration,
    task: Box<dyn FnMut() + Send>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: Vec<ScheduledTask>,
    next_id: u64,
    running: Option<u64>,
    running_cancelled: bool,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// Shortest period a [`Scheduler`] runs a task at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Single thread running tasks at a fixed rate.
///
/// Tasks run on the scheduler thread and must not block; hand long work to a
/// [`WorkerPool`].
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Cancels its task when [`cancel`](TaskHandle::cancel) is called. Dropping
/// the handle leaves the task scheduled.
#[derive(Debug)]
pub struct TaskHandle {
    id: u64,
    shared: Weak<SchedulerShared>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        state.tasks.retain(|task| task.id != self.id);
        if state.running == Some(self.id) {
            state.running_cancelled = true;
        }
    }
}

impl Scheduler {
    pub fn new(name: &str, threads: &ThreadFactory) -> Result<Self, Error> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
        });
        let runner = Arc::clone(&shared);
        let handle = threads.spawn(name, move || Self::run(&runner))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Runs `task` every `interval`, first after one interval. Intervals
    /// below [`MIN_INTERVAL`] are raised to it.
    pub fn schedule_at_fixed_rate<F>(&self, interval: Duration, task: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let mut state = self.shared.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.tasks.push(ScheduledTask {
            id,
            next_run: Instant::now() + interval,
            interval,
            task: Box::new(task),
        });
        self.shared.wakeup.notify_one();
        TaskHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn run(shared: &SchedulerShared) {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.shutdown {
                break;
            }
            let now = Instant::now();
            let due = state
                .tasks
                .iter()
                .enumerate()
                .min_by_key(|(_, task)| task.next_run)
                .map(|(index, task)| (index, task.next_run));
            match due {
                None => {
                    state = shared.wakeup.wait(state).unwrap();
                }
                Some((_, next_run)) if next_run > now => {
                    state = shared.wakeup.wait_timeout(state, next_run - now).unwrap().0;
                }
                Some((index, _)) => {
                    let mut task = state.tasks.swap_remove(index);
                    state.running = Some(task.id);
                    state.running_cancelled = false;
                    drop(state);

                    if catch_unwind(AssertUnwindSafe(&mut task.task)).is_err() {
                        error!(task = task.id, "Scheduled task panicked");
                    }

                    state = shared.state.lock().unwrap();
                    state.running = None;
                    if !state.running_cancelled {
                        task.next_run += task.interval;
                        let now = Instant::now();
                        if task.next_run < now {
                            task.next_run = now + task.interval;
                        }
                        state.tasks.push(task);
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.tasks.clear();
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            join_all(vec![handle]);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
