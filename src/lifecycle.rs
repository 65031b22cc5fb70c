//! Service lifecycle shared by bootstrap factories and connection managers.
//!
//! Each component owns a [`StateCell`] and implements [`Lifecycle`] on its
//! own; there is no base type to inherit from.

use crate::error::Error;
use std::fmt;
use std::sync::Mutex;

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Created,
    Started,
    Suspended,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Created => "created",
            ServiceState::Started => "started",
            ServiceState::Suspended => "suspended",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Start/stop/suspend/resume contract.
///
/// `start` on a started service and `stop` on a stopped one are no-ops.
pub trait Lifecycle {
    fn start(&self) -> Result<(), Error>;
    fn stop(&self) -> Result<(), Error>;
    fn suspend(&self) -> Result<(), Error>;
    fn resume(&self) -> Result<(), Error>;
    fn state(&self) -> ServiceState;

    /// Whether new work may be accepted.
    fn is_run_allowed(&self) -> bool {
        self.state() == ServiceState::Started
    }
}

/// Operation requested on a [`StateCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Start,
    Suspend,
    Resume,
    Stop,
}

impl Transition {
    fn name(self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Suspend => "suspend",
            Transition::Resume => "resume",
            Transition::Stop => "stop",
        }
    }
}

/// What the caller should do after [`StateCell::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Perform the transition, then call [`StateCell::finish`] or
    /// [`StateCell::abort`].
    Proceed(ServiceState),
    /// Already in the target state.
    Noop,
}

/// Mutex-guarded state with the legal transition table.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<ServiceState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::Created),
        }
    }

    pub(crate) fn get(&self) -> ServiceState {
        *self.state.lock().unwrap()
    }

    /// Validates `transition` against the current state. Stop moves the cell
    /// to `Stopping` immediately so concurrent senders are rejected while
    /// teardown runs.
    pub(crate) fn begin(&self, transition: Transition) -> Result<Step, Error> {
        let mut state = self.state.lock().unwrap();
        let previous = *state;
        let step = match (transition, previous) {
            (Transition::Start, ServiceState::Created | ServiceState::Stopped) => {
                Step::Proceed(previous)
            }
            (Transition::Start, ServiceState::Started) => Step::Noop,
            (Transition::Suspend, ServiceState::Started) => Step::Proceed(previous),
            (Transition::Suspend, ServiceState::Suspended) => Step::Noop,
            (Transition::Resume, ServiceState::Suspended) => Step::Proceed(previous),
            (Transition::Resume, ServiceState::Started) => Step::Noop,
            (Transition::Stop, ServiceState::Started | ServiceState::Suspended) => {
                *state = ServiceState::Stopping;
                Step::Proceed(previous)
            }
            (Transition::Stop, ServiceState::Created) => {
                *state = ServiceState::Stopped;
                Step::Noop
            }
            (Transition::Stop, ServiceState::Stopped | ServiceState::Stopping) => Step::Noop,
            (transition, state) => {
                return Err(Error::InvalidState {
                    operation: transition.name(),
                    state,
                })
            }
        };
        Ok(step)
    }

    /// Commits the target state of a transition that succeeded.
    pub(crate) fn finish(&self, transition: Transition) {
        let target = match transition {
            Transition::Start | Transition::Resume => ServiceState::Started,
            Transition::Suspend => ServiceState::Suspended,
            Transition::Stop => ServiceState::Stopped,
        };
        *self.state.lock().unwrap() = target;
    }

    /// Restores `previous` after a transition failed part-way.
    pub(crate) fn abort(&self, previous: ServiceState) {
        *self.state.lock().unwrap() = previous;
    }
}
