//! Correlation of replies and errors with in-flight requests.
//!
//! A [`CorrelationManager`] decides which [`PendingExchange`] an inbound
//! message or an error belongs to. [`ChannelCorrelationManager`] allows one
//! outstanding request per channel; [`TimeoutCorrelationManager`] matches
//! replies by an id carried in the payload and evicts requests whose
//! deadline passed.

mod channel;
mod state;
mod timeout;

pub use channel::ChannelCorrelationManager;
pub use state::PendingExchange;
pub use timeout::{CorrelationIdResolver, TimeoutCorrelationManager};

use crate::error::Error;
use crate::transport::Channel;
use std::sync::Arc;

pub trait CorrelationManager: Send + Sync {
    /// Registers `state` as waiting for a reply on `channel`.
    fn put_state(&self, channel: &Channel, state: Arc<PendingExchange>) -> Result<(), Error>;

    /// The state an inbound `message` on `channel` answers.
    fn get_state_for_message(&self, channel: &Channel, message: &[u8]) -> Option<Arc<PendingExchange>>;

    /// The state a failure on `channel` should be reported to.
    fn get_state_for_error(&self, channel: &Channel, cause: &Error) -> Option<Arc<PendingExchange>>;

    /// Drops whatever is associated with `channel` without completing it.
    fn remove_state(&self, channel: &Channel);

    /// Drops exactly `state`, if it is still registered.
    fn discard_state(&self, channel: &Channel, state: &Arc<PendingExchange>);

    /// Body to store on the exchange for a reply `message`.
    fn reply_body(&self, message: Vec<u8>) -> Vec<u8> {
        message
    }

    /// When true the producer does not arm read timeouts on its channels.
    fn manages_timeouts(&self) -> bool {
        false
    }

    fn start(&self) -> Result<(), Error> {
        Ok(())
    }

    fn stop(&self) {}
}
